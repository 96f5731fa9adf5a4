//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Gratuitous/reply ARP responder (§4.8).
//!
//! `ArpResponder` is pure state and logic: it does not own a socket or a
//! transport handle. `VrrpVif` brokers the actual ARP-reception refcount
//! and packet delivery, the same layering the teacher uses to keep
//! `Instance` free of socket plumbing (`network.rs` owns the sockets,
//! `interface.rs` drives them).

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::consts::ARP_OPER_REQUEST;
use crate::mac_addr::MacAddr;
use crate::packet::ArpPacket;

#[derive(Debug)]
pub struct ArpResponder {
    virtual_mac: MacAddr,
    addresses: BTreeSet<Ipv4Addr>,
    running: bool,
}

impl ArpResponder {
    pub fn new(virtual_mac: MacAddr) -> Self {
        ArpResponder {
            virtual_mac,
            addresses: BTreeSet::new(),
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_addresses(&mut self, addresses: BTreeSet<Ipv4Addr>) {
        self.addresses = addresses;
    }

    // Marks the responder as running. Returns `true` iff the caller must
    // request ARP reception on the vif: the IP set is non-empty and the
    // responder was not already running.
    pub fn start(&mut self) -> bool {
        let should_request = !self.running && !self.addresses.is_empty();
        self.running = true;
        should_request
    }

    // Marks the responder as stopped. Returns `true` iff the caller must
    // release ARP reception on the vif.
    pub fn stop(&mut self) -> bool {
        let should_release = self.running;
        self.running = false;
        should_release
    }

    // Answers an inbound ARP request if its target IP is one of the
    // addresses this responder owns. Returns the unicast destination MAC
    // and the reply packet to send, leaving the original request's sender
    // fields in place as the reply's target fields (RFC 826).
    pub fn handle_request(
        &self,
        request: &ArpPacket,
    ) -> Option<(MacAddr, ArpPacket)> {
        if !self.running || request.operation != ARP_OPER_REQUEST {
            return None;
        }
        let target = request.target_ip();
        if !self.addresses.contains(&target) {
            return None;
        }

        let reply = ArpPacket::new(
            crate::consts::ARP_OPER_REPLY,
            self.virtual_mac,
            target,
            request.sender_hw_address,
            request.sender_ip(),
        );
        Some((MacAddr::from(request.sender_hw_address), reply))
    }
}
