//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! External FEA / config-mirror contract (§6).
//!
//! This crate treats the forwarding-engine abstraction as an external
//! collaborator: `VrrpTarget` and `VrrpVif` depend on the [`Transport`]
//! trait, never on a concrete RPC client, mirroring the way the teacher's
//! southbound layer sits behind `holo_utils::ibus` rather than being baked
//! into `Interface`/`Instance` directly.

use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::error::Error;
use crate::mac_addr::MacAddr;

pub type CompletionCb = Box<dyn FnOnce(Result<(), Error>)>;

// A link-level frame delivered by the transport: either a VRRP
// advertisement still wrapped in its Ethernet+IPv4 framing, or an ARP
// request/reply (§6 "Transport (inbound contract)").
#[derive(Clone, Debug)]
pub struct LinkFrame {
    pub ifname: String,
    pub vifname: String,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ethertype: u16,
    pub payload: Bytes,
}

// An IP-level packet delivered by the transport, after Ethernet framing has
// been stripped.
#[derive(Clone, Debug)]
pub struct IpPacket {
    pub ifname: String,
    pub vifname: String,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub proto: u8,
    pub ttl: u8,
    pub tos: u8,
    pub options: Option<Bytes>,
    pub payload: Bytes,
}

// Outbound contract exposed to the FEA (§6). `send_raw_link` is
// fire-and-forget, matching best-effort VRRP/ARP traffic. The remaining
// operations mutate OS-visible state and report completion asynchronously
// through `done`, so callers can track outstanding requests — see
// `VrrpTarget`'s pending-request counter (§9 "Shutdown sequencing").
pub trait Transport {
    fn send_raw_link(
        &mut self,
        ifname: &str,
        vifname: &str,
        src_mac: MacAddr,
        dst_mac: MacAddr,
        ethertype: u16,
        payload: Bytes,
    );

    fn create_mac(&mut self, ifname: &str, mac: MacAddr, done: CompletionCb);
    fn delete_mac(&mut self, ifname: &str, mac: MacAddr, done: CompletionCb);

    fn create_address_atomic(
        &mut self,
        ifname: &str,
        vifname: &str,
        address: Ipv4Addr,
        prefix_len: u8,
        done: CompletionCb,
    );
    fn delete_address_atomic(
        &mut self,
        ifname: &str,
        vifname: &str,
        address: Ipv4Addr,
        prefix_len: u8,
        done: CompletionCb,
    );

    fn register_receiver(
        &mut self,
        ifname: &str,
        vifname: &str,
        done: CompletionCb,
    );
    fn unregister_receiver(
        &mut self,
        ifname: &str,
        vifname: &str,
        done: CompletionCb,
    );

    fn join_multicast_group(
        &mut self,
        ifname: &str,
        vifname: &str,
        done: CompletionCb,
    );
    fn leave_multicast_group(
        &mut self,
        ifname: &str,
        vifname: &str,
        done: CompletionCb,
    );
}
