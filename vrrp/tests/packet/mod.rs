//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Wire-format tests that exercise the codec together with `VrrpVif`'s
// dispatch, rather than the codec alone (see `packet.rs`'s own
// `#[cfg(test)]` module for the encode/decode round trips).

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use bytes::Bytes;
use event_core::TimeVal;
use event_core::timer::TimerList;
use vrrp::config::{InstanceConfig, VifConfig};
use vrrp::consts::{VRRP_IP_TTL, VRRP_MULTICAST_ADDRESS, VRRP_PROTO_NUMBER};
use vrrp::interface::VrrpVif;
use vrrp::mac_addr::MacAddr;
use vrrp::packet::ArpPacket;
use vrrp::transport::{CompletionCb, IpPacket, LinkFrame, Transport};

struct RecordingTransport(Rc<RefCell<Vec<Bytes>>>);

impl Transport for RecordingTransport {
    fn send_raw_link(
        &mut self,
        _ifname: &str,
        _vifname: &str,
        _src_mac: MacAddr,
        _dst_mac: MacAddr,
        _ethertype: u16,
        payload: Bytes,
    ) {
        self.0.borrow_mut().push(payload);
    }
    fn create_mac(&mut self, _ifname: &str, _mac: MacAddr, done: CompletionCb) {
        done(Ok(()));
    }
    fn delete_mac(&mut self, _ifname: &str, _mac: MacAddr, done: CompletionCb) {
        done(Ok(()));
    }
    fn create_address_atomic(
        &mut self,
        _ifname: &str,
        _vifname: &str,
        _address: Ipv4Addr,
        _prefix_len: u8,
        done: CompletionCb,
    ) {
        done(Ok(()));
    }
    fn delete_address_atomic(
        &mut self,
        _ifname: &str,
        _vifname: &str,
        _address: Ipv4Addr,
        _prefix_len: u8,
        done: CompletionCb,
    ) {
        done(Ok(()));
    }
    fn register_receiver(&mut self, _ifname: &str, _vifname: &str, done: CompletionCb) {
        done(Ok(()));
    }
    fn unregister_receiver(&mut self, _ifname: &str, _vifname: &str, done: CompletionCb) {
        done(Ok(()));
    }
    fn join_multicast_group(&mut self, _ifname: &str, _vifname: &str, done: CompletionCb) {
        done(Ok(()));
    }
    fn leave_multicast_group(&mut self, _ifname: &str, _vifname: &str, done: CompletionCb) {
        done(Ok(()));
    }
}

fn backup_vif(sent: Rc<RefCell<Vec<Bytes>>>) -> VrrpVif {
    let timers = Rc::new(RefCell::new(TimerList::new()));
    let mut vif = VrrpVif::new(
        "eth0".to_string(),
        "eth0".to_string(),
        Box::new(RecordingTransport(sent)),
        timers,
    );
    let mut cfg = VifConfig {
        enabled: true,
        addresses: vec!["192.168.100.2/24".parse().unwrap()],
        instances: Default::default(),
    };
    let mut icfg = InstanceConfig::default();
    icfg.priority = 30;
    icfg.virtual_addresses.insert(Ipv4Addr::new(10, 0, 1, 5), 24);
    cfg.instances.insert(51, icfg);
    vif.configure(&cfg, TimeVal::ZERO);
    vif
}

// A captured-looking VRRP v2 advertisement (vrid 51, priority 30) riding
// bare on the wire, with its checksum precomputed.
const ADVERTISEMENT: [u8; 20] = [
    0x21, 0x33, 0x1e, 0x01, 0x00, 0x01, 0xb5, 0xc5, 0x0a, 0x00, 0x01, 0x05,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[test]
fn higher_priority_wire_advertisement_keeps_backup_waiting() {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let mut vif = backup_vif(sent.clone());

    // Bump the captured advertisement's priority to a value that
    // unambiguously beats our own configured 30; a backup never
    // transitions on receipt, only on its own master-down expiry, so
    // this should just rearm its timer and stay put.
    let mut bytes = ADVERTISEMENT.to_vec();
    bytes[3] = 200; // priority field
    // Recompute the checksum the codec would reject otherwise.
    bytes[6] = 0;
    bytes[7] = 0;
    let mut cksum = internet_checksum::Checksum::new();
    cksum.add_bytes(&bytes);
    let sum = cksum.checksum();
    bytes[6] = sum[0];
    bytes[7] = sum[1];

    vif.recv_ip_packet(
        IpPacket {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            src_ip: Ipv4Addr::new(192, 168, 100, 3),
            dst_ip: VRRP_MULTICAST_ADDRESS,
            proto: VRRP_PROTO_NUMBER,
            ttl: VRRP_IP_TTL,
            tos: 0,
            options: None,
            payload: Bytes::copy_from_slice(&bytes),
        },
        TimeVal::from_secs(1),
    );

    let (state, _) = vif.get_vrid_info(51).unwrap();
    assert_eq!(state, "BACKUP");
}

#[test]
fn advertisement_with_bad_checksum_is_dropped_and_counted() {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let mut vif = backup_vif(sent);

    let mut bytes = ADVERTISEMENT.to_vec();
    bytes[6] = 0;
    bytes[7] = 0;

    vif.recv_ip_packet(
        IpPacket {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            src_ip: Ipv4Addr::new(192, 168, 100, 3),
            dst_ip: VRRP_MULTICAST_ADDRESS,
            proto: VRRP_PROTO_NUMBER,
            ttl: VRRP_IP_TTL,
            tos: 0,
            options: None,
            payload: Bytes::copy_from_slice(&bytes),
        },
        TimeVal::from_secs(1),
    );

    assert_eq!(vif.errors.decode_errors, 1);
    // Still backup: the corrupt advertisement was rejected before it
    // could touch the state machine.
    let (state, _) = vif.get_vrid_info(51).unwrap();
    assert_eq!(state, "BACKUP");
}

#[test]
fn wrong_ttl_advertisement_is_dropped_before_decode() {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let mut vif = backup_vif(sent);

    vif.recv_ip_packet(
        IpPacket {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            src_ip: Ipv4Addr::new(192, 168, 100, 3),
            dst_ip: VRRP_MULTICAST_ADDRESS,
            proto: VRRP_PROTO_NUMBER,
            ttl: 64,
            tos: 0,
            options: None,
            payload: Bytes::copy_from_slice(&ADVERTISEMENT),
        },
        TimeVal::from_secs(1),
    );

    assert_eq!(vif.errors.invalid_ttl, 1);
    assert_eq!(vif.errors.decode_errors, 0);
}

// A gratuitous/reply ARP request for the virtual address gets answered
// on the wire with the virtual MAC as sender.
#[test]
fn arp_request_for_virtual_address_is_answered() {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let vif_sent = sent.clone();
    let mut vif = backup_vif(sent);
    // Force into MASTER so the ARP responder is actually running.
    vif.set_priority(51, 254, TimeVal::from_secs(1)).unwrap();
    vif.tick(TimeVal::from_secs(10));
    vif_sent.borrow_mut().clear();

    let request = ArpPacket::new(
        vrrp::consts::ARP_OPER_REQUEST,
        MacAddr::from([0xd4, 0xb1, 0x08, 0x4c, 0xbb, 0xf9]),
        Ipv4Addr::new(192, 168, 100, 3),
        [0x00; 6],
        Ipv4Addr::new(10, 0, 1, 5),
    );
    vif.recv_link_frame(
        LinkFrame {
            ifname: "eth0".into(),
            vifname: "eth0".into(),
            src_mac: MacAddr::from([0xd4, 0xb1, 0x08, 0x4c, 0xbb, 0xf9]),
            dst_mac: MacAddr::BROADCAST,
            ethertype: vrrp::consts::ETHERTYPE_ARP,
            payload: request.encode().freeze(),
        },
        TimeVal::from_secs(10),
    );

    let replies = vif_sent.borrow();
    assert_eq!(replies.len(), 1);
    let reply = ArpPacket::decode(&replies[0]).unwrap();
    assert_eq!(reply.operation, vrrp::consts::ARP_OPER_REPLY);
    assert_eq!(reply.sender_ip(), Ipv4Addr::new(10, 0, 1, 5));
    assert_eq!(reply.target_ip(), Ipv4Addr::new(192, 168, 100, 3));
}
