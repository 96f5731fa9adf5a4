//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// End-to-end VRID lifecycle scenarios driven against a fake transport,
// exercising `VrrpVif`/`VrrpInstance` together rather than either unit in
// isolation.

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
use vrrp::packet::{ArpPacket, Ipv4Hdr, VrrpHdr};
use vrrp::transport::{CompletionCb, IpPacket, Transport};

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Advertisement { priority: u8, count_ip: u8 },
    GratuitousArp(Ipv4Addr),
    CreateMac(MacAddr),
    DeleteMac(MacAddr),
    JoinMulticast,
    LeaveMulticast,
}

#[derive(Default)]
struct Recorder(RefCell<Vec<Event>>);

impl Recorder {
    fn take(&self) -> Vec<Event> {
        self.0.borrow_mut().drain(..).collect()
    }
}

struct RecordingTransport(Rc<Recorder>);

impl Transport for RecordingTransport {
    fn send_raw_link(
        &mut self,
        _ifname: &str,
        _vifname: &str,
        _src_mac: MacAddr,
        _dst_mac: MacAddr,
        ethertype: u16,
        payload: Bytes,
    ) {
        match ethertype {
            vrrp::consts::ETHERTYPE_IP => {
                let ip_hdr = Ipv4Hdr::decode(&payload).unwrap();
                let ip_hdr_len = (ip_hdr.ihl as usize) * 4;
                let hdr = VrrpHdr::decode(&payload[ip_hdr_len..]).unwrap();
                self.0.0.borrow_mut().push(Event::Advertisement {
                    priority: hdr.priority,
                    count_ip: hdr.count_ip,
                });
            }
            vrrp::consts::ETHERTYPE_ARP => {
                let arp = ArpPacket::decode(&payload).unwrap();
                self.0.0.borrow_mut().push(Event::GratuitousArp(arp.target_ip()));
            }
            other => unreachable!("unexpected ethertype {other:#x}"),
        }
    }

    fn create_mac(&mut self, _ifname: &str, mac: MacAddr, done: CompletionCb) {
        self.0.0.borrow_mut().push(Event::CreateMac(mac));
        done(Ok(()));
    }

    fn delete_mac(&mut self, _ifname: &str, mac: MacAddr, done: CompletionCb) {
        self.0.0.borrow_mut().push(Event::DeleteMac(mac));
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
        self.0.0.borrow_mut().push(Event::JoinMulticast);
        done(Ok(()));
    }

    fn leave_multicast_group(&mut self, _ifname: &str, _vifname: &str, done: CompletionCb) {
        self.0.0.borrow_mut().push(Event::LeaveMulticast);
        done(Ok(()));
    }
}

fn vif_config(own_ip: Ipv4Addr, virt_ip: Ipv4Addr, priority: u8) -> VifConfig {
    let mut cfg = VifConfig {
        enabled: true,
        addresses: vec![format!("{own_ip}/24").parse().unwrap()],
        instances: Default::default(),
    };
    let mut icfg = InstanceConfig::default();
    icfg.priority = priority;
    icfg.virtual_addresses.insert(virt_ip, 24);
    cfg.instances.insert(1, icfg);
    cfg
}

fn new_vif() -> (VrrpVif, Rc<Recorder>) {
    let recorder = Rc::new(Recorder::default());
    let transport = RecordingTransport(recorder.clone());
    let timers = Rc::new(RefCell::new(TimerList::new()));
    let vif = VrrpVif::new(
        "eth0".to_string(),
        "eth0".to_string(),
        Box::new(transport),
        timers,
    );
    (vif, recorder)
}

// Scenario: the router that owns every virtual address it advertises
// skips BACKUP entirely and announces with priority 255 on start.
#[test]
fn owner_start_installs_mac_announces_and_reports_master() {
    let (mut vif, recorder) = new_vif();
    let owned = Ipv4Addr::new(1, 2, 3, 4);
    vif.configure(&vif_config(owned, owned, 100), TimeVal::ZERO);

    assert_eq!(
        recorder.take(),
        vec![
            Event::JoinMulticast,
            Event::CreateMac(MacAddr::virtual_mac(1)),
            Event::JoinMulticast,
            Event::Advertisement { priority: 255, count_ip: 1 },
            Event::GratuitousArp(owned),
        ]
    );

    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "MASTER");
}

// Scenario: a non-owner starts in BACKUP and stays quiet on the wire.
#[test]
fn non_owner_start_reaches_backup_without_announcing() {
    let (mut vif, recorder) = new_vif();
    vif.configure(
        &vif_config(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(1, 2, 3, 254), 100),
        TimeVal::ZERO,
    );

    assert_eq!(recorder.take(), vec![Event::JoinMulticast]);

    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "BACKUP");

    // master_down_interval = 3*1 + (256-100)/256 ~= 3.609s: not yet expired
    // at 3.5s.
    vif.tick(TimeVal::from_millis(3_500));
    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "BACKUP");
}

// Scenario: the master-down timer expiring on a backup promotes it.
#[test]
fn master_down_expiry_installs_mac_and_announces() {
    let (mut vif, recorder) = new_vif();
    vif.configure(
        &vif_config(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(1, 2, 3, 254), 100),
        TimeVal::ZERO,
    );
    recorder.take();

    vif.tick(TimeVal::from_secs(4));

    assert_eq!(
        recorder.take(),
        vec![
            Event::CreateMac(MacAddr::virtual_mac(1)),
            Event::JoinMulticast,
            Event::Advertisement { priority: 100, count_ip: 1 },
            Event::GratuitousArp(Ipv4Addr::new(1, 2, 3, 254)),
        ]
    );

    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "MASTER");
}

// Scenario: a graceful admin-disable from MASTER sends a priority-0
// advertisement before tearing down the virtual MAC and leaving the
// multicast group.
#[test]
fn graceful_stop_sends_priority_zero_and_uninstalls_mac() {
    let (mut vif, recorder) = new_vif();
    let owned = Ipv4Addr::new(1, 2, 3, 4);
    vif.configure(&vif_config(owned, owned, 100), TimeVal::ZERO);
    recorder.take();

    vif.set_disable(1, true, TimeVal::from_secs(1)).unwrap();

    assert_eq!(
        recorder.take(),
        vec![
            Event::Advertisement { priority: 0, count_ip: 1 },
            Event::DeleteMac(MacAddr::virtual_mac(1)),
            Event::LeaveMulticast,
        ]
    );

    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "INITIALIZE");
}

fn advertisement_from(
    src_ip: Ipv4Addr,
    vrid: u8,
    priority: u8,
    virt_ip: Ipv4Addr,
) -> IpPacket {
    let hdr = VrrpHdr::new(vrid, priority, 1, vec![virt_ip]);
    IpPacket {
        ifname: "eth0".into(),
        vifname: "eth0".into(),
        src_ip,
        dst_ip: VRRP_MULTICAST_ADDRESS,
        proto: VRRP_PROTO_NUMBER,
        ttl: VRRP_IP_TTL,
        tos: 0,
        options: None,
        payload: hdr.encode().freeze(),
    }
}

// Scenario: preempt is enabled, but a lower-priority advertisement must
// not refresh the master-down timer — the backup still takes over on the
// original schedule.
#[test]
fn lower_priority_advert_does_not_refresh_master_down_timer() {
    let (mut vif, recorder) = new_vif();
    vif.configure(
        &vif_config(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(1, 2, 3, 254), 100),
        TimeVal::ZERO,
    );
    recorder.take();

    vif.recv_ip_packet(
        advertisement_from(Ipv4Addr::new(1, 2, 3, 5), 1, 50, Ipv4Addr::new(1, 2, 3, 254)),
        TimeVal::from_millis(3_000),
    );
    // Still backup; the lower-priority advert changed nothing.
    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "BACKUP");

    // The original master_down deadline (~3.609s from t=0) must still
    // fire: at t=3.7s we should have promoted to master.
    vif.tick(TimeVal::from_millis(3_700));
    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "MASTER");
}

// Scenario: two equal-priority masters on the wire break the tie by IP.
#[test]
fn equal_priority_tie_break_uses_higher_ip() {
    let (mut vif, recorder) = new_vif();
    let owned = Ipv4Addr::new(10, 0, 0, 5);
    vif.configure(&vif_config(owned, owned, 100), TimeVal::ZERO);
    recorder.take();

    // A peer with a numerically larger IP wins the tie-break.
    vif.recv_ip_packet(
        advertisement_from(Ipv4Addr::new(10, 0, 0, 7), 1, 255, owned),
        TimeVal::from_secs(1),
    );
    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "BACKUP");
}

#[test]
fn equal_priority_lower_peer_ip_is_ignored() {
    let (mut vif, recorder) = new_vif();
    let owned = Ipv4Addr::new(10, 0, 0, 5);
    vif.configure(&vif_config(owned, owned, 100), TimeVal::ZERO);
    recorder.take();

    vif.recv_ip_packet(
        advertisement_from(Ipv4Addr::new(10, 0, 0, 3), 1, 255, owned),
        TimeVal::from_secs(1),
    );
    let (state, _) = vif.get_vrid_info(1).unwrap();
    assert_eq!(state, "MASTER");
    assert!(recorder.take().is_empty());
}
