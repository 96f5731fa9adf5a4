//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! `VrrpInstance` (§4.9): the per-VRID state machine.
//!
//! Owns nothing but its own state and timers; every send, multicast
//! join/leave, ARP-register and MAC-install operation is brokered through
//! its vif via [`VifHandle`], keeping this module free of socket plumbing
//! the same way the teacher leaves network I/O to `network.rs` and only
//! drives it from `instance.rs`.
//!
//! Timer callbacks cannot be handed the firing `now` directly (see
//! `event_core::timer::TimerList`'s `FnOnce()`/`FnMut() -> bool`
//! signatures), so every instance also keeps a clone of a `Cell<TimeVal>`
//! that its vif refreshes on every externally-driven call. A timer that
//! fires on its own (`master_down_timer`'s natural expiry) reads `now`
//! back out of that cell instead of receiving it as an argument.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

use event_core::TimeVal;
use event_core::timer::{TimerHandle, TimerList};

use crate::arp::ArpResponder;
use crate::config::InstanceConfig;
use crate::consts::{VRRP_PRIORITY_LEAVING, VRRP_PRIORITY_OWNER};
use crate::debug::{Debug, StopReason};
use crate::error::ConfigError;
use crate::interface::VifHandle;
use crate::mac_addr::MacAddr;
use crate::packet::VrrpHdr;

const TIMER_PRIORITY: i32 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Initialize,
    Backup,
    Master,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Initialize => "INITIALIZE",
            State::Backup => "BACKUP",
            State::Master => "MASTER",
        };
        write!(f, "{s}")
    }
}

// Counters tracked per VRID (§5 "Statistics"), modeled on RFC 2787's VRRP
// MIB. Packet-level rejects that happen before a VRID can even be
// identified (bad checksum, wrong TTL, unknown VRID) are counted on the
// vif instead (`interface::PacketErrors`), not here.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    pub discontinuity_time: TimeVal,
    pub master_transitions: u32,
    pub adv_rcvd: u32,
    pub adv_sent: u32,
    pub priority_zero_pkts_rcvd: u32,
    pub priority_zero_pkts_sent: u32,
}

pub struct VrrpInstance {
    pub vrid: u8,
    priority_configured: u8,
    priority_effective: u8,
    interval: u8,
    pub preempt: bool,
    pub disable: bool,
    pub state: State,
    virtual_addresses: BTreeMap<Ipv4Addr, u8>,
    master_addr: Option<Ipv4Addr>,
    pub arp: ArpResponder,
    pub stats: Statistics,

    vif: VifHandle,
    timers: Rc<RefCell<TimerList>>,
    clock: Rc<Cell<TimeVal>>,
    self_handle: Weak<RefCell<VrrpInstance>>,

    adver_timer: Option<TimerHandle>,
    master_down_timer: Option<TimerHandle>,
}

impl VrrpInstance {
    pub fn new(
        vrid: u8,
        cfg: &InstanceConfig,
        vif: VifHandle,
        timers: Rc<RefCell<TimerList>>,
        clock: Rc<Cell<TimeVal>>,
    ) -> Self {
        Debug::InstanceCreate(vrid).log();
        let virtual_mac = MacAddr::virtual_mac(vrid);
        VrrpInstance {
            vrid,
            priority_configured: cfg.priority,
            priority_effective: cfg.priority,
            interval: cfg.interval,
            preempt: cfg.preempt,
            disable: cfg.disable,
            state: State::Initialize,
            virtual_addresses: cfg.virtual_addresses.clone(),
            master_addr: None,
            arp: ArpResponder::new(virtual_mac),
            stats: Statistics::default(),
            vif,
            timers,
            clock,
            self_handle: Weak::new(),
            adver_timer: None,
            master_down_timer: None,
        }
    }

    // Two-phase init: the instance cannot know its own `Rc` until after
    // it has been placed inside one, so `VrrpVif` calls this immediately
    // after construction with a weak reference to itself.
    pub fn bind_self(&mut self, self_handle: Weak<RefCell<VrrpInstance>>) {
        self.self_handle = self_handle;
    }

    pub fn priority_effective(&self) -> u8 {
        self.priority_effective
    }

    pub fn master_ip(&self, vif: &VifHandle) -> Option<Ipv4Addr> {
        match self.state {
            State::Master => vif.primary_ip(),
            State::Backup | State::Initialize => self.master_addr,
        }
    }

    // Recomputes whether this VRID owns every one of its virtual IPs
    // (§4.9 "address owner"): if so, its effective priority is pinned to
    // 255 regardless of configuration, and it skips BACKUP entirely on
    // start. Also keeps the ARP responder's address set in sync.
    pub fn recompute_ownership(&mut self, vif: &VifHandle) {
        let owns_all = !self.virtual_addresses.is_empty()
            && self.virtual_addresses.keys().all(|addr| vif.owns(addr));
        self.priority_effective = if owns_all {
            VRRP_PRIORITY_OWNER
        } else {
            self.priority_configured
        };
        self.arp
            .set_addresses(self.virtual_addresses.keys().copied().collect());
    }

    fn skew_time(&self) -> TimeVal {
        let numerator = (256 - self.priority_effective as i64) * 1_000_000;
        TimeVal::from_micros(numerator / 256)
    }

    fn master_down_interval(&self) -> TimeVal {
        TimeVal::from_secs(3 * self.interval as u64) + self.skew_time()
    }

    fn advert_interval(&self) -> TimeVal {
        TimeVal::from_secs(self.interval as u64)
    }

    // INITIALIZE -> {MASTER, BACKUP} (§4.9).
    pub fn start(&mut self, now: TimeVal) {
        if self.state != State::Initialize {
            return;
        }
        self.clock.set(now);
        Debug::InstanceStart(self.vrid).log();
        self.vif.mcast_join();
        if self.priority_effective == VRRP_PRIORITY_OWNER {
            self.transition_to_master(now);
        } else {
            self.transition_to_backup(now);
        }
    }

    // {MASTER, BACKUP} -> INITIALIZE (§4.9).
    pub fn stop(&mut self, now: TimeVal, reason: StopReason) {
        if self.state == State::Initialize {
            return;
        }
        self.clock.set(now);
        let from = self.state;
        Debug::InstanceStop(self.vrid, reason).log();

        if self.state == State::Master {
            self.send_advertisement(VRRP_PRIORITY_LEAVING);
            self.vif.uninstall_mac(self.vrid);
        }
        if self.arp.stop() {
            self.vif.arp_stop();
        }
        self.disarm_adver_timer();
        self.disarm_master_down_timer();
        self.vif.mcast_leave();

        self.state = State::Initialize;
        self.master_addr = None;
        Debug::StateChange(self.vrid, from, self.state).log();
    }

    pub fn recv_advertisement(
        &mut self,
        src_ip: Ipv4Addr,
        hdr: &VrrpHdr,
        now: TimeVal,
    ) {
        self.clock.set(now);
        self.stats.adv_rcvd += 1;
        if hdr.priority == VRRP_PRIORITY_LEAVING {
            self.stats.priority_zero_pkts_rcvd += 1;
        }
        Debug::PacketRx(&src_ip, hdr).log();

        match self.state {
            State::Initialize => {}
            State::Backup => {
                self.master_addr = Some(src_ip);
                if hdr.priority == VRRP_PRIORITY_LEAVING {
                    self.arm_master_down_timer(now, self.skew_time());
                } else if !self.preempt || hdr.priority >= self.priority_effective
                {
                    self.arm_master_down_timer(now, self.master_down_interval());
                }
                // A lower-priority peer while preempt is enabled: ignore,
                // let our own master_down_timer keep running.
            }
            State::Master => {
                if hdr.priority == VRRP_PRIORITY_LEAVING {
                    self.send_advertisement(self.priority_effective);
                    self.restart_adver_timer(now);
                } else if self.loses_to(src_ip, hdr.priority) {
                    self.transition_from_master_to_backup(now, src_ip);
                }
                // Otherwise the peer loses the tie-break: ignore.
            }
        }
    }

    pub fn set_priority(&mut self, priority: u8, now: TimeVal) {
        self.priority_configured = priority;
        if self.priority_effective != VRRP_PRIORITY_OWNER {
            self.priority_effective = priority;
        }
        self.rearm_on_param_change(now);
    }

    pub fn set_interval(&mut self, interval: u8, now: TimeVal) {
        self.interval = interval;
        self.rearm_on_param_change(now);
    }

    pub fn add_ip(&mut self, addr: Ipv4Addr, prefix_len: u8) {
        self.virtual_addresses.insert(addr, prefix_len);
    }

    pub fn set_prefix(
        &mut self,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError> {
        match self.virtual_addresses.get_mut(&addr) {
            Some(p) => {
                *p = prefix_len;
                Ok(())
            }
            None => Err(ConfigError::IpNotFound(addr)),
        }
    }

    pub fn delete_ip(&mut self, addr: &Ipv4Addr) -> Result<(), ConfigError> {
        self.virtual_addresses
            .remove(addr)
            .map(|_| ())
            .ok_or(ConfigError::IpNotFound(*addr))
    }

    pub fn apply_config(&mut self, cfg: &InstanceConfig, now: TimeVal) {
        self.priority_configured = cfg.priority;
        if self.priority_effective != VRRP_PRIORITY_OWNER {
            self.priority_effective = cfg.priority;
        }
        self.interval = cfg.interval;
        self.preempt = cfg.preempt;
        self.disable = cfg.disable;
        self.virtual_addresses = cfg.virtual_addresses.clone();
        self.rearm_on_param_change(now);
    }

    fn rearm_on_param_change(&mut self, now: TimeVal) {
        match self.state {
            State::Master => self.restart_adver_timer(now),
            State::Backup => {
                self.arm_master_down_timer(now, self.master_down_interval())
            }
            State::Initialize => {}
        }
    }

    fn transition_to_master(&mut self, now: TimeVal) {
        let from = self.state;
        self.state = State::Master;
        self.stats.master_transitions += 1;
        self.vif.install_mac(self.vrid);
        if self.arp.start() {
            self.vif.arp_start();
        }
        self.send_advertisement(self.priority_effective);
        self.send_gratuitous_arps();
        self.disarm_master_down_timer();
        self.arm_adver_timer(now);
        Debug::StateChange(self.vrid, from, self.state).log();
    }

    fn transition_to_backup(&mut self, now: TimeVal) {
        let from = self.state;
        self.state = State::Backup;
        self.arm_master_down_timer(now, self.master_down_interval());
        Debug::StateChange(self.vrid, from, self.state).log();
    }

    fn transition_from_master_to_backup(
        &mut self,
        now: TimeVal,
        peer_ip: Ipv4Addr,
    ) {
        let from = self.state;
        self.vif.uninstall_mac(self.vrid);
        if self.arp.stop() {
            self.vif.arp_stop();
        }
        self.disarm_adver_timer();
        self.state = State::Backup;
        self.master_addr = Some(peer_ip);
        self.arm_master_down_timer(now, self.master_down_interval());
        Debug::StateChange(self.vrid, from, self.state).log();
    }

    // Whether `peer_ip`/`peer_priority` beats this instance's own
    // priority/IP in the RFC 3768 tie-break: higher priority wins; equal
    // priority is broken by the numerically larger IPv4 address.
    fn loses_to(&self, peer_ip: Ipv4Addr, peer_priority: u8) -> bool {
        if peer_priority > self.priority_effective {
            return true;
        }
        if peer_priority < self.priority_effective {
            return false;
        }
        match self.vif.primary_ip() {
            Some(own_ip) => u32::from(peer_ip) > u32::from(own_ip),
            None => true,
        }
    }

    fn send_advertisement(&mut self, priority: u8) {
        let ip_addresses =
            self.virtual_addresses.keys().copied().collect::<Vec<_>>();
        let hdr = VrrpHdr::new(self.vrid, priority, self.interval, ip_addresses);
        self.stats.adv_sent += 1;
        if priority == VRRP_PRIORITY_LEAVING {
            self.stats.priority_zero_pkts_sent += 1;
        }
        if let Some(dst) = self.vif.primary_ip() {
            Debug::PacketTx(&dst, &hdr).log();
        }
        self.vif.send_advertisement(self.vrid, &hdr);
    }

    fn send_gratuitous_arps(&mut self) {
        let addresses =
            self.virtual_addresses.keys().copied().collect::<Vec<_>>();
        for addr in addresses {
            self.vif.send_gratuitous_arp(self.vrid, addr);
        }
    }

    fn arm_adver_timer(&mut self, now: TimeVal) {
        self.disarm_adver_timer();
        let period = self.advert_interval();
        let self_handle = self.self_handle.clone();
        let handle = self.timers.borrow_mut().new_periodic(
            now,
            period,
            TIMER_PRIORITY,
            move || {
                let Some(inst) = self_handle.upgrade() else {
                    return false;
                };
                inst.borrow_mut().advert_timer_fired();
                true
            },
        );
        self.adver_timer = Some(handle);
    }

    fn restart_adver_timer(&mut self, now: TimeVal) {
        self.arm_adver_timer(now);
    }

    fn disarm_adver_timer(&mut self) {
        if let Some(handle) = self.adver_timer.take() {
            self.timers.borrow_mut().cancel(handle);
        }
    }

    fn advert_timer_fired(&mut self) {
        if self.state != State::Master {
            return;
        }
        self.send_advertisement(self.priority_effective);
    }

    fn arm_master_down_timer(&mut self, now: TimeVal, delay: TimeVal) {
        self.disarm_master_down_timer();
        let self_handle = self.self_handle.clone();
        let handle = self.timers.borrow_mut().schedule_after(
            now,
            delay,
            TIMER_PRIORITY,
            move || {
                let Some(inst) = self_handle.upgrade() else {
                    return;
                };
                let now = inst.borrow().clock.get();
                inst.borrow_mut().master_down_expired(now);
            },
        );
        self.master_down_timer = Some(handle);
    }

    fn disarm_master_down_timer(&mut self) {
        if let Some(handle) = self.master_down_timer.take() {
            self.timers.borrow_mut().cancel(handle);
        }
    }

    // BACKUP -> MASTER (§4.9): the only transition driven purely by a
    // timer's own expiry rather than an external call.
    fn master_down_expired(&mut self, now: TimeVal) {
        if self.state != State::Backup {
            return;
        }
        self.transition_to_master(now);
    }
}
