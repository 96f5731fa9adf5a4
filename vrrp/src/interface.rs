//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! `VrrpVif` (§4.10): binds one VRRP-capable interface, owns its VRID
//! table, and brokers every interface-scoped operation (send, multicast
//! join/leave, ARP receive start/stop, MAC install/uninstall) that more
//! than one VRID on the vif may need concurrently.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

use event_core::TimeVal;
use event_core::timer::TimerList;
use ipnetwork::Ipv4Network;

use crate::config::{InstanceConfig, VifConfig};
use crate::consts::{
    ARP_BROADCAST_MAC, ARP_OPER_REQUEST, ETHERTYPE_ARP, ETHERTYPE_IP,
    VRID_MAX, VRID_MIN, VRRP_IP_TTL, VRRP_MULTICAST_ADDRESS,
    VRRP_MULTICAST_MAC, VRRP_PROTO_NUMBER,
};
use crate::debug::{Debug, StopReason};
use crate::error::{ConfigError, Error};
use crate::instance::{State, VrrpInstance};
use crate::mac_addr::MacAddr;
use crate::packet::{ArpPacket, Ipv4Hdr, VrrpHdr};
use crate::transport::{IpPacket, LinkFrame, Transport};

fn log_completion(result: Result<(), Error>) {
    if let Err(error) = result {
        error.log();
    }
}

// Packet-level rejects counted before a VRID can even be identified
// (§5 "Statistics"): a bad checksum or wrong TTL might carry a VRID in
// its header, but that header cannot be trusted, so these are tracked
// per vif rather than attributed to any one instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketErrors {
    pub invalid_proto: u32,
    pub invalid_ttl: u32,
    pub decode_errors: u32,
    pub unknown_vrid: u32,
}

// Interface-scoped state shared between a vif and every VRID instance
// bound to it. A `VrrpInstance` reaches this through a non-owning
// [`VifHandle`] (§9 "Cyclic ownership": `VrrpTarget` owns `VrrpVif` owns
// `VrrpInstance`; the reverse edge is a weak pointer, never an owner).
pub struct VifShared {
    pub ifname: String,
    pub vifname: String,
    pub ready: bool,
    pub addresses: BTreeSet<Ipv4Network>,
    mcast_refcount: u32,
    arp_refcount: u32,
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for VifShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VifShared")
            .field("ifname", &self.ifname)
            .field("vifname", &self.vifname)
            .field("ready", &self.ready)
            .field("addresses", &self.addresses)
            .field("mcast_refcount", &self.mcast_refcount)
            .field("arp_refcount", &self.arp_refcount)
            .finish()
    }
}

impl VifShared {
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().map(|net| net.ip()).min()
    }

    pub fn owns(&self, addr: &Ipv4Addr) -> bool {
        self.addresses.iter().any(|net| &net.ip() == addr)
    }
}

// Non-owning handle a `VrrpInstance` uses to reach its vif's transport and
// refcounted resources. Every method silently no-ops once the vif has been
// dropped, which can only happen after the instance itself has been torn
// down (see `VrrpVif::delete_vrid`).
#[derive(Clone)]
pub struct VifHandle(Weak<RefCell<VifShared>>);

impl VifHandle {
    fn with<R>(&self, f: impl FnOnce(&mut VifShared) -> R) -> Option<R> {
        self.0.upgrade().map(|shared| f(&mut shared.borrow_mut()))
    }

    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.with(VifShared::primary_ip).flatten()
    }

    pub fn owns(&self, addr: &Ipv4Addr) -> bool {
        self.with(|s| s.owns(addr)).unwrap_or(false)
    }

    // Sends a VRRP advertisement wrapped in its IPv4 header and Ethernet
    // framing to the VRRP multicast group (§4.7, §6).
    pub fn send_advertisement(&self, vrid: u8, hdr: &VrrpHdr) {
        self.with(|shared| {
            let Some(src_ip) = shared.primary_ip() else {
                return;
            };
            let vrrp_bytes = hdr.encode();

            let ip_hdr = Ipv4Hdr {
                version: 4,
                ihl: 5,
                tos: 0,
                total_length: (20 + vrrp_bytes.len()) as u16,
                identification: 0,
                flags: 0,
                offset: 0,
                ttl: VRRP_IP_TTL,
                protocol: VRRP_PROTO_NUMBER,
                checksum: 0,
                src_address: src_ip,
                dst_address: VRRP_MULTICAST_ADDRESS,
                options: None,
                padding: None,
            };
            let mut payload = ip_hdr.encode();
            payload.extend_from_slice(&vrrp_bytes);

            shared.transport.send_raw_link(
                &shared.ifname,
                &shared.vifname,
                MacAddr::virtual_mac(vrid),
                MacAddr::from(VRRP_MULTICAST_MAC),
                ETHERTYPE_IP,
                payload.freeze(),
            );
        });
    }

    // Sends a gratuitous ARP announcing `addr` now belongs to the virtual
    // MAC (§6 "Wire: gratuitous ARP").
    pub fn send_gratuitous_arp(&self, vrid: u8, addr: Ipv4Addr) {
        self.with(|shared| {
            let virtual_mac = MacAddr::virtual_mac(vrid);
            let arp = ArpPacket::new(
                ARP_OPER_REQUEST,
                virtual_mac,
                addr,
                ARP_BROADCAST_MAC,
                addr,
            );
            shared.transport.send_raw_link(
                &shared.ifname,
                &shared.vifname,
                virtual_mac,
                MacAddr::from(ARP_BROADCAST_MAC),
                ETHERTYPE_ARP,
                arp.encode().freeze(),
            );
        });
    }

    pub fn send_arp_reply(&self, vrid: u8, dst: MacAddr, reply: &ArpPacket) {
        self.with(|shared| {
            shared.transport.send_raw_link(
                &shared.ifname,
                &shared.vifname,
                MacAddr::virtual_mac(vrid),
                dst,
                ETHERTYPE_ARP,
                reply.encode().freeze(),
            );
        });
    }

    // Installs the virtual MAC on entry to MASTER. Re-requests multicast
    // membership afterwards: on some stacks, installing a unicast MAC on
    // the interface silently drops it (§9 open question).
    pub fn install_mac(&self, vrid: u8) {
        self.with(|shared| {
            let ifname = shared.ifname.clone();
            let vifname = shared.vifname.clone();
            let rejoin = shared.mcast_refcount > 0;
            shared.transport.create_mac(
                &ifname,
                MacAddr::virtual_mac(vrid),
                Box::new(log_completion),
            );
            if rejoin {
                shared.transport.join_multicast_group(
                    &ifname,
                    &vifname,
                    Box::new(log_completion),
                );
            }
        });
    }

    pub fn uninstall_mac(&self, vrid: u8) {
        self.with(|shared| {
            let ifname = shared.ifname.clone();
            shared.transport.delete_mac(
                &ifname,
                MacAddr::virtual_mac(vrid),
                Box::new(log_completion),
            );
        });
    }

    pub fn mcast_join(&self) {
        self.with(|shared| {
            shared.mcast_refcount += 1;
            if shared.mcast_refcount == 1 {
                let ifname = shared.ifname.clone();
                let vifname = shared.vifname.clone();
                shared.transport.join_multicast_group(
                    &ifname,
                    &vifname,
                    Box::new(log_completion),
                );
            }
        });
    }

    pub fn mcast_leave(&self) {
        self.with(|shared| {
            if shared.mcast_refcount == 0 {
                return;
            }
            shared.mcast_refcount -= 1;
            if shared.mcast_refcount == 0 {
                let ifname = shared.ifname.clone();
                let vifname = shared.vifname.clone();
                shared.transport.leave_multicast_group(
                    &ifname,
                    &vifname,
                    Box::new(log_completion),
                );
            }
        });
    }

    pub fn arp_start(&self) {
        self.with(|shared| {
            shared.arp_refcount += 1;
            if shared.arp_refcount == 1 {
                let ifname = shared.ifname.clone();
                let vifname = shared.vifname.clone();
                shared.transport.register_receiver(
                    &ifname,
                    &vifname,
                    Box::new(log_completion),
                );
            }
        });
    }

    pub fn arp_stop(&self) {
        self.with(|shared| {
            if shared.arp_refcount == 0 {
                return;
            }
            shared.arp_refcount -= 1;
            if shared.arp_refcount == 0 {
                let ifname = shared.ifname.clone();
                let vifname = shared.vifname.clone();
                shared.transport.unregister_receiver(
                    &ifname,
                    &vifname,
                    Box::new(log_completion),
                );
            }
        });
    }
}

// Binds one logical interface. Owns the VRID table exclusively; a
// `VrrpInstance`'s reference back to its vif is non-owning (§5 "Resource
// ownership").
pub struct VrrpVif {
    shared: Rc<RefCell<VifShared>>,
    instances: BTreeMap<u8, Rc<RefCell<VrrpInstance>>>,
    timers: Rc<RefCell<TimerList>>,
    clock: Rc<Cell<TimeVal>>,
    pub errors: PacketErrors,
}

impl VrrpVif {
    pub fn new(
        ifname: String,
        vifname: String,
        transport: Box<dyn Transport>,
        timers: Rc<RefCell<TimerList>>,
    ) -> Self {
        VrrpVif {
            shared: Rc::new(RefCell::new(VifShared {
                ifname,
                vifname,
                ready: false,
                addresses: BTreeSet::new(),
                mcast_refcount: 0,
                arp_refcount: 0,
                transport,
            })),
            instances: BTreeMap::new(),
            timers,
            clock: Rc::new(Cell::new(TimeVal::ZERO)),
            errors: PacketErrors::default(),
        }
    }

    pub fn ifname(&self) -> String {
        self.shared.borrow().ifname.clone()
    }

    pub fn vifname(&self) -> String {
        self.shared.borrow().vifname.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.borrow().ready
    }

    pub fn vrids(&self) -> Vec<u8> {
        self.instances.keys().copied().collect()
    }

    fn handle(&self) -> VifHandle {
        VifHandle(Rc::downgrade(&self.shared))
    }

    fn new_instance(
        &self,
        vrid: u8,
        cfg: &InstanceConfig,
    ) -> Rc<RefCell<VrrpInstance>> {
        let instance = Rc::new(RefCell::new(VrrpInstance::new(
            vrid,
            cfg,
            self.handle(),
            self.timers.clone(),
            self.clock.clone(),
        )));
        instance
            .borrow_mut()
            .bind_self(Rc::downgrade(&instance));
        instance
    }

    fn reconcile_running(
        instance: &Rc<RefCell<VrrpInstance>>,
        vif_ready: bool,
        now: TimeVal,
    ) {
        let mut inst = instance.borrow_mut();
        let should_run = vif_ready && !inst.disable;
        let is_running = inst.state != State::Initialize;
        if should_run && !is_running {
            inst.start(now);
        } else if !should_run && is_running {
            let reason = if inst.disable {
                StopReason::AdminDisable
            } else {
                StopReason::VifNotReady
            };
            inst.stop(now, reason);
        }
    }

    pub fn add_vrid(
        &mut self,
        vrid: u8,
        cfg: &InstanceConfig,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.clock.set(now);
        if !(VRID_MIN..=VRID_MAX).contains(&vrid) {
            return Err(ConfigError::VridOutOfRange(vrid));
        }
        if self.instances.contains_key(&vrid) {
            return Err(ConfigError::VridExists(vrid));
        }
        let instance = self.new_instance(vrid, cfg);
        instance.borrow_mut().recompute_ownership(&self.handle());
        self.instances.insert(vrid, instance.clone());
        Self::reconcile_running(&instance, self.is_ready(), now);
        Ok(())
    }

    pub fn delete_vrid(
        &mut self,
        vrid: u8,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.clock.set(now);
        let instance = self
            .instances
            .remove(&vrid)
            .ok_or(ConfigError::VridNotFound(vrid))?;
        instance.borrow_mut().stop(now, StopReason::AdminDisable);
        Debug::InstanceDelete(vrid).log();
        Ok(())
    }

    fn instance(
        &self,
        vrid: u8,
    ) -> Result<&Rc<RefCell<VrrpInstance>>, ConfigError> {
        self.instances
            .get(&vrid)
            .ok_or(ConfigError::VridNotFound(vrid))
    }

    pub fn set_priority(
        &mut self,
        vrid: u8,
        priority: u8,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        if priority == 0 || priority == 255 {
            return Err(ConfigError::PriorityOutOfRange(priority));
        }
        self.clock.set(now);
        self.instance(vrid)?.borrow_mut().set_priority(priority, now);
        Ok(())
    }

    pub fn set_interval(
        &mut self,
        vrid: u8,
        interval: u16,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        if interval == 0 || interval > 255 {
            return Err(ConfigError::IntervalOutOfRange(interval));
        }
        self.clock.set(now);
        self.instance(vrid)?
            .borrow_mut()
            .set_interval(interval as u8, now);
        Ok(())
    }

    pub fn set_preempt(
        &mut self,
        vrid: u8,
        preempt: bool,
    ) -> Result<(), ConfigError> {
        self.instance(vrid)?.borrow_mut().preempt = preempt;
        Ok(())
    }

    pub fn set_disable(
        &mut self,
        vrid: u8,
        disable: bool,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.clock.set(now);
        let instance = self.instance(vrid)?.clone();
        instance.borrow_mut().disable = disable;
        Self::reconcile_running(&instance, self.is_ready(), now);
        Ok(())
    }

    pub fn add_ip(
        &mut self,
        vrid: u8,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError> {
        let instance = self.instance(vrid)?.clone();
        instance.borrow_mut().add_ip(addr, prefix_len);
        instance.borrow_mut().recompute_ownership(&self.handle());
        Ok(())
    }

    pub fn set_prefix(
        &mut self,
        vrid: u8,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError> {
        self.instance(vrid)?
            .borrow_mut()
            .set_prefix(addr, prefix_len)
    }

    pub fn delete_ip(
        &mut self,
        vrid: u8,
        addr: Ipv4Addr,
    ) -> Result<(), ConfigError> {
        let instance = self.instance(vrid)?.clone();
        instance.borrow_mut().delete_ip(&addr)?;
        instance.borrow_mut().recompute_ownership(&self.handle());
        Ok(())
    }

    pub fn get_vrid_info(
        &self,
        vrid: u8,
    ) -> Result<(String, Option<Ipv4Addr>), ConfigError> {
        let instance = self.instance(vrid)?.borrow();
        Ok((instance.state.to_string(), instance.master_ip(&self.handle())))
    }

    // Walks the latest config snapshot for this vif: sets `ready`
    // appropriately, updates the configured IP set, and cascades
    // start/stop to every VRID (§4.10, §4.11).
    pub fn configure(&mut self, cfg: &VifConfig, now: TimeVal) {
        self.clock.set(now);
        {
            let mut shared = self.shared.borrow_mut();
            shared.addresses = cfg.addresses.iter().copied().collect();
            shared.ready = cfg.enabled && !shared.addresses.is_empty();
        }
        let is_ready = self.is_ready();

        let configured: BTreeSet<u8> = cfg.instances.keys().copied().collect();
        let current: BTreeSet<u8> = self.instances.keys().copied().collect();
        for vrid in current.difference(&configured) {
            if let Some(instance) = self.instances.remove(vrid) {
                instance.borrow_mut().stop(now, StopReason::VifNotReady);
            }
        }

        for (vrid, icfg) in &cfg.instances {
            if let Some(instance) = self.instances.get(vrid) {
                instance.borrow_mut().apply_config(icfg, now);
            } else {
                let instance = self.new_instance(*vrid, icfg);
                self.instances.insert(*vrid, instance);
            }
        }

        let handle = self.handle();
        for instance in self.instances.values() {
            instance.borrow_mut().recompute_ownership(&handle);
            Self::reconcile_running(instance, is_ready, now);
        }
    }

    // Advances the shared timer wheel (driven by the owning `VrrpTarget`
    // once per `EventLoop` iteration, or directly in tests).
    pub fn tick(&mut self, now: TimeVal) {
        self.clock.set(now);
        self.timers.borrow_mut().run(now);
    }

    // Validates and dispatches an inbound IP-level packet to the matching
    // VRID (§6: the core must validate TTL == 255 and proto == 112 before
    // accepting an advertisement).
    pub fn recv_ip_packet(&mut self, pkt: IpPacket, now: TimeVal) {
        self.clock.set(now);
        if pkt.proto != VRRP_PROTO_NUMBER {
            self.errors.invalid_proto += 1;
            Error::InvalidProto(pkt.proto).log();
            return;
        }
        if pkt.ttl != VRRP_IP_TTL {
            self.errors.invalid_ttl += 1;
            Error::InvalidTtl(pkt.ttl).log();
            return;
        }

        let hdr = match VrrpHdr::decode(&pkt.payload) {
            Ok(hdr) => hdr,
            Err(error) => {
                self.errors.decode_errors += 1;
                Error::from(error).log();
                return;
            }
        };

        match self.instances.get(&hdr.vrid) {
            Some(instance) => {
                instance.borrow_mut().recv_advertisement(pkt.src_ip, &hdr, now);
            }
            None => {
                self.errors.unknown_vrid += 1;
                Error::UnknownVrid(hdr.vrid).log();
            }
        }
    }

    // Dispatches an inbound ARP frame to every VRID's responder on this
    // vif; at most one owns the requested target IP (§4.8).
    pub fn recv_link_frame(&mut self, frame: LinkFrame, now: TimeVal) {
        self.clock.set(now);
        if frame.ethertype != ETHERTYPE_ARP {
            return;
        }
        let Ok(request) = ArpPacket::decode(&frame.payload) else {
            return;
        };
        for (vrid, instance) in &self.instances {
            let reply = instance.borrow().arp.handle_request(&request);
            if let Some((dst, reply)) = reply {
                Debug::ArpReply(&reply.target_ip()).log();
                self.handle().send_arp_reply(*vrid, dst, &reply);
                break;
            }
        }
    }
}
