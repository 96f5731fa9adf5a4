//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! `VrrpTarget` (§4.11): the top-level registry of interfaces and VRIDs,
//! and the boundary this crate presents to the external FEA and config
//! mirror (§6).
//!
//! Grounded directly on XORP's `vrrp_target.cc`/`.hh`: the same
//! `ifname -> (vifname -> VrrpVif)` map, the same `tree_complete`/
//! `updates_made` observer pair, and the same pending-XRL-count gate on
//! shutdown (`_xrls_pending` in the original), reduced to plain Rust
//! methods since the XRL transport itself is out of scope here (§1).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use event_core::TimeVal;
use event_core::timer::TimerList;
use tracing::info;

use crate::config::{ConfigTree, TreeSnapshot};
use crate::error::ConfigError;
use crate::interface::VrrpVif;
use crate::transport::Transport;

// Holds off re-applying a configuration snapshot for this long after the
// first change in a burst (§9 "MAC manipulation thrash"): installing a
// virtual MAC can itself bounce link state and redeliver the very update
// that triggered it, so bursts within this window are coalesced into one
// `configure()` pass. Checked from `tick` rather than armed as a
// `TimerList` callback: the callback would need to reach back into the
// target that owns the very timer list it runs on, and there is no
// handle to do that without re-entrantly borrowing `self`.
const CONFIG_DEBOUNCE: TimeVal = TimeVal::from_micros(1_000_000);

// Factory the target uses to open a `Transport` for a newly-seen vif. A
// closure rather than a trait object factory method, since every vif this
// process manages shares the same way of reaching the FEA.
pub type TransportFactory = Box<dyn Fn(&str, &str) -> Box<dyn Transport>>;

// Top-level registry of interfaces and VRIDs (§4.11); the boundary
// between this crate and the external FEA / config mirror / RPC layers
// (§1, §6). Target lifetime strictly contains vif lifetime, which
// strictly contains instance lifetime (§9 "Cyclic ownership").
pub struct VrrpTarget {
    ifs: BTreeMap<String, BTreeMap<String, VrrpVif>>,
    running: bool,
    xrls_pending: u32,
    transport_factory: TransportFactory,
    timers: Rc<RefCell<TimerList>>,
    pending_config: Option<TreeSnapshot>,
    debounce_deadline: Option<TimeVal>,
}

impl VrrpTarget {
    pub fn new(transport_factory: TransportFactory) -> VrrpTarget {
        VrrpTarget {
            ifs: BTreeMap::new(),
            running: true,
            xrls_pending: 0,
            transport_factory,
            timers: Rc::new(RefCell::new(TimerList::new())),
            pending_config: None,
            debounce_deadline: None,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    // Shutdown is complete when the running flag is false and there are
    // no outstanding transport requests pending (§4.11, §9 "Shutdown
    // sequencing").
    pub fn shutdown_complete(&self) -> bool {
        !self.running && self.xrls_pending == 0
    }

    pub fn request_started(&mut self) {
        self.xrls_pending += 1;
    }

    pub fn request_completed(&mut self) {
        self.xrls_pending = self.xrls_pending.saturating_sub(1);
    }

    // Advances every vif's timer wheel and, once the debounce window
    // from the last `updates_made` has elapsed, applies the held
    // configuration snapshot. Driven once per `EventLoop` iteration by
    // the owning process (§2 "EventLoop"); tests call it directly.
    pub fn tick(&mut self, now: TimeVal) {
        self.timers.borrow_mut().run(now);
        for vifs in self.ifs.values_mut() {
            for vif in vifs.values_mut() {
                vif.tick(now);
            }
        }

        if let Some(deadline) = self.debounce_deadline {
            if now >= deadline {
                self.debounce_deadline = None;
                if let Some(snapshot) = self.pending_config.take() {
                    self.apply_snapshot(&snapshot, now);
                }
            }
        }
    }

    fn find_vif(
        &mut self,
        ifname: &str,
        vifname: &str,
        create: bool,
    ) -> Option<&mut VrrpVif> {
        if create && !self.ifs.contains_key(ifname) {
            self.ifs.insert(ifname.to_string(), BTreeMap::new());
        }
        let vifs = self.ifs.get_mut(ifname)?;
        if create && !vifs.contains_key(vifname) {
            let transport = (self.transport_factory)(ifname, vifname);
            let vif = VrrpVif::new(
                ifname.to_string(),
                vifname.to_string(),
                transport,
                self.timers.clone(),
            );
            vifs.insert(vifname.to_string(), vif);
        }
        vifs.get_mut(vifname)
    }

    fn get_vif(
        &mut self,
        ifname: &str,
        vifname: &str,
    ) -> Result<&mut VrrpVif, ConfigError> {
        self.find_vif(ifname, vifname, false)
            .ok_or(ConfigError::VridNotFound(0))
    }

    // ===== administrative operations (§6, §8 boundary behaviours) =====

    pub fn add_vrid(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        let vif = self
            .find_vif(ifname, vifname, true)
            .expect("just created if absent");
        vif.add_vrid(vrid, &Default::default(), now)
    }

    pub fn delete_vrid(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?.delete_vrid(vrid, now)
    }

    pub fn set_priority(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        priority: u8,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?
            .set_priority(vrid, priority, now)
    }

    pub fn set_interval(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        interval: u16,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?
            .set_interval(vrid, interval, now)
    }

    pub fn set_preempt(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        preempt: bool,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?.set_preempt(vrid, preempt)
    }

    pub fn set_disable(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        disable: bool,
        now: TimeVal,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?
            .set_disable(vrid, disable, now)
    }

    pub fn add_ip(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?.add_ip(vrid, addr, prefix_len)
    }

    pub fn set_prefix(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?
            .set_prefix(vrid, addr, prefix_len)
    }

    pub fn delete_ip(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
        addr: Ipv4Addr,
    ) -> Result<(), ConfigError> {
        self.get_vif(ifname, vifname)?.delete_ip(vrid, addr)
    }

    pub fn get_vrid_info(
        &mut self,
        ifname: &str,
        vifname: &str,
        vrid: u8,
    ) -> Result<(String, Option<Ipv4Addr>), ConfigError> {
        self.get_vif(ifname, vifname)?.get_vrid_info(vrid)
    }

    pub fn get_vrids(&self, ifname: &str, vifname: &str) -> Vec<u8> {
        self.ifs
            .get(ifname)
            .and_then(|vifs| vifs.get(vifname))
            .map(|vif| vif.vrids())
            .unwrap_or_default()
    }

    pub fn get_ifs(&self) -> Vec<String> {
        self.ifs.keys().cloned().collect()
    }

    pub fn get_vifs(&self, ifname: &str) -> Vec<String> {
        self.ifs
            .get(ifname)
            .map(|vifs| vifs.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ===== configuration mirror observer (§6, §4.11) =====

    // Called once when the rtrmgr configuration tree is first received.
    // Applies the snapshot immediately: there is no prior state to
    // debounce against.
    pub fn tree_complete(&mut self, tree: &impl ConfigTree, now: TimeVal) {
        self.apply_snapshot(&tree.snapshot(), now);
    }

    // Called on every subsequent configuration change. Debounced per §9
    // "MAC manipulation thrash": the snapshot is held for
    // `CONFIG_DEBOUNCE` and only the last one received within that window
    // is applied, collapsing a burst of updates (including ones this
    // process's own MAC installs provoked) into a single `configure()`
    // pass per vif.
    pub fn updates_made(&mut self, tree: &impl ConfigTree, now: TimeVal) {
        self.pending_config = Some(tree.snapshot());
        if self.debounce_deadline.is_none() {
            self.debounce_deadline = Some(now + CONFIG_DEBOUNCE);
        }
    }

    fn apply_snapshot(&mut self, tree: &TreeSnapshot, now: TimeVal) {
        for (ifname, iface_cfg) in &tree.interfaces {
            for (vifname, vif_cfg) in &iface_cfg.vifs {
                let vif = self
                    .find_vif(ifname, vifname, true)
                    .expect("just created if absent");
                vif.configure(vif_cfg, now);
            }
        }

        // Vifs that disappeared from the tree entirely stop running but
        // are not removed from the registry: `VrrpTarget` owns the vif
        // map for as long as the target itself lives (§9).
        for (ifname, vifs) in self.ifs.iter_mut() {
            let Some(iface_cfg) = tree.interfaces.get(ifname) else {
                for vif in vifs.values_mut() {
                    vif.configure(&Default::default(), now);
                }
                continue;
            };
            for (vifname, vif) in vifs.iter_mut() {
                if !iface_cfg.vifs.contains_key(vifname) {
                    vif.configure(&Default::default(), now);
                }
            }
        }
    }

    // Begins shutdown: every vif's VRIDs send their final advertisement
    // and uninstall their virtual MAC (INITIALIZE), then the running flag
    // drops. `shutdown_complete` still gates on outstanding transport
    // requests (§9 "Shutdown sequencing").
    pub fn shutdown(&mut self, now: TimeVal) {
        info!("shutting down vrrp target");
        for vifs in self.ifs.values_mut() {
            for vif in vifs.values_mut() {
                vif.configure(&Default::default(), now);
            }
        }
        self.running = false;
    }
}
