//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Shape of the external configuration mirror (§6, SPEC §3).
//!
//! The config tree itself lives outside this crate (it is the routing
//! manager's job, same as `holo_utils::ibus` sits behind `holo-vrrp`'s
//! northbound module); `VrrpTarget` only needs a concrete Rust value to
//! read from on `tree_complete`/`updates_made`. `TreeSnapshot` plays the
//! same role here that `IfMgrIfTree` plays for the original `vrrp_target.cc`,
//! trimmed to the fields this crate actually reads.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

// A full snapshot of the interface/vif/VRID configuration tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct TreeSnapshot {
    pub interfaces: BTreeMap<String, IfaceConfig>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct IfaceConfig {
    pub enabled: bool,
    pub vifs: BTreeMap<String, VifConfig>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct VifConfig {
    pub enabled: bool,
    pub addresses: Vec<Ipv4Network>,
    pub instances: BTreeMap<u8, InstanceConfig>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct InstanceConfig {
    pub priority: u8,
    pub interval: u8,
    pub preempt: bool,
    pub disable: bool,
    // Virtual IP -> prefix length.
    pub virtual_addresses: BTreeMap<Ipv4Addr, u8>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            priority: 100,
            interval: 1,
            preempt: true,
            disable: false,
            virtual_addresses: BTreeMap::new(),
        }
    }
}

// Observer interface the external config mirror drives `VrrpTarget`
// through. The target consumes `tree_complete` once and `updates_made`
// thereafter; no other events (§6).
pub trait ConfigTree {
    fn snapshot(&self) -> TreeSnapshot;
}

impl ConfigTree for TreeSnapshot {
    fn snapshot(&self) -> TreeSnapshot {
        self.clone()
    }
}
