//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use tracing::{debug, debug_span};

use crate::instance::State;
use crate::packet::VrrpHdr;

// VRRP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceCreate(u8),
    InstanceDelete(u8),
    InstanceStart(u8),
    InstanceStop(u8, StopReason),
    StateChange(u8, State, State),
    // Network
    PacketRx(&'a Ipv4Addr, &'a VrrpHdr),
    PacketTx(&'a Ipv4Addr, &'a VrrpHdr),
    ArpReply(&'a Ipv4Addr),
}

// Reason an instance transitioned into INITIALIZE.
#[derive(Clone, Copy, Debug)]
pub enum StopReason {
    AdminDisable,
    VifNotReady,
}

// ===== impl Debug =====

impl Debug<'_> {
    pub fn log(&self) {
        match self {
            Debug::InstanceCreate(vrid)
            | Debug::InstanceDelete(vrid)
            | Debug::InstanceStart(vrid) => {
                debug_span!("virtual_router", vrid).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::InstanceStop(vrid, reason) => {
                debug_span!("virtual_router", vrid).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::StateChange(vrid, from, to) => {
                debug_span!("virtual_router", vrid).in_scope(|| {
                    debug!(%from, %to, "{}", self);
                });
            }
            Debug::PacketRx(src, packet) => {
                debug_span!("network").in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(&packet).unwrap();
                        debug!(%src, %data, "{}", self);
                    })
                })
            }
            Debug::PacketTx(dst, packet) => {
                debug_span!("network").in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data = serde_json::to_string(&packet).unwrap();
                        debug!(%dst, %data, "{}", self);
                    })
                })
            }
            Debug::ArpReply(target) => {
                debug_span!("network").in_scope(|| {
                    debug!(%target, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceCreate(..) => write!(f, "instance created"),
            Debug::InstanceDelete(..) => write!(f, "instance deleted"),
            Debug::InstanceStart(..) => write!(f, "starting instance"),
            Debug::InstanceStop(..) => write!(f, "stopping instance"),
            Debug::StateChange(..) => write!(f, "state change"),
            Debug::PacketRx(..) => write!(f, "advertisement received"),
            Debug::PacketTx(..) => write!(f, "advertisement sent"),
            Debug::ArpReply(..) => write!(f, "arp reply sent"),
        }
    }
}

// ===== impl StopReason =====

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::AdminDisable => write!(f, "administratively disabled"),
            StopReason::VifNotReady => write!(f, "vif not ready"),
        }
    }
}
