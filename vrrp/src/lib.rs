//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod arp;
pub mod bytes;
pub mod config;
pub mod consts;
pub mod debug;
pub mod error;
pub mod instance;
pub mod interface;
pub mod mac_addr;
pub mod packet;
pub mod target;
pub mod transport;

pub use instance::VrrpInstance;
pub use interface::VrrpVif;
pub use target::VrrpTarget;
