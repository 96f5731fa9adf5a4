//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

// VRRP header is 8 bytes; with at least one IP address and the 8-byte
// trailing auth field, the smallest legal advertisement is 24 bytes.
pub const VRRP_HDR_LENGTH: usize = 8;
pub const VRRP_AUTH_LENGTH: usize = 8;
pub const VRRP_MIN_PKT_LENGTH: usize = VRRP_HDR_LENGTH + 4 + VRRP_AUTH_LENGTH;
pub const VRRP_MAX_PKT_LENGTH: usize = 80;
pub const VRRP_MAX_IP_COUNT: usize = 16;

pub const IP_HDR_MIN_LENGTH: usize = 20;
pub const IP_HDR_MAX_LENGTH: usize = 24;

pub const VRRP_VERSION: u8 = 2;
pub const VRRP_HDR_TYPE_ADVERTISEMENT: u8 = 1;
pub const VRRP_AUTH_TYPE_NONE: u8 = 0;

pub const VRRP_PROTO_NUMBER: u8 = 112;
pub const VRRP_IP_TTL: u8 = 255;
pub const VRRP_MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

// Destination MAC used for every advertisement and the multicast group the
// vif joins at the link layer to receive them.
pub const VRRP_MULTICAST_MAC: [u8; 6] =
    [0x01, 0x00, 0x5e, 0x00, 0x00, 0x12];

pub const ARP_BROADCAST_MAC: [u8; 6] = [0xff; 6];
pub const ARP_HW_TYPE_ETHERNET: u16 = 1;
pub const ARP_PROTO_TYPE_IPV4: u16 = 0x0800;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IP: u16 = 0x0800;

// Priority reserved for the router that owns every virtual IP (RFC 3768
// §6.2): this router never listens for an advertisement from a peer and
// always wins any tie-break.
pub const VRRP_PRIORITY_OWNER: u8 = 255;
// Priority value carried on the wire to signal "I am leaving the master
// role" (§7).
pub const VRRP_PRIORITY_LEAVING: u8 = 0;

pub const VRID_MIN: u8 = 1;
pub const VRID_MAX: u8 = 255;
