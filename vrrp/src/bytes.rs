//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! `bytes` crate extension traits shared by the packet codecs.
//!
//! Trimmed from the teacher's `holo-utils::bytes` down to the IPv4/MAC
//! helpers this crate's wire formats actually need.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};

use crate::mac_addr::MacAddr;

// Extension methods for Bytes.
pub trait BytesExt {
    // Gets an IPv4 address from `self` in big-endian byte order.
    //
    // Returns `Err(TryGetError)` when there are not enough remaining bytes
    // to read the value.
    fn try_get_ipv4(&mut self) -> Result<Ipv4Addr, TryGetError>;

    // Gets a MAC address from `self`.
    fn try_get_mac(&mut self) -> Result<MacAddr, TryGetError>;
}

// Extension methods for BytesMut.
pub trait BytesMutExt {
    // Writes an IPv4 address to `self` in big-endian byte order.
    fn put_ipv4(&mut self, addr: &Ipv4Addr);

    // Writes a MAC address to `self`.
    fn put_mac(&mut self, addr: &MacAddr);
}

// ===== impl Bytes =====

impl BytesExt for Bytes {
    fn try_get_ipv4(&mut self) -> Result<Ipv4Addr, TryGetError> {
        let bytes = self.try_get_u32()?;
        Ok(Ipv4Addr::from(bytes))
    }

    fn try_get_mac(&mut self) -> Result<MacAddr, TryGetError> {
        let mut bytes: [u8; MacAddr::LENGTH] = [0; MacAddr::LENGTH];
        self.try_copy_to_slice(&mut bytes)?;
        Ok(MacAddr::from(bytes))
    }
}

// ===== impl BytesMut =====

impl BytesMutExt for BytesMut {
    fn put_ipv4(&mut self, addr: &Ipv4Addr) {
        self.put_u32((*addr).into())
    }

    fn put_mac(&mut self, addr: &MacAddr) {
        self.put_slice(&addr.as_bytes())
    }
}
