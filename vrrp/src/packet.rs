//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Wire formats this crate speaks: the VRRP advertisement, the IPv4 header
//! it rides inside, the Ethernet framing both it and ARP ride inside, and
//! the ARP packet the gratuitous/reply traffic uses.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use internet_checksum::Checksum;
use serde::{Deserialize, Serialize};

use crate::bytes::{BytesExt, BytesMutExt};
use crate::consts::{
    ARP_HW_TYPE_ETHERNET, ARP_PROTO_TYPE_IPV4, IP_HDR_MAX_LENGTH,
    IP_HDR_MIN_LENGTH, VRRP_AUTH_TYPE_NONE, VRRP_HDR_LENGTH,
    VRRP_HDR_TYPE_ADVERTISEMENT, VRRP_MAX_IP_COUNT, VRRP_MAX_PKT_LENGTH,
    VRRP_MIN_PKT_LENGTH, VRRP_VERSION,
};
use crate::mac_addr::MacAddr;

pub type DecodeResult<T> = Result<T, DecodeError>;

// Errors that reject an incoming wire packet. Each is locally recoverable:
// the caller logs and drops the packet (§7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    PacketLengthError,
    VersionError,
    HdrTypeError,
    ChecksumError,
    IpCountMismatch,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::PacketLengthError => {
                write!(f, "packet length out of range")
            }
            DecodeError::VersionError => write!(f, "invalid VRRP version"),
            DecodeError::HdrTypeError => write!(f, "invalid VRRP header type"),
            DecodeError::ChecksumError => write!(f, "invalid checksum"),
            DecodeError::IpCountMismatch => {
                write!(f, "ip-count does not match payload length")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

//
// VRRP advertisement header, network byte order.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Version| Type  | Virtual Rtr ID|   Priority    | Count IP Addrs|
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |   Auth Type   |   Adver Int   |          Checksum             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         IP Address (1..n)                     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                     Authentication Data (1)                   |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                     Authentication Data (2)                   |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct VrrpHdr {
    pub version: u8,
    pub hdr_type: u8,
    pub vrid: u8,
    pub priority: u8,
    pub count_ip: u8,
    pub auth_type: u8,
    pub adver_int: u8,
    pub checksum: u16,
    pub ip_addresses: Vec<Ipv4Addr>,
    // Legacy auth fields (RFC 3768 §5.3.10). Always zero; authentication
    // beyond "none" is out of scope.
    pub auth_data: u32,
    pub auth_data2: u32,
}

impl VrrpHdr {
    pub fn new(
        vrid: u8,
        priority: u8,
        adver_int: u8,
        ip_addresses: Vec<Ipv4Addr>,
    ) -> Self {
        VrrpHdr {
            version: VRRP_VERSION,
            hdr_type: VRRP_HDR_TYPE_ADVERTISEMENT,
            vrid,
            priority,
            count_ip: ip_addresses.len() as u8,
            auth_type: VRRP_AUTH_TYPE_NONE,
            adver_int,
            checksum: 0,
            ip_addresses,
            auth_data: 0,
            auth_data2: 0,
        }
    }

    // Encodes the header with a freshly computed checksum. The input
    // value of `self.checksum` is ignored.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            VRRP_HDR_LENGTH + self.ip_addresses.len() * 4 + 8,
        );
        buf.put_u8((self.version << 4) | self.hdr_type);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_ip);
        buf.put_u8(self.auth_type);
        buf.put_u8(self.adver_int);
        buf.put_u16(0);
        for addr in &self.ip_addresses {
            buf.put_ipv4(addr);
        }
        buf.put_u32(self.auth_data);
        buf.put_u32(self.auth_data2);

        let mut cksum = Checksum::new();
        cksum.add_bytes(&buf);
        buf[6..8].copy_from_slice(&cksum.checksum());
        buf
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < VRRP_MIN_PKT_LENGTH || data.len() > VRRP_MAX_PKT_LENGTH
        {
            return Err(DecodeError::PacketLengthError);
        }

        let mut cksum = Checksum::new();
        cksum.add_bytes(&data[..6]);
        cksum.add_bytes(&[0, 0]);
        cksum.add_bytes(&data[8..]);
        let checksum = u16::from_be_bytes([data[6], data[7]]);
        if cksum.checksum() != checksum.to_be_bytes() {
            return Err(DecodeError::ChecksumError);
        }

        let mut buf = Bytes::copy_from_slice(data);
        let version_type = buf.get_u8();
        let version = version_type >> 4;
        let hdr_type = version_type & 0x0f;
        if version != VRRP_VERSION {
            return Err(DecodeError::VersionError);
        }
        if hdr_type != VRRP_HDR_TYPE_ADVERTISEMENT {
            return Err(DecodeError::HdrTypeError);
        }

        let vrid = buf.get_u8();
        let priority = buf.get_u8();
        let count_ip = buf.get_u8();
        let auth_type = buf.get_u8();
        let adver_int = buf.get_u8();
        let _checksum = buf.get_u16();

        let expected_len =
            VRRP_HDR_LENGTH + (count_ip as usize) * 4 + 8;
        if expected_len > data.len()
            || count_ip as usize > VRRP_MAX_IP_COUNT
        {
            return Err(DecodeError::IpCountMismatch);
        }

        let mut ip_addresses = Vec::with_capacity(count_ip as usize);
        for _ in 0..count_ip {
            ip_addresses.push(
                buf.try_get_ipv4()
                    .map_err(|_| DecodeError::PacketLengthError)?,
            );
        }
        let auth_data = buf.get_u32();
        let auth_data2 = buf.get_u32();

        Ok(VrrpHdr {
            version,
            hdr_type,
            vrid,
            priority,
            count_ip,
            auth_type,
            adver_int,
            checksum,
            ip_addresses,
            auth_data,
            auth_data2,
        })
    }
}

//
// IPv4 header. Only the fields this crate must read or set are kept
// distinct; options (when `ihl > 5`) are carried opaquely.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv4Hdr {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_address: Ipv4Addr,
    pub dst_address: Ipv4Addr,
    pub options: Option<Vec<u8>>,
    pub padding: Option<Vec<u8>>,
}

impl Ipv4Hdr {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(IP_HDR_MAX_LENGTH);
        buf.put_u8((self.version << 4) | self.ihl);
        buf.put_u8(self.tos);
        buf.put_u16(self.total_length);
        buf.put_u16(self.identification);
        buf.put_u16(((self.flags as u16) << 13) | self.offset);
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u16(0);
        buf.put_ipv4(&self.src_address);
        buf.put_ipv4(&self.dst_address);
        if let Some(options) = &self.options {
            buf.put_slice(options);
        }
        if let Some(padding) = &self.padding {
            buf.put_slice(padding);
        }

        let mut cksum = Checksum::new();
        cksum.add_bytes(&buf);
        buf[10..12].copy_from_slice(&cksum.checksum());
        buf
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < IP_HDR_MIN_LENGTH {
            return Err(DecodeError::PacketLengthError);
        }

        let ihl = data[0] & 0x0f;
        let hdr_len = ihl as usize * 4;
        if hdr_len < IP_HDR_MIN_LENGTH || hdr_len > data.len() {
            return Err(DecodeError::PacketLengthError);
        }

        let mut cksum = Checksum::new();
        cksum.add_bytes(&data[..10]);
        cksum.add_bytes(&[0, 0]);
        cksum.add_bytes(&data[12..hdr_len]);
        let checksum = u16::from_be_bytes([data[10], data[11]]);
        if cksum.checksum() != checksum.to_be_bytes() {
            return Err(DecodeError::ChecksumError);
        }

        let mut buf = Bytes::copy_from_slice(&data[..hdr_len]);
        let version_ihl = buf.get_u8();
        let version = version_ihl >> 4;
        let tos = buf.get_u8();
        let total_length = buf.get_u16();
        let identification = buf.get_u16();
        let flags_offset = buf.get_u16();
        let flags = (flags_offset >> 13) as u8;
        let offset = flags_offset & 0x1fff;
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        let _checksum = buf.get_u16();
        let src_address = buf.try_get_ipv4().unwrap();
        let dst_address = buf.try_get_ipv4().unwrap();
        let options = if hdr_len > IP_HDR_MIN_LENGTH {
            Some(buf.to_vec())
        } else {
            None
        };

        Ok(Ipv4Hdr {
            version,
            ihl,
            tos,
            total_length,
            identification,
            flags,
            offset,
            ttl,
            protocol,
            checksum,
            src_address,
            dst_address,
            options,
            padding: None,
        })
    }
}

// Ethernet II frame header (no payload; the payload is whatever wire
// format follows: IPv4+VRRP or ARP).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct EthernetHdr {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ethertype: u16,
}

impl EthernetHdr {
    pub const LENGTH: usize = 14;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::LENGTH);
        buf.put_slice(&self.dst_mac);
        buf.put_slice(&self.src_mac);
        buf.put_u16(self.ethertype);
        buf
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < Self::LENGTH {
            return Err(DecodeError::PacketLengthError);
        }
        let mut buf = Bytes::copy_from_slice(&data[..Self::LENGTH]);
        let dst_mac = buf.try_get_mac().unwrap().as_bytes();
        let src_mac = buf.try_get_mac().unwrap().as_bytes();
        let ethertype = buf.get_u16();
        Ok(EthernetHdr { dst_mac, src_mac, ethertype })
    }
}

// ARP packet (RFC 826), specialised to the Ethernet/IPv4 combination this
// crate ever sends or parses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ArpPacket {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_length: u8,
    pub proto_length: u8,
    pub operation: u16,
    pub sender_hw_address: [u8; 6],
    pub sender_proto_address: [u8; 4],
    pub target_hw_address: [u8; 6],
    pub target_proto_address: [u8; 4],
}

impl ArpPacket {
    pub const LENGTH: usize = 28;

    pub fn new(
        operation: u16,
        sender_hw_address: MacAddr,
        sender_proto_address: Ipv4Addr,
        target_hw_address: [u8; 6],
        target_proto_address: Ipv4Addr,
    ) -> Self {
        ArpPacket {
            hw_type: ARP_HW_TYPE_ETHERNET,
            proto_type: ARP_PROTO_TYPE_IPV4,
            hw_length: 6,
            proto_length: 4,
            operation,
            sender_hw_address: sender_hw_address.as_bytes(),
            sender_proto_address: sender_proto_address.octets(),
            target_hw_address,
            target_proto_address: target_proto_address.octets(),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::LENGTH);
        buf.put_u16(self.hw_type);
        buf.put_u16(self.proto_type);
        buf.put_u8(self.hw_length);
        buf.put_u8(self.proto_length);
        buf.put_u16(self.operation);
        buf.put_slice(&self.sender_hw_address);
        buf.put_slice(&self.sender_proto_address);
        buf.put_slice(&self.target_hw_address);
        buf.put_slice(&self.target_proto_address);
        buf
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < Self::LENGTH {
            return Err(DecodeError::PacketLengthError);
        }
        let mut buf = Bytes::copy_from_slice(&data[..Self::LENGTH]);
        let hw_type = buf.get_u16();
        let proto_type = buf.get_u16();
        let hw_length = buf.get_u8();
        let proto_length = buf.get_u8();
        let operation = buf.get_u16();
        let mut sender_hw_address = [0u8; 6];
        buf.copy_to_slice(&mut sender_hw_address);
        let mut sender_proto_address = [0u8; 4];
        buf.copy_to_slice(&mut sender_proto_address);
        let mut target_hw_address = [0u8; 6];
        buf.copy_to_slice(&mut target_hw_address);
        let mut target_proto_address = [0u8; 4];
        buf.copy_to_slice(&mut target_proto_address);

        Ok(ArpPacket {
            hw_type,
            proto_type,
            hw_length,
            proto_length,
            operation,
            sender_hw_address,
            sender_proto_address,
            target_hw_address,
            target_proto_address,
        })
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.sender_proto_address)
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.target_proto_address)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn vrrphdr_fixture() -> (Vec<u8>, VrrpHdr) {
        (
            vec![
                0x21, 0x33, 0x1e, 0x01, 0x00, 0x01, 0xb5, 0xc5, 0x0a, 0x00,
                0x01, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
            VrrpHdr {
                version: 2,
                hdr_type: 1,
                vrid: 51,
                priority: 30,
                count_ip: 1,
                auth_type: 0,
                adver_int: 1,
                checksum: 0xb5c5,
                ip_addresses: vec![Ipv4Addr::new(10, 0, 1, 5)],
                auth_data: 0,
                auth_data2: 0,
            },
        )
    }

    fn ipv4hdr_fixture() -> (Vec<u8>, Ipv4Hdr) {
        (
            vec![
                0x45, 0xc0, 0x00, 0x28, 0x08, 0x9d, 0x00, 0x00, 0xff, 0x70,
                0xad, 0x4b, 0xc0, 0xa8, 0x64, 0x02, 0xe0, 0x00, 0x00, 0x12,
            ],
            Ipv4Hdr {
                version: 4,
                ihl: 5,
                tos: 0xc0,
                total_length: 40,
                identification: 0x089d,
                flags: 0,
                offset: 0,
                ttl: 255,
                protocol: 112,
                checksum: 0xad4b,
                src_address: Ipv4Addr::new(192, 168, 100, 2),
                dst_address: Ipv4Addr::new(224, 0, 0, 18),
                options: None,
                padding: None,
            },
        )
    }

    fn ethernethdr_fixture() -> (Vec<u8>, EthernetHdr) {
        (
            vec![
                0x01, 0x00, 0x5e, 0x00, 0x00, 0x12, 0x00, 0x00, 0x5e, 0x00,
                0x01, 0x33, 0x08, 0x00,
            ],
            EthernetHdr {
                dst_mac: [0x01, 0x00, 0x5e, 0x00, 0x00, 0x12],
                src_mac: [0x00, 0x00, 0x5e, 0x00, 0x01, 0x33],
                ethertype: 0x0800,
            },
        )
    }

    #[test]
    fn encode_vrrphdr() {
        let (bytes, hdr) = vrrphdr_fixture();
        assert_eq!(hdr.encode().as_ref(), bytes.as_slice());
    }

    #[test]
    fn decode_vrrphdr() {
        let (bytes, hdr) = vrrphdr_fixture();
        assert_eq!(VrrpHdr::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn decode_vrrp_wrong_checksum() {
        let (mut bytes, _) = vrrphdr_fixture();
        bytes[6] = 0;
        bytes[7] = 0;
        assert_eq!(
            VrrpHdr::decode(&bytes),
            Err(DecodeError::ChecksumError)
        );
    }

    #[test]
    fn decode_vrrp_too_short() {
        assert_eq!(
            VrrpHdr::decode(&[0u8; 4]),
            Err(DecodeError::PacketLengthError)
        );
    }

    #[test]
    fn encode_ipv4hdr() {
        let (bytes, hdr) = ipv4hdr_fixture();
        assert_eq!(hdr.encode().as_ref(), bytes.as_slice());
    }

    #[test]
    fn decode_ipv4hdr() {
        let (bytes, hdr) = ipv4hdr_fixture();
        assert_eq!(Ipv4Hdr::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn decode_ipv4_wrong_checksum() {
        let (mut bytes, _) = ipv4hdr_fixture();
        bytes[10] = 0;
        bytes[11] = 0;
        assert_eq!(
            Ipv4Hdr::decode(&bytes),
            Err(DecodeError::ChecksumError)
        );
    }

    #[test]
    fn encode_ethernethdr() {
        let (bytes, hdr) = ethernethdr_fixture();
        assert_eq!(hdr.encode().as_ref(), bytes.as_slice());
    }

    #[test]
    fn decode_ethernethdr() {
        let (bytes, hdr) = ethernethdr_fixture();
        assert_eq!(EthernetHdr::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn arp_packet_round_trip() {
        let data: [u8; 28] = [
            0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01, 0xd4, 0xb1,
            0x08, 0x4c, 0xbb, 0xf9, 0xc0, 0xa8, 0x64, 0x01, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0xc0, 0xa8, 0x64, 0x10,
        ];
        let pkt = ArpPacket::decode(&data).unwrap();
        assert_eq!(pkt.operation, 1);
        assert_eq!(pkt.sender_ip(), Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(pkt.target_ip(), Ipv4Addr::new(192, 168, 100, 16));
        assert_eq!(pkt.encode().as_ref(), &data[..]);
    }

    #[test]
    fn arp_packet_too_short() {
        assert_eq!(
            ArpPacket::decode(&[0x01]),
            Err(DecodeError::PacketLengthError)
        );
    }
}
