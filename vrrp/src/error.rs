//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn, warn_span};

use crate::packet::DecodeError;

// VRRP errors.
#[derive(Debug)]
pub enum Error {
    // Wire-format reject (§4.7, §7 "validation failures").
    Decode(DecodeError),
    // Advertisement arrived with the wrong IP TTL (must be 255).
    InvalidTtl(u8),
    // Advertisement arrived on an IP protocol other than 112.
    InvalidProto(u8),
    // Advertisement's VRID does not match any instance on the vif.
    UnknownVrid(u8),
    IoError(IoError),
    // A transport RPC to the FEA failed. Per §7 this is treated as fatal:
    // the core assumes the FEA contract is load-bearing.
    TransportFailed(String),
}

// VRRP I/O errors: failures of the raw sockets themselves, as opposed to
// rejects of a well-formed-but-invalid packet.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    SendError(std::io::Error),
    RecvError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::Decode(_)
            | Error::InvalidTtl(_)
            | Error::InvalidProto(_)
            | Error::UnknownVrid(_) => {
                warn_span!("virtual_router").in_scope(|| {
                    warn!("{}", self);
                });
            }
            Error::IoError(error) => error.log(),
            Error::TransportFailed(_) => {
                warn_span!("virtual_router").in_scope(|| {
                    error!("{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Decode(error) => write!(f, "failed to decode packet: {error}"),
            Error::InvalidTtl(ttl) => {
                write!(f, "advertisement TTL {ttl} is not 255")
            }
            Error::InvalidProto(proto) => {
                write!(f, "advertisement IP protocol {proto} is not 112")
            }
            Error::UnknownVrid(vrid) => {
                write!(f, "advertisement for unknown VRID {vrid}")
            }
            Error::IoError(error) => error.fmt(f),
            Error::TransportFailed(msg) => {
                write!(f, "transport request to the FEA failed: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(error) => Some(error),
            Error::IoError(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Error {
        Error::Decode(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::SendError(error)
            | IoError::RecvError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => write!(f, "failed to create socket"),
            IoError::SendError(..) => write!(f, "failed to send packet"),
            IoError::RecvError(..) => write!(f, "failed to receive packet"),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::SendError(error)
            | IoError::RecvError(error) => Some(error),
        }
    }
}

// VRRP administrative-operation validation errors (§8 boundary
// behaviours). Unlike `Error`, these reject a caller-initiated config
// change rather than something received off the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    VridOutOfRange(u8),
    VridExists(u8),
    VridNotFound(u8),
    PriorityOutOfRange(u8),
    IntervalOutOfRange(u16),
    IpNotFound(std::net::Ipv4Addr),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::VridOutOfRange(vrid) => {
                write!(f, "VRID {vrid} is out of the 1..255 range")
            }
            ConfigError::VridExists(vrid) => {
                write!(f, "VRID {vrid} already exists on this vif")
            }
            ConfigError::VridNotFound(vrid) => {
                write!(f, "VRID {vrid} does not exist on this vif")
            }
            ConfigError::PriorityOutOfRange(priority) => {
                write!(f, "priority {priority} is out of the 1..254 range")
            }
            ConfigError::IntervalOutOfRange(interval) => {
                write!(f, "advertisement interval {interval} is out of the 1..255 range")
            }
            ConfigError::IpNotFound(addr) => {
                write!(f, "address {addr} is not configured on this VRID")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
