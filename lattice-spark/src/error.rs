//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{warn, warn_span};

// Spark errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Packet input
    PacketDecode(String, DecodeError),
    PacketReject(String, RejectReason),
    // Adjacency setup
    LabelExhausted(String),
    // Requests
    TaskShutDown,
}

// Spark I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    MulticastJoinError(std::io::Error),
    RecvError(std::io::Error),
    SendError(std::io::Error),
}

// Discovery packet decode errors.
#[derive(Debug)]
pub enum DecodeError {
    PacketTooLarge(usize),
    Malformed(bincode::error::DecodeError),
}

// Reasons a discovery packet or adjacency is refused.
#[derive(Debug, Eq, PartialEq)]
pub enum RejectReason {
    DomainMismatch(String),
    VersionTooOld(u32),
    OwnPacket,
    HopLimit(u8),
    RateLimited,
    MissingV4Addr,
    V4SubnetMismatch,
    NoCommonArea,
    MultipleCommonAreas,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::PacketDecode(ifname, error) => {
                warn_span!("interface", name = %ifname).in_scope(|| {
                    warn!(%error, "{}", self);
                });
            }
            Error::PacketReject(ifname, reason) => {
                warn_span!("interface", name = %ifname).in_scope(|| {
                    warn!(%reason, "{}", self);
                });
            }
            Error::LabelExhausted(ifname) => {
                warn!(%ifname, "{}", self);
            }
            Error::TaskShutDown => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::PacketDecode(..) => {
                write!(f, "failed to decode packet")
            }
            Error::PacketReject(..) => {
                write!(f, "packet rejected")
            }
            Error::LabelExhausted(..) => {
                write!(f, "no adjacency label available")
            }
            Error::TaskShutDown => {
                write!(f, "spark task is not running")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
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

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => {
                warn!(%error, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => {
                write!(f, "failed to create multicast socket")
            }
            IoError::MulticastJoinError(..) => {
                write!(f, "failed to join multicast group")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive packet")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send packet")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
        }
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::PacketTooLarge(size) => {
                write!(f, "packet too large: {} bytes", size)
            }
            DecodeError::Malformed(..) => {
                write!(f, "malformed packet")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ===== impl RejectReason =====

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DomainMismatch(domain) => {
                write!(f, "domain mismatch: {}", domain)
            }
            RejectReason::VersionTooOld(version) => {
                write!(f, "unsupported version: {}", version)
            }
            RejectReason::OwnPacket => {
                write!(f, "own packet looped back")
            }
            RejectReason::HopLimit(hops) => {
                write!(f, "hop limit too low: {}", hops)
            }
            RejectReason::RateLimited => {
                write!(f, "rate limit exceeded")
            }
            RejectReason::MissingV4Addr => {
                write!(f, "no IPv4 address in handshake")
            }
            RejectReason::V4SubnetMismatch => {
                write!(f, "IPv4 address outside the interface subnet")
            }
            RejectReason::NoCommonArea => {
                write!(f, "no common area")
            }
            RejectReason::MultipleCommonAreas => {
                write!(f, "more than one common area")
            }
        }
    }
}
