//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use lattice_utils::Area;
use tracing::warn;

// KvStore errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    Io(IoError),
    // Wire protocol
    MessageEncode(bincode::error::EncodeError),
    MessageDecode(bincode::error::DecodeError),
    FrameTooLarge(u32),
    UnexpectedMessage,
    // Peer synchronization
    FullSyncTimeout(String),
    // Requests
    UnknownArea(Area),
    StoreShutDown,
}

// KvStore I/O errors.
#[derive(Debug)]
pub enum IoError {
    BindError(std::io::Error),
    AcceptError(std::io::Error),
    ConnectError(std::io::Error),
    RecvError(std::io::Error),
    SendError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::Io(error) => {
                error.log();
            }
            Error::MessageEncode(error) => {
                warn!(%error, "{}", self);
            }
            Error::MessageDecode(error) => {
                warn!(%error, "{}", self);
            }
            Error::FrameTooLarge(size) => {
                warn!(%size, "{}", self);
            }
            Error::UnexpectedMessage => {
                warn!("{}", self);
            }
            Error::FullSyncTimeout(peer) => {
                warn!(%peer, "{}", self);
            }
            Error::UnknownArea(area) => {
                warn!(%area, "{}", self);
            }
            Error::StoreShutDown => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(error) => error.fmt(f),
            Error::MessageEncode(..) => {
                write!(f, "failed to encode message")
            }
            Error::MessageDecode(..) => {
                write!(f, "failed to decode message")
            }
            Error::FrameTooLarge(..) => {
                write!(f, "frame exceeds maximum size")
            }
            Error::UnexpectedMessage => {
                write!(f, "unexpected message")
            }
            Error::FullSyncTimeout(..) => {
                write!(f, "full-sync timed out")
            }
            Error::UnknownArea(..) => {
                write!(f, "unknown area")
            }
            Error::StoreShutDown => {
                write!(f, "store task is not running")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            Error::MessageEncode(error) => Some(error),
            Error::MessageDecode(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::Io(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::BindError(error)
            | IoError::AcceptError(error)
            | IoError::ConnectError(error)
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
            IoError::BindError(..) => {
                write!(f, "failed to bind listener")
            }
            IoError::AcceptError(..) => {
                write!(f, "failed to accept connection")
            }
            IoError::ConnectError(..) => {
                write!(f, "failed to connect to peer")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive message")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send message")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::BindError(error)
            | IoError::AcceptError(error)
            | IoError::ConnectError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
        }
    }
}
