//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::warn;

// Config store errors.
#[derive(Debug)]
pub enum Error {
    // Requested key doesn't exist.
    NotFound(String),
    // Record log I/O failure.
    Io(std::io::Error),
    // Record serialization failure.
    RecordEncode(bincode::error::EncodeError),
    // The store task is gone.
    StoreShutDown,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::NotFound(key) => {
                warn!(%key, "{}", self);
            }
            Error::Io(error) => {
                warn!(%error, "{}", self);
            }
            Error::RecordEncode(error) => {
                warn!(%error, "{}", self);
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
            Error::NotFound(..) => {
                write!(f, "config key not found")
            }
            Error::Io(..) => {
                write!(f, "record log I/O error")
            }
            Error::RecordEncode(..) => {
                write!(f, "failed to encode record")
            }
            Error::StoreShutDown => {
                write!(f, "config store task is not running")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            Error::RecordEncode(error) => Some(error),
            _ => None,
        }
    }
}
