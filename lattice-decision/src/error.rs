//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::warn;

// Decision errors.
#[derive(Debug)]
pub enum Error {
    // A routing record couldn't be decoded.
    ValueDecode(String, bincode::error::DecodeError),
    // KvStore interaction failed.
    KvStore(lattice_kvstore::Error),
    // The decision task is gone.
    TaskShutDown,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::ValueDecode(key, error) => {
                warn!(%key, %error, "{}", self);
            }
            Error::KvStore(error) => {
                warn!(%error, "{}", self);
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
            Error::ValueDecode(..) => {
                write!(f, "failed to decode routing record")
            }
            Error::KvStore(..) => {
                write!(f, "store request failed")
            }
            Error::TaskShutDown => {
                write!(f, "decision task is not running")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ValueDecode(_, error) => Some(error),
            Error::KvStore(error) => Some(error),
            _ => None,
        }
    }
}

impl From<lattice_kvstore::Error> for Error {
    fn from(error: lattice_kvstore::Error) -> Error {
        Error::KvStore(error)
    }
}
