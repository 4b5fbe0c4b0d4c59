//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod backoff;
pub mod mpls;
pub mod routing;
pub mod socket;
pub mod step_detector;
pub mod task;
pub mod timeseries;

use serde::{Deserialize, Serialize};

/// Administrative partition of the network. Adjacencies form only between
/// nodes sharing exactly one area, and KvStore peers replicate only within
/// common areas.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Area(pub String);

impl Area {
    // Area used when the operator doesn't configure any.
    pub const DEFAULT: &'static str = "0";

    pub fn default_area() -> Area {
        Area(Area::DEFAULT.to_owned())
    }
}

impl std::fmt::Display for Area {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Area {
    fn from(area: &str) -> Area {
        Area(area.to_owned())
    }
}
