//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use lattice_utils::mpls::Label;
use lattice_utils::routing::NextHop;

/// Platform route-programming interface.
///
/// The real implementation talks to the kernel or a vendor SDK; it
/// lives outside this crate and is injected at daemon startup.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn add_unicast_routes(
        &mut self,
        routes: Vec<(IpNetwork, Vec<NextHop>)>,
    ) -> std::io::Result<()>;

    async fn delete_unicast_routes(
        &mut self,
        prefixes: Vec<IpNetwork>,
    ) -> std::io::Result<()>;

    async fn add_mpls_routes(
        &mut self,
        routes: Vec<(Label, Vec<NextHop>)>,
    ) -> std::io::Result<()>;

    async fn delete_mpls_routes(
        &mut self,
        labels: Vec<Label>,
    ) -> std::io::Result<()>;

    /// The platform's current view, used by the periodic reconcile.
    async fn get_route_table(
        &mut self,
    ) -> std::io::Result<BTreeMap<IpNetwork, Vec<NextHop>>>;

    async fn get_mpls_table(
        &mut self,
    ) -> std::io::Result<BTreeMap<Label, Vec<NextHop>>>;
}

/// In-memory platform used by tests and dry runs. State is shared so a
/// test can inspect or perturb it from outside while the agent owns
/// the API handle.
#[derive(Clone, Debug, Default)]
pub struct MockPlatform {
    pub state: Arc<Mutex<MockPlatformState>>,
}

#[derive(Debug, Default)]
pub struct MockPlatformState {
    pub unicast: BTreeMap<IpNetwork, Vec<NextHop>>,
    pub mpls: BTreeMap<Label, Vec<NextHop>>,
    // When set, the next programming call fails once.
    pub fail_next: bool,
}

// ===== impl MockPlatform =====

impl MockPlatform {
    fn check_failure(&self) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next {
            state.fail_next = false;
            return Err(std::io::Error::other("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn add_unicast_routes(
        &mut self,
        routes: Vec<(IpNetwork, Vec<NextHop>)>,
    ) -> std::io::Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        state.unicast.extend(routes);
        Ok(())
    }

    async fn delete_unicast_routes(
        &mut self,
        prefixes: Vec<IpNetwork>,
    ) -> std::io::Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        for prefix in prefixes {
            state.unicast.remove(&prefix);
        }
        Ok(())
    }

    async fn add_mpls_routes(
        &mut self,
        routes: Vec<(Label, Vec<NextHop>)>,
    ) -> std::io::Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        state.mpls.extend(routes);
        Ok(())
    }

    async fn delete_mpls_routes(
        &mut self,
        labels: Vec<Label>,
    ) -> std::io::Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        for label in labels {
            state.mpls.remove(&label);
        }
        Ok(())
    }

    async fn get_route_table(
        &mut self,
    ) -> std::io::Result<BTreeMap<IpNetwork, Vec<NextHop>>> {
        Ok(self.state.lock().unwrap().unicast.clone())
    }

    async fn get_mpls_table(
        &mut self,
    ) -> std::io::Result<BTreeMap<Label, Vec<NextHop>>> {
        Ok(self.state.lock().unwrap().mpls.clone())
    }
}
