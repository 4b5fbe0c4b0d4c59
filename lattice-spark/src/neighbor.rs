//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use lattice_utils::mpls::{Label, LabelRange};
use lattice_utils::step_detector::StepDetector;
use lattice_utils::task::{IntervalTask, TimeoutTask};

use crate::packet::ReflectedNeighborInfo;

// RTT samples below half a millisecond of change aren't worth
// reporting.
const RTT_STEP_ABS_THRESHOLD_US: u64 = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NeighborState {
    Idle,
    Warm,
    Negotiate,
    Established,
    Restart,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NeighborEvent {
    HelloRcvdInfo,
    HelloRcvdNoInfo,
    HelloRcvdRestart,
    HeartbeatRcvd,
    HandshakeRcvd,
    HeartbeatTimerExpire,
    NegotiateTimerExpire,
    GrTimerExpire,
}

/// Discovery state for one `(interface, neighbor)` pair.
#[derive(Debug)]
pub struct Neighbor {
    pub node_name: String,
    pub domain: String,
    pub if_name: String,
    pub remote_if_name: String,
    pub state: NeighborState,
    // Last sequence number seen from the neighbor.
    pub seq_num: u64,
    // The neighbor's view of us, reflected in its hellos.
    pub reflected: ReflectedNeighborInfo,
    // Areas the neighbor advertised in its last hello.
    pub advertised_areas: Vec<String>,
    // Common area negotiated from the hello exchange.
    pub area: Option<String>,
    // Transport addresses learned from the handshake.
    pub v4_addr: Option<Ipv4Addr>,
    pub v6_addr: Option<Ipv6Addr>,
    pub ctrl_port: u16,
    pub kv_port: u16,
    // Negotiated timers.
    pub hold_time: Duration,
    pub graceful_restart_time: Duration,
    // Segment-routing label assigned to this adjacency.
    pub label: Option<Label>,
    // RTT tracking.
    pub step_detector: StepDetector,
    pub rtt_latest_us: Option<u64>,
    // Timers. Dropping a handle cancels it.
    pub hold_timer: Option<TimeoutTask>,
    pub negotiate_timer: Option<TimeoutTask>,
    pub gr_timer: Option<TimeoutTask>,
    pub handshake_interval: Option<IntervalTask>,
}

/// Allocates adjacency labels from the configured local range,
/// preferring `base + ifindex` and falling back to a top-down scan.
#[derive(Debug)]
pub struct LabelAllocator {
    range: LabelRange,
    allocated: BTreeSet<u32>,
}

// ===== impl Neighbor =====

impl Neighbor {
    pub fn new(
        node_name: String,
        domain: String,
        if_name: String,
        remote_if_name: String,
    ) -> Neighbor {
        Neighbor {
            node_name,
            domain,
            if_name,
            remote_if_name,
            state: NeighborState::Idle,
            seq_num: 0,
            reflected: ReflectedNeighborInfo::default(),
            advertised_areas: vec![],
            area: None,
            v4_addr: None,
            v6_addr: None,
            ctrl_port: 0,
            kv_port: 0,
            hold_time: Duration::ZERO,
            graceful_restart_time: Duration::ZERO,
            label: None,
            step_detector: StepDetector::new(RTT_STEP_ABS_THRESHOLD_US),
            rtt_latest_us: None,
            hold_timer: None,
            negotiate_timer: None,
            gr_timer: None,
            handshake_interval: None,
        }
    }

    /// Feeds one RTT sample; returns the new level when a step was
    /// detected.
    pub fn track_rtt(&mut self, rtt_us: u64) -> Option<u64> {
        self.rtt_latest_us = Some(rtt_us);
        self.step_detector.add_value(rtt_us)
    }

    /// Cancels every running timer.
    pub fn stop_timers(&mut self) {
        self.hold_timer = None;
        self.negotiate_timer = None;
        self.gr_timer = None;
        self.handshake_interval = None;
    }
}

// ===== impl LabelAllocator =====

impl LabelAllocator {
    pub fn new(range: LabelRange) -> LabelAllocator {
        LabelAllocator {
            range,
            allocated: BTreeSet::new(),
        }
    }

    /// Allocates a label for the adjacency on the given interface.
    pub fn allocate(&mut self, ifindex: u32) -> Option<Label> {
        let preferred = self.range.lower_bound + ifindex;
        if self.range.contains(preferred)
            && self.allocated.insert(preferred)
        {
            return Label::new(preferred).ok();
        }

        // Preferred slot taken: scan downward from the top of the range.
        let mut candidate = self.range.upper_bound;
        while candidate >= self.range.lower_bound {
            if self.allocated.insert(candidate) {
                return Label::new(candidate).ok();
            }
            candidate -= 1;
        }
        None
    }

    pub fn release(&mut self, label: Label) {
        self.allocated.remove(&label.get());
    }
}

// ===== global functions =====

/// Computes the next neighbor state, or `None` when the event doesn't
/// apply in the current state.
///
/// Establishment always walks IDLE -> WARM -> NEGOTIATE -> ESTABLISHED;
/// graceful restart detours through RESTART and back.
pub fn fsm_transition(
    state: NeighborState,
    event: NeighborEvent,
) -> Option<NeighborState> {
    use NeighborEvent::*;
    use NeighborState::*;

    match (state, event) {
        (Idle, HelloRcvdInfo | HelloRcvdNoInfo) => Some(Warm),
        (Warm, HelloRcvdInfo) => Some(Negotiate),
        (Negotiate, HandshakeRcvd) => Some(Established),
        (Negotiate, NegotiateTimerExpire) => Some(Warm),
        (Established, HelloRcvdNoInfo) => Some(Idle),
        (Established, HelloRcvdRestart) => Some(Restart),
        (Established, HeartbeatRcvd) => Some(Established),
        (Established, HeartbeatTimerExpire) => Some(Idle),
        (Restart, HelloRcvdInfo) => Some(Established),
        (Restart, GrTimerExpire) => Some(Idle),
        _ => None,
    }
}

/// RTT from the four timestamps of a reflected hello exchange. The
/// neighbor's processing time is subtracted out, so only the two
/// one-way trips remain. Samples with out-of-order timestamps are
/// rejected; the result is rounded to whole milliseconds with a 1 ms
/// floor.
pub fn compute_rtt_us(
    my_sent_us: u64,
    nbr_rcvd_us: u64,
    nbr_sent_us: u64,
    my_rcvd_us: u64,
) -> Option<u64> {
    if my_rcvd_us <= my_sent_us || nbr_sent_us < nbr_rcvd_us {
        return None;
    }
    let total = my_rcvd_us - my_sent_us;
    let remote_hold = nbr_sent_us - nbr_rcvd_us;
    if remote_hold >= total {
        return None;
    }

    let rtt = total - remote_hold;
    Some(((rtt + 500) / 1000).max(1) * 1000)
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use NeighborEvent::*;
    use NeighborState::*;

    #[test]
    fn establishment_path() {
        let mut state = Idle;
        for (event, expected) in [
            (HelloRcvdInfo, Warm),
            (HelloRcvdInfo, Negotiate),
            (HandshakeRcvd, Established),
        ] {
            state = fsm_transition(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn no_shortcut_to_established() {
        // From IDLE and WARM, no single event reaches ESTABLISHED.
        for state in [Idle, Warm] {
            for event in [
                HelloRcvdInfo,
                HelloRcvdNoInfo,
                HelloRcvdRestart,
                HeartbeatRcvd,
                HandshakeRcvd,
                HeartbeatTimerExpire,
                NegotiateTimerExpire,
                GrTimerExpire,
            ] {
                assert_ne!(
                    fsm_transition(state, event),
                    Some(Established),
                    "{:?} + {:?}",
                    state,
                    event
                );
            }
        }
    }

    #[test]
    fn negotiate_falls_back_to_warm() {
        assert_eq!(
            fsm_transition(Negotiate, NegotiateTimerExpire),
            Some(Warm)
        );
    }

    #[test]
    fn graceful_restart_cycle() {
        assert_eq!(
            fsm_transition(Established, HelloRcvdRestart),
            Some(Restart)
        );
        assert_eq!(fsm_transition(Restart, HelloRcvdInfo), Some(Established));
        assert_eq!(fsm_transition(Restart, GrTimerExpire), Some(Idle));
    }

    #[test]
    fn established_liveness() {
        assert_eq!(
            fsm_transition(Established, HeartbeatRcvd),
            Some(Established)
        );
        assert_eq!(
            fsm_transition(Established, HeartbeatTimerExpire),
            Some(Idle)
        );
        assert_eq!(
            fsm_transition(Established, HelloRcvdNoInfo),
            Some(Idle)
        );
    }

    #[test]
    fn rtt_formula() {
        // 5ms round trip with 1ms spent on the neighbor.
        let rtt = compute_rtt_us(1_000, 3_000, 4_000, 6_000).unwrap();
        assert_eq!(rtt, 4_000);

        // Out-of-order timestamps are rejected.
        assert_eq!(compute_rtt_us(6_000, 3_000, 4_000, 1_000), None);
        assert_eq!(compute_rtt_us(1_000, 5_000, 4_000, 6_000), None);

        // Sub-millisecond results are floored to 1ms.
        assert_eq!(compute_rtt_us(1_000, 1_100, 1_200, 1_400), Some(1_000));
    }

    #[test]
    fn label_allocation_prefers_ifindex() {
        let range = LabelRange::new(1024, 1030).unwrap();
        let mut allocator = LabelAllocator::new(range);

        assert_eq!(allocator.allocate(2).unwrap().get(), 1026);
        // Collision scans down from the top of the range.
        assert_eq!(allocator.allocate(2).unwrap().get(), 1030);
        assert_eq!(allocator.allocate(2).unwrap().get(), 1029);

        allocator.release(Label::new(1030).unwrap());
        assert_eq!(allocator.allocate(6).unwrap().get(), 1030);

        // Exhaustion.
        assert!(allocator.allocate(0).is_some()); // 1024
        assert!(allocator.allocate(1).is_some()); // 1025
        assert!(allocator.allocate(3).is_some()); // 1027
        assert!(allocator.allocate(4).is_some()); // 1028
        assert!(allocator.allocate(0).is_none());
    }
}
