//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// Protocol version carried in every hello.
pub const VERSION: u32 = 2;
pub const LOWEST_SUPPORTED_VERSION: u32 = 2;

// Largest accepted datagram.
pub const MAX_PACKET_SIZE: usize = 8192;

// Discovery datagram. All messages of one node share the UDP socket, so
// the variant tag travels on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SparkMsg {
    Hello(HelloMsg),
    Handshake(HandshakeMsg),
    Heartbeat(HeartbeatMsg),
}

// Periodic multicast announcement. Carries the reflected view of every
// neighbor heard on the interface, which drives two-way discovery and
// RTT measurement.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HelloMsg {
    pub node_name: String,
    pub domain: String,
    pub if_name: String,
    pub seq_num: u64,
    pub version: u32,
    // Neighbors heard on this interface, keyed by node name.
    pub neighbor_infos: BTreeMap<String, ReflectedNeighborInfo>,
    // Sender's timestamp at transmission, microseconds.
    pub sent_ts_us: u64,
    // Sender is in fast-discovery cadence and wants an immediate reply.
    pub solicit_response: bool,
    // Sender is gracefully restarting.
    pub restarting: bool,
    pub flood_opt_support: bool,
    pub areas: Vec<String>,
}

// Per-neighbor reflection inside a hello.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ReflectedNeighborInfo {
    // Last sequence number seen from this neighbor.
    pub seq_num: u64,
    // When the neighbor sent the hello we last received (its clock).
    pub last_nbr_msg_sent_ts_us: u64,
    // When we received that hello (our clock).
    pub last_my_msg_rcvd_ts_us: u64,
}

// Unicast-ish negotiation message, multicast on the interface but
// addressed by node name.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HandshakeMsg {
    pub node_name: String,
    // Set once the sender considers the adjacency established.
    pub is_adj_established: bool,
    pub hold_time_ms: u64,
    pub graceful_restart_time_ms: u64,
    pub v4_addr: Option<Ipv4Addr>,
    pub v6_addr: Ipv6Addr,
    pub area: String,
    pub ctrl_port: u16,
    pub kv_port: u16,
}

// Cheap liveness beacon refreshing the hold timer of an established
// adjacency.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HeartbeatMsg {
    pub node_name: String,
    pub seq_num: u64,
}

// ===== impl SparkMsg =====

impl SparkMsg {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(data: &[u8]) -> Result<SparkMsg, DecodeError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::PacketTooLarge(data.len()));
        }
        let (msg, _) = bincode::serde::decode_from_slice(
            data,
            bincode::config::standard(),
        )
        .map_err(DecodeError::Malformed)?;
        Ok(msg)
    }

    pub fn node_name(&self) -> &str {
        match self {
            SparkMsg::Hello(msg) => &msg.node_name,
            SparkMsg::Handshake(msg) => &msg.node_name,
            SparkMsg::Heartbeat(msg) => &msg.node_name,
        }
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let msg = SparkMsg::Hello(HelloMsg {
            node_name: "node1".to_owned(),
            domain: "lab".to_owned(),
            if_name: "eth0".to_owned(),
            seq_num: 42,
            version: VERSION,
            neighbor_infos: BTreeMap::from([(
                "node2".to_owned(),
                ReflectedNeighborInfo {
                    seq_num: 7,
                    last_nbr_msg_sent_ts_us: 1_000,
                    last_my_msg_rcvd_ts_us: 2_000,
                },
            )]),
            sent_ts_us: 123_456,
            solicit_response: true,
            restarting: false,
            flood_opt_support: true,
            areas: vec!["0".to_owned()],
        });

        let encoded = msg.encode().unwrap();
        let decoded = SparkMsg::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(SparkMsg::decode(&[0xff; 32]).is_err());
    }
}
