//! Configuration surface (see spec §6). A plain `serde`-deserializable
//! struct, loaded by `apps/node` with the `config` crate the same way
//! `apps/node/src/config/p2p.rs` loads `P2pConfig`.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Local keypair and proof-of-work stamp identifying this node to peers.
///
/// The actual cryptography (key generation, PoW solving) lives in the
/// identity module, explicitly out of scope for this crate (spec §1); this
/// is the opaque shape the pool needs to hand to TRANSPORT during a
/// handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Public identity bytes, used as this node's `PeerId` and compared
    /// against an incoming peer's id to detect self-dials.
    pub public_id: Vec<u8>,
    /// Proof-of-work stamp proving `public_id` was not trivially generated.
    pub pow_stamp: Vec<u8>,
}

/// One recognized application-message codec entry (spec §9: "existentially
/// quantified encoding entries"). `tag` must not collide with the reserved
/// control tags `0x01..=0x05`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Protocol versions offered during negotiation, in preference order.
    pub versions: Vec<u16>,
    /// Registered user-message tags and their maximum payload length.
    pub max_lengths: std::collections::HashMap<u8, usize>,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            versions: vec![1],
            max_lengths: std::collections::HashMap::new(),
        }
    }
}

/// Caller-supplied metadata codec selection, used only for persistence
/// (spec §6 "Persisted state").
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetaEncoding {
    #[default]
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub encoding: MetaEncoding,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            encoding: MetaEncoding::Json,
        }
    }
}

fn default_min_connections() -> usize {
    4
}

fn default_max_connections() -> usize {
    50
}

fn default_max_incoming_connections() -> usize {
    20
}

fn default_connection_timeout_secs() -> u64 {
    10
}

fn default_authentication_timeout_secs() -> u64 {
    5
}

fn default_incoming_message_queue_size() -> usize {
    256
}

fn default_outgoing_message_queue_size() -> usize {
    256
}

fn default_history_size() -> usize {
    50
}

fn default_swap_linger_secs() -> u64 {
    30
}

fn default_binary_chunks_size() -> usize {
    65_536
}

/// Full configuration surface of the pool (spec §6 table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub identity: Identity,

    /// Minimum proof-of-work difficulty accepted from peers during auth.
    pub proof_of_work_target: u64,

    /// Pinned, never-evicted bootstrap addresses.
    #[serde(default)]
    pub trusted_points: Vec<SocketAddr>,

    /// JSON persistence path; `None` disables persistence.
    #[serde(default)]
    pub peers_file: Option<PathBuf>,

    /// If set, reject connections to/from points not in `trusted_points`.
    #[serde(default)]
    pub closed_network: bool,

    /// Port advertised to peers during authentication.
    #[serde(default)]
    pub listening_port: Option<u16>,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_incoming_connections")]
    pub max_incoming_connections: usize,

    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_authentication_timeout_secs")]
    pub authentication_timeout_secs: u64,

    /// Per-connection bound on the app-queue; `None` means unbounded (not
    /// recommended, see spec §4.4).
    #[serde(default)]
    pub incoming_app_message_queue_size: Option<usize>,

    #[serde(default = "default_incoming_message_queue_size")]
    pub incoming_message_queue_size: usize,
    #[serde(default = "default_outgoing_message_queue_size")]
    pub outgoing_message_queue_size: usize,

    #[serde(default = "default_history_size")]
    pub known_peer_ids_history_size: usize,
    #[serde(default = "default_history_size")]
    pub known_points_history_size: usize,

    /// `(upper, lower)` GC thresholds; `None` disables GC for that table.
    #[serde(default)]
    pub max_known_points: Option<(usize, usize)>,
    #[serde(default)]
    pub max_known_peer_ids: Option<(usize, usize)>,

    #[serde(default = "default_swap_linger_secs")]
    pub swap_linger_secs: u64,

    #[serde(default = "default_binary_chunks_size")]
    pub binary_chunks_size: usize,

    #[serde(default)]
    pub message: MessageConfig,
    #[serde(default)]
    pub meta: MetaConfig,
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn authentication_timeout(&self) -> Duration {
        Duration::from_secs(self.authentication_timeout_secs)
    }

    pub fn swap_linger(&self) -> Duration {
        Duration::from_secs(self.swap_linger_secs)
    }
}
