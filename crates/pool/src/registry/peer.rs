//! Peer registry (spec §4.1, §4.3): the known-set of cryptographic
//! identities, distinct from the addresses they are reached at.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::error::Error;
use crate::registry::event_log::EventLog;
use crate::registry::point::PointId;
use crate::time::Timestamp;

/// A long-lived cryptographic identity. Opaque bytes; the identity module
/// (out of scope, spec §1) is responsible for generating and proving them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerEvent {
    HandshakeCompleted { point: PointId },
    Disconnected { reason: String },
    Evicted,
}

/// Lifecycle state of a peer identity (spec §4.3). No entry in the
/// registry means the implicit `unknown` state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerState {
    Running {
        connection: ConnectionId,
        point: PointId,
    },
    Disconnected {
        since: Timestamp,
        last_point: Option<PointId>,
    },
}

impl PeerState {
    pub fn is_running(&self) -> bool {
        matches!(self, PeerState::Running { .. })
    }

    pub fn disconnected_since(&self) -> Option<Timestamp> {
        match self {
            PeerState::Disconnected { since, .. } => Some(*since),
            PeerState::Running { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub trusted: bool,
    /// Opaque, caller-supplied and caller-versioned metadata blob
    /// (spec §3).
    pub metadata: serde_json::Value,
    /// Derived from `metadata` by the caller; the pool itself never
    /// interprets it beyond ordering swap-victim/candidate selection.
    pub score: i64,
    pub state: PeerState,
    pub history: EventLog<PeerEvent>,
}

impl PeerInfo {
    fn fresh(history_size: usize, trusted: bool) -> Self {
        Self {
            trusted,
            metadata: serde_json::Value::Null,
            score: 0,
            state: PeerState::Disconnected {
                since: Timestamp::now(),
                last_point: None,
            },
            history: EventLog::new(history_size),
        }
    }
}

pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerInfo>,
    history_size: usize,
}

impl PeerRegistry {
    pub fn new(history_size: usize) -> Self {
        Self {
            peers: HashMap::new(),
            history_size,
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn get_or_create(&mut self, id: PeerId) -> &mut PeerInfo {
        let history_size = self.history_size;
        self.peers
            .entry(id)
            .or_insert_with(|| PeerInfo::fresh(history_size, false))
    }

    pub fn set_trusted(&mut self, id: &PeerId) {
        if let Some(info) = self.peers.get_mut(id) {
            info.trusted = true;
        }
    }

    pub fn unset_trusted(&mut self, id: &PeerId) {
        if let Some(info) = self.peers.get_mut(id) {
            info.trusted = false;
        }
    }

    pub fn set_metadata(&mut self, id: &PeerId, metadata: serde_json::Value, score: i64) {
        if let Some(info) = self.peers.get_mut(id) {
            info.metadata = metadata;
            info.score = score;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerInfo)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn log_event(&mut self, id: &PeerId, event: PeerEvent) {
        if let Some(info) = self.peers.get_mut(id) {
            info.history.push(event);
        }
    }

    pub fn is_running(&self, id: &PeerId) -> bool {
        self.peers
            .get(id)
            .map(|info| info.state.is_running())
            .unwrap_or(false)
    }

    /// Invariant 4: a peer is in `Running` in at most one Connection. A
    /// second successful handshake is rejected with `AlreadyConnected`
    /// (spec §4.3).
    pub fn begin_running(
        &mut self,
        id: PeerId,
        connection: ConnectionId,
        point: PointId,
    ) -> Result<(), Error> {
        let history_size = self.history_size;
        let info = self
            .peers
            .entry(id)
            .or_insert_with(|| PeerInfo::fresh(history_size, false));

        if info.state.is_running() {
            return Err(Error::AlreadyConnected);
        }

        info.state = PeerState::Running { connection, point };
        Ok(())
    }

    pub fn mark_disconnected(&mut self, id: &PeerId, reason: impl Into<String>) {
        let Some(info) = self.peers.get_mut(id) else {
            return;
        };
        let last_point = match &info.state {
            PeerState::Running { point, .. } => Some(point.clone()),
            PeerState::Disconnected { last_point, .. } => last_point.clone(),
        };
        info.state = PeerState::Disconnected {
            since: Timestamp::now(),
            last_point,
        };
        info.history.push(PeerEvent::Disconnected {
            reason: reason.into(),
        });
    }

    /// GC policy (spec §4.1): oldest `disconnected_since` first, skipping
    /// trusted and non-disconnected entries, down to `lower`.
    pub fn gc(&mut self, upper: usize, lower: usize) -> Vec<PeerId> {
        if self.peers.len() <= upper {
            return Vec::new();
        }

        let mut candidates: Vec<(PeerId, Timestamp)> = self
            .peers
            .iter()
            .filter(|(_, info)| !info.trusted)
            .filter_map(|(id, info)| info.state.disconnected_since().map(|since| (id.clone(), since)))
            .collect();
        candidates.sort_by_key(|(_, since)| *since);

        let mut evicted = Vec::new();
        for (id, _) in candidates {
            if self.peers.len() <= lower {
                break;
            }
            self.peers.remove(&id);
            evicted.push(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> PeerId {
        PeerId::from_bytes(vec![n])
    }

    #[test]
    fn second_handshake_for_running_peer_is_rejected() {
        let mut reg = PeerRegistry::new(50);
        let point: PointId = "127.0.0.1:1".parse().unwrap();
        reg.begin_running(pid(1), ConnectionId::new(1), point.clone())
            .unwrap();

        let err = reg
            .begin_running(pid(1), ConnectionId::new(2), point)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected));
    }

    #[test]
    fn trusted_peers_survive_gc() {
        let mut reg = PeerRegistry::new(50);
        for i in 0..5u8 {
            reg.get_or_create(pid(i));
            reg.mark_disconnected(&pid(i), "test");
        }
        reg.set_trusted(&pid(0));

        let evicted = reg.gc(4, 2);
        assert!(!evicted.contains(&pid(0)));
        assert!(reg.len() >= 2);
    }
}
