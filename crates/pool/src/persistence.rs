//! Persistence (spec §4.9): load/save the known-set to JSON on disk.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::peer::{PeerId, PeerRegistry};
use crate::registry::point::{PointId, PointRegistry};
use crate::time::Timestamp;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPoint {
    addr: PointId,
    trusted: bool,
    last_seen: Timestamp,
    last_known_peer_id: Option<PeerId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPeer {
    peer_id: PeerId,
    trusted: bool,
    last_seen: Timestamp,
    metadata: serde_json::Value,
    score: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownSetDocument {
    known_points: Vec<PersistedPoint>,
    known_peer_ids: Vec<PersistedPeer>,
}

/// Serialize `points`/`peers` to `path` atomically: write to a temp file
/// in the same directory, then rename over the destination.
pub fn save(path: &Path, points: &PointRegistry, peers: &PeerRegistry) -> Result<()> {
    let doc = KnownSetDocument {
        known_points: points
            .iter()
            .map(|(addr, info)| PersistedPoint {
                addr: *addr,
                trusted: info.trusted,
                last_seen: info.last_seen,
                last_known_peer_id: info.last_known_peer_id.clone(),
            })
            .collect(),
        known_peer_ids: peers
            .iter()
            .map(|(peer_id, info)| PersistedPeer {
                peer_id: peer_id.clone(),
                trusted: info.trusted,
                last_seen: info
                    .state
                    .disconnected_since()
                    .unwrap_or_else(Timestamp::now),
                metadata: info.metadata.clone(),
                score: info.score,
            })
            .collect(),
    };

    let bytes = serde_json::to_vec_pretty(&doc)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp_path = dir.to_path_buf();
    tmp_path.push(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("known-set")
    ));

    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a known-set document from `path`. Malformed entries are skipped
/// with a warning rather than failing the whole load.
pub fn load(path: &Path) -> Result<(Vec<(PointId, bool, Timestamp, Option<PeerId>)>, Vec<(PeerId, bool, serde_json::Value, i64)>)> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
        Err(e) => return Err(e.into()),
    };

    let doc: KnownSetDocument = match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(target: "pool", error = %e, "known-set file is malformed, starting empty");
            return Ok((Vec::new(), Vec::new()));
        }
    };

    let points = doc
        .known_points
        .into_iter()
        .map(|p| (p.addr, p.trusted, p.last_seen, p.last_known_peer_id))
        .collect();
    let peers = doc
        .known_peer_ids
        .into_iter()
        .map(|p| (p.peer_id, p.trusted, p.metadata, p.score))
        .collect();

    Ok((points, peers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_points_and_peers_modulo_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known-set.json");

        let mut points = PointRegistry::new(50);
        let addr: PointId = "127.0.0.1:9001".parse().unwrap();
        points.get_or_create(addr);
        points.set_trusted(&addr);

        let mut peers = PeerRegistry::new(50);
        let peer_id = PeerId::from_bytes(vec![1, 2, 3]);
        peers.get_or_create(peer_id.clone());
        peers.set_metadata(&peer_id, serde_json::json!({"agent": "test"}), 7);

        save(&path, &points, &peers).unwrap();
        let (loaded_points, loaded_peers) = load(&path).unwrap();

        assert_eq!(loaded_points.len(), 1);
        assert_eq!(loaded_points[0].0, addr);
        assert!(loaded_points[0].1);

        assert_eq!(loaded_peers.len(), 1);
        assert_eq!(loaded_peers[0].0, peer_id);
        assert_eq!(loaded_peers[0].3, 7);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let (points, peers) = load(&path).unwrap();
        assert!(points.is_empty());
        assert!(peers.is_empty());
    }
}
