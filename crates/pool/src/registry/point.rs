//! Point registry (spec §4.1, §4.2): the known-set of reachable network
//! addresses, independent of the identity reachable there.
use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::error::Error;
use crate::registry::event_log::EventLog;
use crate::registry::peer::PeerId;
use crate::time::Timestamp;

pub type PointId = SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PointEvent {
    DialRequested,
    InboundAccepted,
    Running,
    Disconnected { reason: String },
    Evicted,
}

/// Lifecycle state of a network address (spec §4.2). No entry in the
/// registry means the address has never been mentioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PointState {
    Requested,
    Accepted { peer_id: PeerId },
    Running { peer_id: PeerId, connection: ConnectionId },
    Disconnected { since: Timestamp },
}

impl PointState {
    fn is_in_flight_or_running(&self) -> bool {
        !matches!(self, PointState::Disconnected { .. })
    }

    pub fn disconnected_since(&self) -> Option<Timestamp> {
        match self {
            PointState::Disconnected { since } => Some(*since),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointInfo {
    pub trusted: bool,
    pub last_seen: Timestamp,
    pub last_known_peer_id: Option<PeerId>,
    pub state: PointState,
    pub history: EventLog<PointEvent>,
}

impl PointInfo {
    fn fresh(history_size: usize, trusted: bool) -> Self {
        Self {
            trusted,
            last_seen: Timestamp::now(),
            last_known_peer_id: None,
            state: PointState::Disconnected {
                since: Timestamp::now(),
            },
            history: EventLog::new(history_size),
        }
    }
}

pub struct PointRegistry {
    points: HashMap<PointId, PointInfo>,
    history_size: usize,
}

impl PointRegistry {
    pub fn new(history_size: usize) -> Self {
        Self {
            points: HashMap::new(),
            history_size,
        }
    }

    pub fn get(&self, id: &PointId) -> Option<&PointInfo> {
        self.points.get(id)
    }

    pub fn get_or_create(&mut self, id: PointId) -> &mut PointInfo {
        let history_size = self.history_size;
        self.points
            .entry(id)
            .or_insert_with(|| PointInfo::fresh(history_size, false))
    }

    pub fn set_trusted(&mut self, id: &PointId) {
        if let Some(info) = self.points.get_mut(id) {
            info.trusted = true;
        }
    }

    pub fn unset_trusted(&mut self, id: &PointId) {
        if let Some(info) = self.points.get_mut(id) {
            info.trusted = false;
        }
    }

    pub fn is_trusted(&self, id: &PointId) -> bool {
        self.points.get(id).map(|i| i.trusted).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PointId, &PointInfo)> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn log_event(&mut self, id: &PointId, event: PointEvent) {
        if let Some(info) = self.points.get_mut(id) {
            info.history.push(event);
        }
    }

    /// `*` → `Requested` (invariant 8: fails if a dial/accept is already
    /// in flight for this point).
    pub fn begin_outbound(&mut self, id: PointId) -> Result<(), Error> {
        let history_size = self.history_size;
        let info = self
            .points
            .entry(id)
            .or_insert_with(|| PointInfo::fresh(history_size, false));

        if info.state.is_in_flight_or_running() {
            return Err(Error::PendingConnection);
        }
        info.state = PointState::Requested;
        info.last_seen = Timestamp::now();
        info.history.push(PointEvent::DialRequested);
        Ok(())
    }

    /// `Disconnected|absent` → `Accepted{pid}` (invariant 8).
    pub fn begin_inbound(&mut self, id: PointId, peer_id: PeerId) -> Result<(), Error> {
        let history_size = self.history_size;
        let info = self
            .points
            .entry(id)
            .or_insert_with(|| PointInfo::fresh(history_size, false));

        if info.state.is_in_flight_or_running() {
            return Err(Error::PendingConnection);
        }
        info.state = PointState::Accepted { peer_id };
        info.last_seen = Timestamp::now();
        info.history.push(PointEvent::InboundAccepted);
        Ok(())
    }

    /// `Requested|Accepted` → `Running`.
    pub fn complete_running(
        &mut self,
        id: &PointId,
        peer_id: PeerId,
        connection: ConnectionId,
    ) -> Result<(), Error> {
        let info = self.points.get_mut(id).ok_or(Error::ConnectionClosed)?;
        match info.state {
            PointState::Requested | PointState::Accepted { .. } => {
                info.state = PointState::Running {
                    peer_id: peer_id.clone(),
                    connection,
                };
                info.last_known_peer_id = Some(peer_id);
                info.last_seen = Timestamp::now();
                info.history.push(PointEvent::Running);
                Ok(())
            }
            _ => Err(Error::PendingConnection),
        }
    }

    /// `Running|Accepted|Requested` → `Disconnected{now}` on any failure
    /// or close.
    pub fn mark_disconnected(&mut self, id: &PointId, reason: impl Into<String>) {
        let Some(info) = self.points.get_mut(id) else {
            return;
        };
        if let PointState::Running { peer_id, .. } = &info.state {
            info.last_known_peer_id = Some(peer_id.clone());
        }
        info.state = PointState::Disconnected {
            since: Timestamp::now(),
        };
        info.history.push(PointEvent::Disconnected {
            reason: reason.into(),
        });
    }

    /// GC policy (spec §4.1): oldest `disconnected_since` first, skipping
    /// trusted and non-disconnected entries, down to `lower`.
    pub fn gc(&mut self, upper: usize, lower: usize) -> Vec<PointId> {
        if self.points.len() <= upper {
            return Vec::new();
        }

        let mut candidates: Vec<(PointId, Timestamp)> = self
            .points
            .iter()
            .filter(|(_, info)| !info.trusted)
            .filter_map(|(id, info)| info.state.disconnected_since().map(|since| (*id, since)))
            .collect();
        candidates.sort_by_key(|(_, since)| since.to_owned());

        let mut evicted = Vec::new();
        for (id, _) in candidates {
            if self.points.len() <= lower {
                break;
            }
            self.points.remove(&id);
            evicted.push(id);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PointId {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn cannot_dial_a_point_with_an_in_flight_attempt() {
        let mut reg = PointRegistry::new(50);
        reg.begin_outbound(addr(1)).unwrap();
        let err = reg.begin_outbound(addr(1)).unwrap_err();
        assert!(matches!(err, Error::PendingConnection));
    }

    #[test]
    fn gc_keeps_lower_bound_newest_disconnected_and_trusted() {
        let mut reg = PointRegistry::new(50);
        for port in 1..=5u16 {
            reg.get_or_create(addr(port));
            reg.mark_disconnected(&addr(port), "test");
        }
        reg.set_trusted(&addr(1));

        let evicted = reg.gc(4, 2);
        assert!(!evicted.contains(&addr(1)));
        assert!(reg.len() >= 2);
    }

    #[quickcheck_macros::quickcheck]
    fn gc_never_evicts_trusted_points(total: u8, trusted_count: u8, upper: u8, lower: u8) -> quickcheck::TestResult {
        let total = (total % 40) as u16;
        let trusted_count = trusted_count as u16 % (total + 1);
        let upper = upper as usize % 30;
        let lower = lower as usize % (upper + 1);

        let mut reg = PointRegistry::new(50);
        for port in 1..=total {
            reg.get_or_create(addr(port));
            reg.mark_disconnected(&addr(port), "test");
            if port <= trusted_count {
                reg.set_trusted(&addr(port));
            }
        }

        reg.gc(upper, lower);

        let all_trusted_survive = (1..=trusted_count).all(|port| reg.get(&addr(port)).is_some());
        quickcheck::TestResult::from_bool(all_trusted_survive)
    }
}
