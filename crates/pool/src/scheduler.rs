//! SCHEDULER boundary (spec §1 "out of scope"): fair, bandwidth-accounted
//! read/write over a file descriptor. The pool only needs to record and
//! read back byte counters; the reference implementation here is a plain
//! atomic counter table, not a fair scheduler — a real deployment plugs in
//! one that actually rate-limits.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::ConnectionId;

/// Bandwidth counters for one connection, or the whole pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl std::ops::Add for Stat {
    type Output = Stat;

    fn add(self, rhs: Stat) -> Stat {
        Stat {
            bytes_read: self.bytes_read + rhs.bytes_read,
            bytes_written: self.bytes_written + rhs.bytes_written,
        }
    }
}

/// Read anywhere without synchronization is tolerated (best-effort
/// snapshot, spec §5) — hence plain atomics rather than a lock per read.
pub trait Scheduler: Send + Sync + 'static {
    /// Register a new connection's counters; must be called once per
    /// connection before any `account_*` call for that id.
    fn register(&self, id: ConnectionId);

    /// Drop a connection's counters once it is torn down.
    fn unregister(&self, id: ConnectionId);

    fn account_read(&self, id: ConnectionId, bytes: usize);
    fn account_write(&self, id: ConnectionId, bytes: usize);

    /// Best-effort snapshot for a single connection.
    fn connection_stat(&self, id: ConnectionId) -> Option<Stat>;

    /// Best-effort snapshot summed over every registered connection.
    fn pool_stat(&self) -> Stat;
}

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    written: AtomicU64,
}

/// Reference [`Scheduler`]: per-connection atomic counters behind a
/// registration table, no actual fairness or rate limiting applied.
#[derive(Default)]
pub struct AtomicScheduler {
    counters: Mutex<HashMap<ConnectionId, Arc<Counters>>>,
}

impl AtomicScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for AtomicScheduler {
    fn register(&self, id: ConnectionId) {
        self.counters
            .lock()
            .expect("scheduler counters lock poisoned")
            .entry(id)
            .or_insert_with(|| Arc::new(Counters::default()));
    }

    fn unregister(&self, id: ConnectionId) {
        self.counters
            .lock()
            .expect("scheduler counters lock poisoned")
            .remove(&id);
    }

    fn account_read(&self, id: ConnectionId, bytes: usize) {
        if let Some(c) = self
            .counters
            .lock()
            .expect("scheduler counters lock poisoned")
            .get(&id)
        {
            c.read.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    fn account_write(&self, id: ConnectionId, bytes: usize) {
        if let Some(c) = self
            .counters
            .lock()
            .expect("scheduler counters lock poisoned")
            .get(&id)
        {
            c.written.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    fn connection_stat(&self, id: ConnectionId) -> Option<Stat> {
        self.counters
            .lock()
            .expect("scheduler counters lock poisoned")
            .get(&id)
            .map(|c| Stat {
                bytes_read: c.read.load(Ordering::Relaxed),
                bytes_written: c.written.load(Ordering::Relaxed),
            })
    }

    fn pool_stat(&self) -> Stat {
        self.counters
            .lock()
            .expect("scheduler counters lock poisoned")
            .values()
            .fold(Stat::default(), |acc, c| {
                acc + Stat {
                    bytes_read: c.read.load(Ordering::Relaxed),
                    bytes_written: c.written.load(Ordering::Relaxed),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_reads_and_writes_per_connection() {
        let sched = AtomicScheduler::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        sched.register(a);
        sched.register(b);

        sched.account_read(a, 10);
        sched.account_write(a, 5);
        sched.account_read(b, 1);

        assert_eq!(
            sched.connection_stat(a),
            Some(Stat {
                bytes_read: 10,
                bytes_written: 5
            })
        );
        assert_eq!(sched.pool_stat().bytes_read, 11);

        sched.unregister(a);
        assert_eq!(sched.connection_stat(a), None);
    }
}
