//! Bounded rolling event log shared by the point and peer registries
//! (spec §4.1: "rolling event log of fixed capacity (default 50)").
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry<E> {
    pub at: Timestamp,
    pub event: E,
}

/// A fixed-capacity FIFO log: `push` drops the oldest entry once the log
/// is at capacity instead of growing unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog<E> {
    capacity: usize,
    entries: VecDeque<LogEntry<E>>,
}

impl<E> EventLog<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, event: E) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            at: Timestamp::now(),
            event,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry<E>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_entry_past_capacity() {
        let mut log: EventLog<u32> = EventLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        let kept: Vec<u32> = log.iter().map(|e| e.event).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }
}
