//! Monotonic wall-clock helpers shared by the registries, handshake timers
//! and the swap engine's rate limiter.
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time, measured in whole seconds since the Unix epoch.
///
/// Monotonic: [`Timestamp::now`] never returns a value earlier than the last
/// one it returned, even if the system clock is adjusted backwards.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, serde::Serialize, serde::Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Construct a timestamp from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).0;
        let last = LAST.load(atomic::Ordering::SeqCst);

        if now < last {
            Self(last)
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self(now)
        }
    }

    /// Construct a timestamp from whole seconds since the Unix epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Seconds since the Unix epoch.
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since `earlier`. Saturates to zero rather than
    /// panicking if `earlier` is actually later.
    pub fn elapsed_since(&self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_secs(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(system: SystemTime) -> Self {
        let secs = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(secs)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Sub for Timestamp {
    type Output = std::time::Duration;

    fn sub(self, other: Timestamp) -> std::time::Duration {
        std::time::Duration::from_secs(self.0.saturating_sub(other.0))
    }
}
