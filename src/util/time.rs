//! Monotonic timestamps for broadcast messages.

use serde::{Deserialize, Serialize};

/// A reading of the system monotonic clock.
///
/// All processes on one machine share the clock, so a timestamp identifies
/// the emission of a message well enough to recognise its echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    #[must_use]
    pub const fn new(secs: u64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Read the monotonic clock.
    #[cfg(unix)]
    #[must_use]
    pub fn now() -> Self {
        let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
        Self {
            secs: u64::try_from(ts.tv_sec).unwrap_or(0),
            nanos: u32::try_from(ts.tv_nsec).unwrap_or(0),
        }
    }

    /// Fallback for platforms without a shared monotonic clock.
    #[cfg(not(unix))]
    #[must_use]
    pub fn now() -> Self {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_does_not_go_backwards() {
        let first = Timestamp::now();
        let second = Timestamp::now();
        assert!(second >= first);
    }

    #[test]
    fn display_pads_nanos() {
        assert_eq!(Timestamp::new(12, 5).to_string(), "12.000000005");
    }
}
