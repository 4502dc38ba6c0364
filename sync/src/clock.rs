//! Wall-clock and id source for real sessions.

use chrono::Utc;
use tether_engine::{Clock, OperationId, Timestamp};
use uuid::Uuid;

/// Current wall-clock time in milliseconds since epoch.
pub fn wall_ms() -> Timestamp {
    Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Production clock: wall time with a monotonic clamp, UUIDv4 operation ids.
///
/// The clamp guarantees enqueue timestamps never go backwards within a
/// session even if the system clock does, so per-entity FIFO order stays
/// consistent with the log order.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_ms: Timestamp,
}

impl SystemClock {
    /// Create a system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&mut self) -> Timestamp {
        let now = wall_ms();
        self.last_ms = if now > self.last_ms {
            now
        } else {
            self.last_ms + 1
        };
        self.last_ms
    }

    fn next_operation_id(&mut self) -> OperationId {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_monotonic() {
        let mut clock = SystemClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        let c = clock.now_ms();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn ids_are_unique() {
        let mut clock = SystemClock::new();
        let a = clock.next_operation_id();
        let b = clock.next_operation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36); // uuid format
    }
}
