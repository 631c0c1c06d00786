use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::time::{SystemTime, UNIX_EPOCH};

use Clock::{Mock, System};

/// A source of time. Timestamps throughout Marathon are milliseconds since
/// the Unix epoch.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Clock source based on the system clock.
    System,

    /// Only for testing: cloned mocks share the underlying time value.
    Mock(Arc<AtomicU64>),
}

impl Clock {
    pub fn new_mock(now_ms: u64) -> Clock {
        Mock(Arc::new(AtomicU64::new(now_ms)))
    }

    /// Milliseconds since the Unix epoch.
    pub fn epoch_millis(&self) -> u64 {
        match self {
            System => match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(n) => n.as_millis() as u64,
                Err(e) => panic!("SystemTime before UNIX EPOCH! {e:?}"),
            },
            Mock(now) => now.load(SeqCst),
        }
    }

    /// Sets the current time of this Mock clock.
    /// For test use only.
    pub fn set_time(&self, now_ms: u64) {
        match self {
            System => unreachable!(),
            Mock(n) => n.store(now_ms, SeqCst),
        }
    }

    /// Moves this Mock clock forward.
    /// For test use only.
    pub fn advance_millis(&self, delta_ms: u64) {
        match self {
            System => unreachable!(),
            Mock(n) => n.store(n.load(SeqCst) + delta_ms, SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let before = System.epoch_millis();
        let after = System.epoch_millis();
        assert!(after >= before);
        // A plausible date (2020-01-01 or later)
        assert!(before > 1_577_836_800_000);
    }

    #[test]
    fn mock_clock_is_controllable() {
        let clock = Clock::new_mock(1_000);
        assert_eq!(clock.epoch_millis(), 1_000);

        clock.set_time(5_000);
        assert_eq!(clock.epoch_millis(), 5_000);

        clock.advance_millis(250);
        assert_eq!(clock.epoch_millis(), 5_250);
    }

    #[test]
    fn cloned_mocks_share_underlying_time() {
        let clock1 = Clock::new_mock(10);
        let clock2 = clock1.clone();

        clock1.set_time(77);
        assert_eq!(clock2.epoch_millis(), 77);
    }
}
