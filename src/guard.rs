//! Process-local single-flight admission for upgrade checks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Admits at most one upgrade check at a time within this process.
///
/// Rejected callers get nothing: no queueing and no retry scheduling. The
/// next periodic trigger simply tries again. Cross-process exclusion is not
/// this guard's job; the artifact store's lock discipline covers that.
#[derive(Clone, Default)]
pub struct SingleFlightGuard {
    active: Arc<AtomicBool>,
}

impl SingleFlightGuard {
    /// Create an idle guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit a check. Returns a permit exactly once until the
    /// previous permit is dropped; concurrent calls return `None` with no
    /// side effect.
    pub fn try_admit(&self) -> Option<FlightPermit> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(FlightPermit {
                active: Arc::clone(&self.active),
            })
        } else {
            debug!("upgrade check already in flight; dropping trigger");
            None
        }
    }

    /// Returns `true` while a permit is live.
    pub fn in_flight(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Owned admission handle for one upgrade check.
///
/// Moved into the session worker; dropping it on any exit path (including
/// unwind) releases the guard.
pub struct FlightPermit {
    active: Arc<AtomicBool>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn admits_once_until_released() {
        let guard = SingleFlightGuard::new();
        assert!(!guard.in_flight());

        let permit = guard.try_admit().expect("first admit");
        assert!(guard.in_flight());
        assert!(guard.try_admit().is_none());
        assert!(guard.try_admit().is_none());

        drop(permit);
        assert!(!guard.in_flight());
        assert!(guard.try_admit().is_some());
    }

    #[test]
    fn concurrent_admits_yield_exactly_one_permit() {
        let guard = SingleFlightGuard::new();

        // Return the permits so none is released before counting.
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.try_admit())
            })
            .collect();

        let permits: Vec<FlightPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("thread"))
            .collect();
        assert_eq!(permits.len(), 1);
        assert!(guard.in_flight());

        drop(permits);
        assert!(!guard.in_flight());
    }

    #[test]
    fn permit_released_on_panic_unwind() {
        let guard = SingleFlightGuard::new();
        let inner = guard.clone();

        let result = std::thread::spawn(move || {
            let _permit = inner.try_admit().expect("admit");
            panic!("session blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!guard.in_flight());
        assert!(guard.try_admit().is_some());
    }
}
