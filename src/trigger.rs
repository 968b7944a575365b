//! Recurring upgrade-check trigger.
//!
//! The trigger has two halves: a durable registration record (so any
//! process can tell "a recurring check exists" without creating a
//! duplicate or resetting the recurrence window) and the in-process firing
//! loop owned by whichever process hosts the checker. Firing is inexact on
//! purpose; the only requirement is that checks happen a few times a day.

use crate::checker::WakeEvent;
use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before the first periodic check after registration.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(15 * 60);

/// Interval between periodic checks.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(12 * 3600);

/// Durable record marking the recurring trigger as registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TriggerRegistration {
    /// Epoch seconds when the trigger was first registered.
    created_at: u64,
    /// Delay before the first firing, in seconds.
    initial_delay_secs: u64,
    /// Recurrence period, in seconds.
    period_secs: u64,
}

/// Recurring wake-up trigger for upgrade checks.
pub struct CheckTrigger {
    registration_path: PathBuf,
    initial_delay: Duration,
    period: Duration,
}

impl CheckTrigger {
    /// Create a trigger with the default recurrence timing.
    pub fn new(registration_path: PathBuf) -> Self {
        Self {
            registration_path,
            initial_delay: DEFAULT_INITIAL_DELAY,
            period: DEFAULT_PERIOD,
        }
    }

    /// Override the recurrence timing.
    pub fn with_timing(mut self, initial_delay: Duration, period: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.period = period;
        self
    }

    /// Returns `true` when a registration record exists and parses.
    pub fn is_registered(&self) -> bool {
        read_registration(&self.registration_path).is_some()
    }

    /// Ensure the registration record exists. Idempotent: an existing
    /// record is left untouched, preserving the original recurrence
    /// window. Returns `true` when a record was newly written.
    pub fn ensure_registered(&self) -> Result<bool> {
        if let Some(existing) = read_registration(&self.registration_path) {
            debug!(
                created_at = existing.created_at,
                "upgrade trigger already registered"
            );
            return Ok(false);
        }

        let record = TriggerRegistration {
            created_at: epoch_secs(),
            initial_delay_secs: self.initial_delay.as_secs(),
            period_secs: self.period.as_secs(),
        };
        write_registration(&self.registration_path, &record)?;
        info!(
            period_secs = record.period_secs,
            "registered recurring upgrade trigger"
        );
        Ok(true)
    }

    /// Start the in-process firing loop. Sends
    /// [`WakeEvent::PeriodicCheck`] after the initial delay and then once
    /// per period until cancelled or the receiver is gone.
    pub fn spawn(
        &self,
        wake_tx: mpsc::UnboundedSender<WakeEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let initial_delay = self.initial_delay;
        let period = self.period;

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("upgrade trigger loop cancelled");
                        return;
                    }
                    _ = interval.tick() => {
                        if wake_tx.send(WakeEvent::PeriodicCheck).is_err() {
                            debug!("wake channel closed, stopping trigger loop");
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn read_registration(path: &Path) -> Option<TriggerRegistration> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return None,
    };

    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "ignoring malformed trigger registration"
            );
            None
        }
    }
}

fn write_registration(path: &Path, record: &TriggerRegistration) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| UpgradeError::Trigger(format!("cannot create state directory: {e}")))?;
    }

    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec(record)
        .map_err(|e| UpgradeError::Trigger(format!("cannot serialize registration: {e}")))?;
    std::fs::write(&tmp_path, json)
        .map_err(|e| UpgradeError::Trigger(format!("cannot write registration temp file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| UpgradeError::Trigger(format!("cannot finalize registration file: {e}")))?;
    Ok(())
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn trigger_in(dir: &Path) -> CheckTrigger {
        CheckTrigger::new(dir.join("upgrade-trigger.json"))
    }

    #[test]
    fn registration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = trigger_in(dir.path());
        assert!(!trigger.is_registered());

        assert!(trigger.ensure_registered().unwrap());
        assert!(trigger.is_registered());
        let first = read_registration(&trigger.registration_path).unwrap();

        // Repeated calls neither duplicate nor reset the window.
        for _ in 0..5 {
            assert!(!trigger.ensure_registered().unwrap());
        }
        let after = read_registration(&trigger.registration_path).unwrap();
        assert_eq!(after.created_at, first.created_at);
        assert_eq!(after.period_secs, first.period_secs);
    }

    #[test]
    fn malformed_registration_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = trigger_in(dir.path());
        std::fs::write(&trigger.registration_path, b"{ garbage").unwrap();

        assert!(!trigger.is_registered());
        assert!(trigger.ensure_registered().unwrap());
        assert!(trigger.is_registered());
    }

    #[test]
    fn registration_records_configured_timing() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = trigger_in(dir.path())
            .with_timing(Duration::from_secs(60), Duration::from_secs(3600));
        trigger.ensure_registered().unwrap();

        let record = read_registration(&trigger.registration_path).unwrap();
        assert_eq!(record.initial_delay_secs, 60);
        assert_eq!(record.period_secs, 3600);
    }

    #[tokio::test]
    async fn firing_loop_sends_periodic_wakeups() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = trigger_in(dir.path())
            .with_timing(Duration::from_millis(5), Duration::from_millis(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = trigger.spawn(tx, cancel.clone());

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("tick within timeout")
                .expect("channel open");
            assert!(matches!(event, WakeEvent::PeriodicCheck));
        }

        cancel.cancel();
        handle.await.expect("loop exits");
    }

    #[tokio::test]
    async fn firing_loop_stops_when_receiver_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = trigger_in(dir.path())
            .with_timing(Duration::from_millis(1), Duration::from_millis(1));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let handle = trigger.spawn(tx, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits on closed channel")
            .expect("join");
    }
}
