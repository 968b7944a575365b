//! Check scheduling policy.
//!
//! Answers one question on every wake-up: should a new upgrade check run
//! right now? Artifact state and preferences are re-read from disk on every
//! evaluation because the main application process may have changed either
//! since the last wake-up.

use crate::artifact::ArtifactStore;
use crate::config::{CheckerConfig, NetworkStatus, NetworkType, SharedPreferences};
use crate::notify::NotificationDispatcher;
use crate::trigger::CheckTrigger;
use std::sync::Arc;
use tracing::{info, warn};

/// Decides whether a wake-up should start a new check.
pub struct SchedulePolicy {
    config: CheckerConfig,
    store: Arc<ArtifactStore>,
    dispatcher: Arc<NotificationDispatcher>,
    network: Arc<dyn NetworkStatus>,
    trigger: Arc<CheckTrigger>,
}

impl SchedulePolicy {
    /// Create a policy over the given collaborators.
    pub fn new(
        config: CheckerConfig,
        store: Arc<ArtifactStore>,
        dispatcher: Arc<NotificationDispatcher>,
        network: Arc<dyn NetworkStatus>,
        trigger: Arc<CheckTrigger>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            network,
            trigger,
        }
    }

    /// Returns `true` if a new upgrade check should run now.
    ///
    /// Side effects: ensures the recurring trigger registration exists (for
    /// builds that may self-upgrade), and announces an already-pending
    /// artifact instead of re-downloading it.
    pub fn needs_check(&self) -> bool {
        // Every wake-up is an opportunity to make sure the trigger exists.
        self.ensure_trigger();

        if !self.config.allows_self_upgrade() {
            info!("install does not support upgrading");
            return false;
        }

        // Never re-download while an unapplied upgrade exists. A user who
        // delays installing across release cycles applies the stale package
        // first and downloads the next one after; the pending file blocks
        // everything until it is installed and removed.
        match self.store.pending_filename() {
            Ok(Some(filename)) => {
                info!(filename = %filename, "upgrade file already exists");
                self.dispatcher.notify_upgrade_available(&filename);
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "cannot inspect upgrade artifact; skipping this period");
                return false;
            }
        }

        let prefs = SharedPreferences::load(&self.config.preferences_path());
        if prefs.unmetered_only && self.network.network_type() == NetworkType::Metered {
            info!("not checking on a metered network per user preference");
            return false;
        }

        info!("upgrade check needed");
        true
    }

    /// Register the recurring trigger if this build can self-upgrade.
    ///
    /// Builds that cannot upgrade themselves get no trigger at all.
    pub fn ensure_trigger(&self) {
        if !self.config.allows_self_upgrade() {
            return;
        }

        if let Err(e) = self.trigger.ensure_registered() {
            warn!(error = %e, "cannot register upgrade trigger");
        }
    }
}
