//! Outward upgrade-ready notification dispatch.
//!
//! The dispatcher turns "a verified package is waiting" into exactly one
//! outward event per artifact instance. The dedup key is the artifact's
//! durable on-disk identity, not an in-memory flag alone: the party asking
//! for the notification may be a different process than the one that
//! completed the download, so every call re-checks the authoritative
//! medium before deciding.

use crate::artifact::{ArtifactIdentity, ArtifactStore};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outward "upgrade ready" event. The UI layer renders a persistent prompt
/// and invokes the installer on user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeNotice {
    /// File name of the verified package.
    pub filename: String,
}

/// Dispatches at most one [`UpgradeNotice`] per verified artifact instance.
pub struct NotificationDispatcher {
    store: Arc<ArtifactStore>,
    notices_tx: mpsc::UnboundedSender<UpgradeNotice>,
    announced: Mutex<Option<ArtifactIdentity>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher emitting notices on the given channel.
    pub fn new(store: Arc<ArtifactStore>, notices_tx: mpsc::UnboundedSender<UpgradeNotice>) -> Self {
        Self {
            store,
            notices_tx,
            announced: Mutex::new(None),
        }
    }

    /// Announce that a verified upgrade is ready, at most once per artifact
    /// instance.
    ///
    /// Re-invocation while the same instance is still pending is a no-op; a
    /// call that finds no valid pending artifact emits nothing and clears
    /// the memo so the next instance counts as a new occurrence.
    pub fn notify_upgrade_available(&self, filename: &str) {
        let identity = match self.store.pending_identity() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "cannot check pending artifact; skipping notification");
                return;
            }
        };

        let Ok(mut announced) = self.announced.lock() else {
            warn!("notification memo poisoned; skipping notification");
            return;
        };

        let Some(identity) = identity else {
            debug!(filename, "no valid pending artifact; nothing to announce");
            *announced = None;
            return;
        };

        if identity.filename != filename {
            warn!(
                requested = filename,
                pending = %identity.filename,
                "notification requested for a different file; using the pending package"
            );
        }

        if announced.as_ref() == Some(&identity) {
            debug!(filename = %identity.filename, "upgrade already announced");
            return;
        }

        let notice = UpgradeNotice {
            filename: identity.filename.clone(),
        };
        if self.notices_tx.send(notice).is_err() {
            warn!("notice channel closed; upgrade announcement dropped");
            return;
        }

        info!(filename = %identity.filename, "announced pending upgrade");
        *announced = Some(identity);
    }
}
