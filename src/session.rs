//! One upgrade-check session.
//!
//! A session owns a single transport run from start to the final `Exiting`
//! event. All transport signals arrive on one ordered channel; shutdown is
//! a command sent back across that boundary from a spawned task, never a
//! blocking call made while handling an event. The admission permit rides
//! inside the session and is released on every exit path when the session
//! value drops.

use crate::artifact::ArtifactStore;
use crate::config::SharedPreferences;
use crate::guard::FlightPermit;
use crate::notify::NotificationDispatcher;
use crate::transport::{
    CHECKER_CLIENT_AFFIX, CHECKER_SESSION_NAME, ServerEntry, TunnelConfig, TunnelEvent,
    TunnelTransport,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Terminal outcome of a check session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The installed client is current, or the transport ended without a
    /// verdict; either way, try again next period.
    LatestVersion,
    /// A package was verified and announced.
    UpgradeDownloaded {
        /// File name of the committed package.
        filename: String,
    },
    /// The transport refused to start.
    Failed,
}

/// A single admitted upgrade check.
pub struct CheckSession {
    id: Uuid,
    store: Arc<ArtifactStore>,
    dispatcher: Arc<NotificationDispatcher>,
    transport: Arc<dyn TunnelTransport>,
    _permit: FlightPermit,
}

impl CheckSession {
    /// Create a session from an admission permit.
    pub fn new(
        store: Arc<ArtifactStore>,
        dispatcher: Arc<NotificationDispatcher>,
        transport: Arc<dyn TunnelTransport>,
        permit: FlightPermit,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            dispatcher,
            transport,
            _permit: permit,
        }
    }

    /// Session identifier, for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the transport until it exits and return the terminal outcome.
    pub async fn run(self, servers: &[ServerEntry], prefs: &SharedPreferences) -> SessionOutcome {
        let started = Instant::now();
        let config = TunnelConfig {
            client_affix: CHECKER_CLIENT_AFFIX.to_owned(),
            session_name: CHECKER_SESSION_NAME.to_owned(),
            entropy_seed: rand::thread_rng().r#gen(),
            disable_timeouts: prefs.disable_timeouts,
            // A check exists to upgrade; never suppress it here.
            self_upgrade_disabled: false,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        info!(session = %self.id, "upgrade check starting");

        if let Err(e) = self.transport.start(servers, config, events_tx) {
            // Nothing started, so there is nothing to stop.
            error!(session = %self.id, error = %e, "transport start failed");
            return SessionOutcome::Failed;
        }

        let mut outcome: Option<SessionOutcome> = None;
        let mut notified_downloaded = false;

        loop {
            // A closed channel means the transport went away without the
            // courtesy `Exiting`; treat it the same.
            let Some(event) = events_rx.recv().await else {
                warn!(session = %self.id, "transport event channel closed");
                break;
            };

            match event {
                TunnelEvent::Diagnostic { message } => {
                    debug!(session = %self.id, "transport diagnostic: {message}");
                }
                TunnelEvent::LatestVersion => {
                    info!(session = %self.id, "client is latest version");
                    if outcome.is_none() {
                        outcome = Some(SessionOutcome::LatestVersion);
                    }
                    self.request_shutdown();
                }
                TunnelEvent::UpgradeDownloaded { filename } => {
                    // The transport may redo its handshake and repeat this
                    // event for the same logical download.
                    if notified_downloaded {
                        debug!(session = %self.id, "duplicate download signal ignored");
                        continue;
                    }
                    notified_downloaded = true;

                    match self.store.commit_partial() {
                        Ok(committed) => {
                            info!(session = %self.id, filename = %committed, "upgrade downloaded");
                            self.dispatcher.notify_upgrade_available(&committed);
                            outcome = Some(SessionOutcome::UpgradeDownloaded {
                                filename: committed,
                            });
                        }
                        Err(e) => {
                            warn!(
                                session = %self.id,
                                filename = %filename,
                                error = %e,
                                "downloaded package not committed"
                            );
                        }
                    }
                    self.request_shutdown();
                }
                TunnelEvent::Exiting => {
                    info!(session = %self.id, "transport exiting");
                    break;
                }
            }
        }

        let outcome = outcome.unwrap_or(SessionOutcome::LatestVersion);
        info!(
            session = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "upgrade check finished"
        );
        outcome
    }

    /// Ask the transport to stop without blocking the event loop.
    fn request_shutdown(&self) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.stop();
        });
    }
}
