//! Consumed tunnel transport contract.
//!
//! The transport is the external component that actually connects out,
//! performs the upgrade handshake, and downloads package bytes to the
//! shared partial path. This subsystem only starts it, stops it, and reads
//! its events off a single ordered channel.

use crate::error::Result;
use tokio::sync::mpsc;

/// Client-name affix applied to the checker's tunnel so connection-level
/// resources never collide with the main application's tunnel.
pub const CHECKER_CLIENT_AFFIX: &str = "Burrow_UpgradeChecker_";

/// Temporary session name for the checker's tunnel instance.
pub const CHECKER_SESSION_NAME: &str = "upgradechecker";

/// One known server the transport may connect through. Opaque to this
/// subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry(pub String);

/// Session-scoped configuration handed to the transport at start.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Client-name affix distinguishing this tunnel instance.
    pub client_affix: String,
    /// Temporary session name for this tunnel instance.
    pub session_name: String,
    /// Fresh entropy seed for the transport's obfuscation layer.
    pub entropy_seed: u64,
    /// Disable transport-level timeouts (user preference pass-through).
    pub disable_timeouts: bool,
    /// Tell the transport not to fetch upgrades. Never set during a check:
    /// a check's whole purpose is to upgrade.
    pub self_upgrade_disabled: bool,
}

/// Events emitted by a running transport, in order, on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The handshake confirmed the installed client is current.
    LatestVersion,
    /// An upgrade package finished downloading to the shared partial path.
    /// May fire more than once for one logical download, once per
    /// handshake.
    UpgradeDownloaded {
        /// File name the transport downloaded to.
        filename: String,
    },
    /// Free-form diagnostic line from the transport. Logged only.
    Diagnostic {
        /// The diagnostic message.
        message: String,
    },
    /// The transport has finished shutting down. Always the final event,
    /// whether after [`TunnelTransport::stop`], a timeout, or an internal
    /// failure.
    Exiting,
}

/// Start/stop contract for the tunnel transport.
pub trait TunnelTransport: Send + Sync {
    /// Start the transport with a session-scoped configuration. Events are
    /// delivered on `events` until [`TunnelEvent::Exiting`].
    ///
    /// # Errors
    ///
    /// Returns an error when the transport rejects its configuration and
    /// never starts; no `Exiting` event follows a failed start.
    fn start(
        &self,
        servers: &[ServerEntry],
        config: TunnelConfig,
        events: mpsc::UnboundedSender<TunnelEvent>,
    ) -> Result<()>;

    /// Request shutdown. Idempotent; safe to call from any terminal branch
    /// and before `Exiting` has been observed.
    fn stop(&self);
}
