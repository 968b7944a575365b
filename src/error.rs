//! Error types for the upgrade-check subsystem.

/// Top-level error type for the upgrade checker.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    /// Capability or preference configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Artifact store error (shared file access, locking, promotion).
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Downloaded package failed authentication.
    #[error("verification error: {0}")]
    Verification(String),

    /// Tunnel transport error (start rejected, contract violation).
    #[error("transport error: {0}")]
    Transport(String),

    /// Recurring trigger registration error.
    #[error("trigger error: {0}")]
    Trigger(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpgradeError>;
