//! Burrow upgrade checker: background upgrade-check coordination.
//!
//! A tunnel-based client upgrades itself out-of-band: a background process
//! periodically launches its own short-lived tunnel, asks it to fetch a
//! newer package, authenticates what landed on disk, and announces exactly
//! one "upgrade ready" prompt for the user to act on. The main application
//! process downloads to the very same path when its own tunnel learns of
//! an upgrade, so every on-disk decision here is written to survive a
//! second, racing writer.
//!
//! # Architecture
//!
//! Wake events flow through a small pipeline of collaborators:
//! - **CheckTrigger**: durable recurring-trigger registration plus the
//!   in-process periodic firing loop
//! - **SchedulePolicy**: fresh per-wake-up decision on whether to check
//! - **SingleFlightGuard**: at most one session per process, RAII permit
//! - **CheckSession**: one transport run, driven by a single ordered event
//!   channel until the transport exits
//! - **ArtifactStore**: lock-guarded, verify-then-commit access to the
//!   shared package file
//! - **NotificationDispatcher**: exactly one outward notice per verified
//!   artifact instance

pub mod artifact;
pub mod checker;
pub mod config;
pub mod error;
pub mod guard;
pub mod notify;
pub mod policy;
pub mod session;
pub mod transport;
pub mod trigger;

pub use artifact::{ArtifactState, ArtifactStore, DigestVerifier, PackageVerifier};
pub use checker::{UpgradeChecker, WakeEvent};
pub use config::{
    CheckerConfig, DistributionChannel, NetworkStatus, NetworkType, SharedPreferences,
};
pub use error::{Result, UpgradeError};
pub use guard::{FlightPermit, SingleFlightGuard};
pub use notify::{NotificationDispatcher, UpgradeNotice};
pub use policy::SchedulePolicy;
pub use session::{CheckSession, SessionOutcome};
pub use transport::{ServerEntry, TunnelConfig, TunnelEvent, TunnelTransport};
pub use trigger::CheckTrigger;
