//! On-disk upgrade artifact store.
//!
//! Two independent processes (the main application tunnel and this checker)
//! download to the same well-known path, so every query goes back to the
//! authoritative medium: nothing about file presence or validity is cached
//! in memory. Writers hold a sidecar lock file while touching the shared
//! path, and the only way a package becomes visible at the verified path is
//! the verify-then-rename commit in [`ArtifactStore::commit_partial`].

use crate::error::{Result, UpgradeError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// File name of the verified, pending-install upgrade package. Both writer
/// processes must agree on this name.
pub const VERIFIED_FILE_NAME: &str = "burrow-upgrade.pkg";

/// Suffix appended to the verified name while a download is in progress.
const PARTIAL_SUFFIX: &str = ".part";

/// Locks older than this are presumed abandoned by a dead writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// How long to wait for the sidecar lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Recognized states of the shared upgrade artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    /// No upgrade file on disk.
    Absent,
    /// A download is in progress or was abandoned mid-write.
    Partial,
    /// An authenticated package is awaiting user-triggered install.
    VerifiedPending,
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Partial => write!(f, "partial"),
            Self::VerifiedPending => write!(f, "verified_pending"),
        }
    }
}

/// Authenticates a downloaded package file.
///
/// The production implementation checks the publisher signature; this crate
/// bundles [`DigestVerifier`] for deployments that pin a package digest.
pub trait PackageVerifier: Send + Sync {
    /// Returns `true` when the file at `path` is an authentic package.
    fn verify(&self, path: &Path) -> bool;
}

/// [`PackageVerifier`] that pins an expected SHA-256 hex digest.
pub struct DigestVerifier {
    expected_sha256: String,
}

impl DigestVerifier {
    /// Create a verifier expecting the given 64-character hex digest.
    pub fn new(expected_sha256: impl Into<String>) -> Self {
        Self {
            expected_sha256: expected_sha256.into(),
        }
    }
}

impl PackageVerifier for DigestVerifier {
    fn verify(&self, path: &Path) -> bool {
        match sha256_hex(path) {
            Ok(actual) => {
                let ok = actual.eq_ignore_ascii_case(&self.expected_sha256);
                if !ok {
                    warn!(
                        path = %path.display(),
                        expected = %self.expected_sha256,
                        actual = %actual,
                        "package digest mismatch"
                    );
                }
                ok
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read package for digest");
                false
            }
        }
    }
}

/// Compute the SHA-256 hex digest of a file's contents.
///
/// Reads in 64 KiB chunks so large packages are never loaded into memory
/// whole.
fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}

/// Store for the shared on-disk upgrade artifact.
pub struct ArtifactStore {
    dir: PathBuf,
    verifier: Arc<dyn PackageVerifier>,
}

impl ArtifactStore {
    /// Create a store rooted at the shared upgrade directory.
    pub fn new(dir: PathBuf, verifier: Arc<dyn PackageVerifier>) -> Self {
        Self { dir, verifier }
    }

    /// Path of the verified, pending-install package.
    pub fn verified_path(&self) -> PathBuf {
        self.dir.join(VERIFIED_FILE_NAME)
    }

    /// Path downloads are written to before promotion.
    pub fn partial_path(&self) -> PathBuf {
        self.dir.join(format!("{VERIFIED_FILE_NAME}{PARTIAL_SUFFIX}"))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{VERIFIED_FILE_NAME}.lock"))
    }

    /// Current state of the artifact, read fresh from disk.
    ///
    /// A file at the verified path that fails authentication is discarded so
    /// the next period can re-download, and reported as [`ArtifactState::Absent`].
    pub fn state(&self) -> Result<ArtifactState> {
        let _guard = ArtifactLock::acquire(&self.lock_path(), LOCK_TIMEOUT)?;
        self.state_locked()
    }

    fn state_locked(&self) -> Result<ArtifactState> {
        let verified = self.verified_path();
        if verified.is_file() {
            if self.verifier.verify(&verified) {
                return Ok(ArtifactState::VerifiedPending);
            }
            warn!(
                path = %verified.display(),
                "discarding upgrade package that failed authentication"
            );
            remove_if_present(&verified)?;
        }

        if self.partial_path().is_file() {
            return Ok(ArtifactState::Partial);
        }

        Ok(ArtifactState::Absent)
    }

    /// Returns the pending package's file name, if a verified upgrade is
    /// awaiting install.
    pub fn pending_filename(&self) -> Result<Option<String>> {
        match self.state()? {
            ArtifactState::VerifiedPending => Ok(Some(VERIFIED_FILE_NAME.to_owned())),
            _ => Ok(None),
        }
    }

    /// Durable identity of the current verified artifact instance, if any.
    ///
    /// The modification stamp distinguishes a fresh download from a previous
    /// artifact that happened to use the same file name.
    pub fn pending_identity(&self) -> Result<Option<ArtifactIdentity>> {
        let _guard = ArtifactLock::acquire(&self.lock_path(), LOCK_TIMEOUT)?;
        if self.state_locked()? != ArtifactState::VerifiedPending {
            return Ok(None);
        }

        let metadata = std::fs::metadata(self.verified_path())
            .map_err(|e| UpgradeError::Artifact(format!("cannot stat verified package: {e}")))?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

        Ok(Some(ArtifactIdentity {
            filename: VERIFIED_FILE_NAME.to_owned(),
            modified_ms,
        }))
    }

    /// Promote a completed download to the verified, pending-install state.
    ///
    /// Verification is the commit step: the partial file is authenticated
    /// under the lock and then renamed onto the verified path, so a reader
    /// can never observe a verified-looking file that is still being
    /// written. If the other writer process already committed a valid
    /// package, its file is left in place and the local partial is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Verification`] when the partial fails
    /// authentication (the partial is discarded), or
    /// [`UpgradeError::Artifact`] when there is nothing to promote.
    pub fn commit_partial(&self) -> Result<String> {
        let _guard = ArtifactLock::acquire(&self.lock_path(), LOCK_TIMEOUT)?;

        let verified = self.verified_path();
        if verified.is_file() && self.verifier.verify(&verified) {
            // The other writer won the race; treat its package as owned.
            debug!(path = %verified.display(), "verified package already present");
            remove_if_present(&self.partial_path())?;
            return Ok(VERIFIED_FILE_NAME.to_owned());
        }

        let partial = self.partial_path();
        if !partial.is_file() {
            return Err(UpgradeError::Artifact(
                "no downloaded package to promote".to_owned(),
            ));
        }

        if !self.verifier.verify(&partial) {
            remove_if_present(&partial)?;
            return Err(UpgradeError::Verification(
                "downloaded package failed authentication".to_owned(),
            ));
        }

        std::fs::rename(&partial, &verified)
            .map_err(|e| UpgradeError::Artifact(format!("cannot commit verified package: {e}")))?;

        info!(path = %verified.display(), "upgrade package verified and committed");
        Ok(VERIFIED_FILE_NAME.to_owned())
    }

    /// Remove an abandoned partial download, if present.
    pub fn discard_partial(&self) -> Result<()> {
        let _guard = ArtifactLock::acquire(&self.lock_path(), LOCK_TIMEOUT)?;
        remove_if_present(&self.partial_path())
    }

    /// Remove the verified package after a completed install.
    ///
    /// Until this runs, the pending package blocks further downloads.
    pub fn clear_verified(&self) -> Result<()> {
        let _guard = ArtifactLock::acquire(&self.lock_path(), LOCK_TIMEOUT)?;
        remove_if_present(&self.verified_path())
    }
}

/// Durable identity of one verified artifact instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactIdentity {
    /// File name of the verified package.
    pub filename: String,
    /// Modification stamp (epoch milliseconds) of the package file.
    pub modified_ms: u64,
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpgradeError::Artifact(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}

/// Sidecar lock file guarding writes to the shared artifact path.
struct ArtifactLock {
    path: PathBuf,
}

impl ArtifactLock {
    fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpgradeError::Artifact(format!("cannot create upgrade directory: {e}"))
            })?;
        }

        let started = std::time::Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(mut file) => {
                    let stamp = epoch_millis().to_string();
                    let _ = file.write_all(stamp.as_bytes());
                    return Ok(Self {
                        path: lock_path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    evict_stale_lock(lock_path);
                    if started.elapsed() > timeout {
                        return Err(UpgradeError::Artifact(format!(
                            "timed out waiting for artifact lock {}",
                            lock_path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    return Err(UpgradeError::Artifact(format!(
                        "cannot create artifact lock {}: {e}",
                        lock_path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn evict_stale_lock(lock_path: &Path) {
    let metadata = match std::fs::metadata(lock_path) {
        Ok(metadata) => metadata,
        Err(_) => return,
    };

    let modified = match metadata.modified() {
        Ok(modified) => modified,
        Err(_) => return,
    };

    let age = match SystemTime::now().duration_since(modified) {
        Ok(age) => age,
        Err(_) => return,
    };

    if age > STALE_LOCK_AGE {
        let _ = std::fs::remove_file(lock_path);
    }
}

fn epoch_millis() -> u64 {
    match SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        Err(_) => 0,
    }
}
