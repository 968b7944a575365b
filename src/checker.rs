//! Top-level upgrade checker.
//!
//! Receives wake events (periodic trigger, boot, cross-process signals),
//! consults the schedule policy, admits at most one session through the
//! single-flight guard, and spawns the session worker. Wake handling never
//! blocks on the transport; the session owns all unbounded-latency work.

use crate::artifact::{ArtifactStore, PackageVerifier};
use crate::config::{CheckerConfig, NetworkStatus, SharedPreferences};
use crate::guard::SingleFlightGuard;
use crate::notify::{NotificationDispatcher, UpgradeNotice};
use crate::policy::SchedulePolicy;
use crate::session::{CheckSession, SessionOutcome};
use crate::transport::{ServerEntry, TunnelTransport};
use crate::trigger::CheckTrigger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A wake-up delivered to the checker. Carries no payload except the
/// cross-process artifact signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    /// The recurring trigger fired.
    PeriodicCheck,
    /// The device restarted; make sure the trigger survives.
    BootCompleted,
    /// Another component asks for the trigger to exist.
    EnsureTrigger,
    /// The other writer process finished downloading an upgrade.
    UpgradeFileAvailable {
        /// File name reported by the other process.
        filename: String,
    },
}

/// Background upgrade checker for one process.
pub struct UpgradeChecker {
    config: CheckerConfig,
    servers: Vec<ServerEntry>,
    store: Arc<ArtifactStore>,
    dispatcher: Arc<NotificationDispatcher>,
    transport: Arc<dyn TunnelTransport>,
    network: Arc<dyn NetworkStatus>,
    guard: SingleFlightGuard,
    trigger: Arc<CheckTrigger>,
}

impl UpgradeChecker {
    /// Create a checker. Outward notices are emitted on `notices_tx`.
    pub fn new(
        config: CheckerConfig,
        transport: Arc<dyn TunnelTransport>,
        network: Arc<dyn NetworkStatus>,
        verifier: Arc<dyn PackageVerifier>,
        notices_tx: mpsc::UnboundedSender<UpgradeNotice>,
    ) -> Self {
        let store = Arc::new(ArtifactStore::new(config.upgrade_dir(), verifier));
        let dispatcher = Arc::new(NotificationDispatcher::new(Arc::clone(&store), notices_tx));
        let trigger = Arc::new(CheckTrigger::new(config.trigger_registration_path()));
        Self {
            config,
            servers: Vec::new(),
            store,
            dispatcher,
            transport,
            network,
            guard: SingleFlightGuard::new(),
            trigger,
        }
    }

    /// Set the server list handed to the transport on each session.
    pub fn with_servers(mut self, servers: Vec<ServerEntry>) -> Self {
        self.servers = servers;
        self
    }

    /// Override the recurrence timing of the trigger.
    pub fn with_trigger_timing(mut self, initial_delay: Duration, period: Duration) -> Self {
        self.trigger = Arc::new(
            CheckTrigger::new(self.config.trigger_registration_path())
                .with_timing(initial_delay, period),
        );
        self
    }

    /// The shared artifact store.
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// The recurring trigger, for hosts that run the firing loop.
    pub fn trigger(&self) -> &Arc<CheckTrigger> {
        &self.trigger
    }

    /// Built fresh per wake-up: the policy has no state of its own and every
    /// evaluation must re-read the world.
    fn policy(&self) -> SchedulePolicy {
        SchedulePolicy::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.network),
            Arc::clone(&self.trigger),
        )
    }

    /// Handle one wake event. Returns the session worker handle when a
    /// check was admitted.
    pub fn handle_wake(&self, event: WakeEvent) -> Option<tokio::task::JoinHandle<SessionOutcome>> {
        // Whatever woke us, make sure the trigger exists.
        let policy = self.policy();
        policy.ensure_trigger();

        match event {
            WakeEvent::PeriodicCheck => {
                debug!("periodic check wake-up");
                if !policy.needs_check() {
                    return None;
                }
                self.spawn_check()
            }
            WakeEvent::UpgradeFileAvailable { filename } => {
                info!(filename = %filename, "upgrade file reported by the other process");
                self.dispatcher.notify_upgrade_available(&filename);
                None
            }
            WakeEvent::BootCompleted => {
                debug!("boot wake-up; trigger ensured");
                None
            }
            WakeEvent::EnsureTrigger => {
                debug!("ensure-trigger wake-up");
                None
            }
        }
    }

    /// Admit and spawn one session worker, or drop the wake-up if a check
    /// is already in flight.
    fn spawn_check(&self) -> Option<tokio::task::JoinHandle<SessionOutcome>> {
        let permit = self.guard.try_admit()?;

        let session = CheckSession::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.transport),
            permit,
        );
        let servers = self.servers.clone();
        let prefs = SharedPreferences::load(&self.config.preferences_path());

        Some(tokio::spawn(async move {
            session.run(&servers, &prefs).await
        }))
    }

    /// Consume wake events until cancelled or the sender side is gone.
    pub async fn run(
        self: Arc<Self>,
        mut wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
        cancel: CancellationToken,
    ) {
        info!("upgrade checker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("upgrade checker stopping");
                    return;
                }
                event = wake_rx.recv() => {
                    let Some(event) = event else {
                        debug!("wake channel closed, stopping checker");
                        return;
                    };
                    let _ = self.handle_wake(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::artifact::VERIFIED_FILE_NAME;
    use crate::config::{DistributionChannel, NetworkType};
    use crate::error::Result;
    use crate::transport::{TunnelConfig, TunnelEvent};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AcceptAll;

    impl PackageVerifier for AcceptAll {
        fn verify(&self, _path: &Path) -> bool {
            true
        }
    }

    struct Unmetered;

    impl NetworkStatus for Unmetered {
        fn network_type(&self) -> NetworkType {
            NetworkType::Unmetered
        }
    }

    /// Transport that stays connected until stopped, then replays its
    /// script and exits.
    struct HoldingTransport {
        script: Vec<TunnelEvent>,
        events: Mutex<Option<mpsc::UnboundedSender<TunnelEvent>>>,
        start_calls: AtomicUsize,
    }

    impl HoldingTransport {
        fn new(script: Vec<TunnelEvent>) -> Arc<Self> {
            Arc::new(Self {
                script,
                events: Mutex::new(None),
                start_calls: AtomicUsize::new(0),
            })
        }

        fn start_count(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        fn finish(&self) {
            if let Some(events) = self.events.lock().unwrap().take() {
                for event in &self.script {
                    let _ = events.send(event.clone());
                }
                let _ = events.send(TunnelEvent::Exiting);
            }
        }
    }

    impl TunnelTransport for HoldingTransport {
        fn start(
            &self,
            _servers: &[ServerEntry],
            _config: TunnelConfig,
            events: mpsc::UnboundedSender<TunnelEvent>,
        ) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        fn stop(&self) {
            self.finish();
        }
    }

    struct Fixture {
        checker: UpgradeChecker,
        transport: Arc<HoldingTransport>,
        notices_rx: mpsc::UnboundedReceiver<UpgradeNotice>,
        _dir: tempfile::TempDir,
    }

    fn fixture(script: Vec<TunnelEvent>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckerConfig {
            distribution: DistributionChannel::Direct,
            upgrade_sources: vec!["https://upgrades.example.net/burrow.pkg".to_owned()],
            data_dir: dir.path().to_path_buf(),
        };
        let transport = HoldingTransport::new(script);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let checker = UpgradeChecker::new(
            config,
            Arc::clone(&transport) as Arc<dyn TunnelTransport>,
            Arc::new(Unmetered),
            Arc::new(AcceptAll),
            notices_tx,
        )
        .with_servers(vec![ServerEntry("server-1".to_owned())]);
        Fixture {
            checker,
            transport,
            notices_rx,
            _dir: dir,
        }
    }

    fn write_partial(store: &ArtifactStore) {
        std::fs::create_dir_all(store.partial_path().parent().unwrap()).unwrap();
        std::fs::write(store.partial_path(), b"package bytes").unwrap();
    }

    /// Let a just-spawned session worker reach its transport start call.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn periodic_wake_runs_a_full_check() {
        let mut fixture = fixture(vec![TunnelEvent::UpgradeDownloaded {
            filename: VERIFIED_FILE_NAME.to_owned(),
        }]);
        write_partial(fixture.checker.store());

        let handle = fixture
            .checker
            .handle_wake(WakeEvent::PeriodicCheck)
            .expect("check admitted");
        settle().await;
        fixture.transport.finish();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session terminates")
            .expect("session join");
        assert_eq!(
            outcome,
            SessionOutcome::UpgradeDownloaded {
                filename: VERIFIED_FILE_NAME.to_owned()
            }
        );
        assert!(fixture.notices_rx.try_recv().is_ok());
        assert!(fixture.notices_rx.try_recv().is_err());
        assert!(fixture.checker.trigger().is_registered());
    }

    #[tokio::test]
    async fn overlapping_periodic_wakes_admit_only_one_session() {
        let fixture = fixture(vec![TunnelEvent::LatestVersion]);

        let first = fixture.checker.handle_wake(WakeEvent::PeriodicCheck);
        assert!(first.is_some());
        settle().await;

        // The first session is still holding the guard.
        let second = fixture.checker.handle_wake(WakeEvent::PeriodicCheck);
        assert!(second.is_none());
        assert_eq!(fixture.transport.start_count(), 1);

        fixture.transport.finish();
        tokio::time::timeout(Duration::from_secs(5), first.unwrap())
            .await
            .expect("session terminates")
            .expect("session join");

        // With the guard released the next wake is admitted again.
        let third = fixture.checker.handle_wake(WakeEvent::PeriodicCheck);
        assert!(third.is_some());
        settle().await;
        fixture.transport.finish();
        tokio::time::timeout(Duration::from_secs(5), third.unwrap())
            .await
            .expect("session terminates")
            .expect("session join");
    }

    #[tokio::test]
    async fn boot_and_ensure_trigger_wakes_register_without_checking() {
        let fixture = fixture(Vec::new());

        assert!(
            fixture
                .checker
                .handle_wake(WakeEvent::BootCompleted)
                .is_none()
        );
        assert!(
            fixture
                .checker
                .handle_wake(WakeEvent::EnsureTrigger)
                .is_none()
        );

        assert!(fixture.checker.trigger().is_registered());
        assert_eq!(fixture.transport.start_count(), 0);
    }

    #[tokio::test]
    async fn cross_process_signal_announces_without_a_session() {
        let mut fixture = fixture(Vec::new());
        write_partial(fixture.checker.store());
        fixture.checker.store().commit_partial().unwrap();

        let handle = fixture.checker.handle_wake(WakeEvent::UpgradeFileAvailable {
            filename: VERIFIED_FILE_NAME.to_owned(),
        });

        assert!(handle.is_none());
        assert_eq!(fixture.transport.start_count(), 0);
        let notice = fixture.notices_rx.try_recv().expect("notice");
        assert_eq!(notice.filename, VERIFIED_FILE_NAME);
    }

    #[tokio::test]
    async fn pending_artifact_blocks_the_next_periodic_check() {
        let mut fixture = fixture(vec![TunnelEvent::UpgradeDownloaded {
            filename: VERIFIED_FILE_NAME.to_owned(),
        }]);
        write_partial(fixture.checker.store());

        let handle = fixture
            .checker
            .handle_wake(WakeEvent::PeriodicCheck)
            .expect("first check");
        settle().await;
        fixture.transport.finish();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session terminates")
            .expect("session join");
        assert!(fixture.notices_rx.try_recv().is_ok());

        // The committed package now short-circuits the policy.
        assert!(
            fixture
                .checker
                .handle_wake(WakeEvent::PeriodicCheck)
                .is_none()
        );
        assert_eq!(fixture.transport.start_count(), 1);
        // And the announcement is not repeated.
        assert!(fixture.notices_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_loop_processes_wakes_until_cancelled() {
        let fixture = fixture(Vec::new());
        let checker = Arc::new(fixture.checker);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let loop_handle = tokio::spawn(Arc::clone(&checker).run(wake_rx, cancel.clone()));

        wake_tx.send(WakeEvent::EnsureTrigger).unwrap();
        // Give the loop a turn to drain the event.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(checker.trigger().is_registered());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), loop_handle)
            .await
            .expect("loop exits")
            .expect("join");
    }
}
