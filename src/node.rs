//! Election Node
//!
//! Owns everything one contending process needs: its identity, the session
//! manager, the heartbeat, the watcher and the engine. `run` drives the
//! watch → evaluate → watch loop until cancelled, then steps down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::WolfLeaderConfig;
use crate::coordination::Coordinator;
use crate::election::{Decision, ElectionEngine, LeadershipStatus};
use crate::error::{Error, Result};
use crate::identity::ServiceIdentity;
use crate::liveness::LivenessReporter;
use crate::session::SessionManager;
use crate::watcher::{next_wait_index, ChangeWatcher};

/// Extra wait after a lost race, on top of the lock-delay
const LOST_RACE_MARGIN: Duration = Duration::from_secs(1);

/// Timing and shutdown settings for an election node
#[derive(Debug, Clone)]
pub struct ElectionSettings {
    /// Check TTL
    pub ttl: Duration,
    /// Deregister-critical-after grace period
    pub deregister_after: Duration,
    /// Heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Maximum blocking read wait
    pub wait: Duration,
    /// Session lock-delay
    pub lock_delay: Duration,
    /// First retry delay
    pub backoff_initial: Duration,
    /// Maximum retry delay
    pub backoff_max: Duration,
    /// Release the key and destroy the session on shutdown
    pub release_on_shutdown: bool,
    /// Deregister the service on shutdown
    pub deregister_on_shutdown: bool,
}


impl ElectionSettings {
    /// Reject timings that would stall or spin the loops
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("heartbeat interval", self.heartbeat_interval),
            ("blocking read wait", self.wait),
            ("initial backoff", self.backoff_initial),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }

        if self.heartbeat_interval >= self.ttl {
            return Err(Error::Config(format!(
                "heartbeat interval {:?} must be shorter than the check TTL {:?}",
                self.heartbeat_interval, self.ttl
            )));
        }

        if self.backoff_initial > self.backoff_max {
            return Err(Error::Config(format!(
                "initial backoff {:?} must not exceed the maximum {:?}",
                self.backoff_initial, self.backoff_max
            )));
        }
        Ok(())
    }

    /// Settings from a loaded configuration
    pub fn from_config(config: &WolfLeaderConfig) -> Self {
        Self {
            ttl: config.check_ttl(),
            deregister_after: config.deregister_after(),
            heartbeat_interval: config.heartbeat_interval(),
            wait: config.wait_time(),
            lock_delay: config.lock_delay(),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            release_on_shutdown: config.election.release_on_shutdown,
            deregister_on_shutdown: config.check.deregister_on_shutdown,
        }
    }
}

/// One contender in a leader election
pub struct LeaderElection {
    identity: ServiceIdentity,
    coordinator: Arc<dyn Coordinator>,
    sessions: Arc<SessionManager>,
    reporter: Arc<LivenessReporter>,
    watcher: ChangeWatcher,
    engine: ElectionEngine,
    settings: ElectionSettings,
    status: watch::Sender<LeadershipStatus>,
}

impl LeaderElection {
    /// Create a node for `identity`
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        identity: ServiceIdentity,
        settings: ElectionSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&coordinator),
            &identity,
            settings.lock_delay,
        ));
        let reporter = Arc::new(
            LivenessReporter::new(
                Arc::clone(&coordinator),
                &identity,
                settings.ttl,
                settings.deregister_after,
                settings.heartbeat_interval,
            )
            .with_deregister_on_shutdown(settings.deregister_on_shutdown),
        );
        let watcher = ChangeWatcher::new(Arc::clone(&coordinator), identity.leader_key(), settings.wait);
        let engine = ElectionEngine::new(Arc::clone(&coordinator), identity.clone(), Arc::clone(&sessions))?;
        let (status, _) = watch::channel(LeadershipStatus::starting(identity.clone()));

        Ok(Self {
            identity,
            coordinator,
            sessions,
            reporter,
            watcher,
            engine,
            settings,
            status,
        })
    }

    /// Create a node from configuration
    pub fn from_config(config: &WolfLeaderConfig, coordinator: Arc<dyn Coordinator>) -> Result<Self> {
        let identity = match &config.service.id {
            Some(id) => ServiceIdentity::new(config.service.name.clone(), id.clone()),
            None => ServiceIdentity::generate(config.service.name.clone()),
        };
        Self::new(coordinator, identity, ElectionSettings::from_config(config))
    }

    /// This node's identity
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Leadership key being contended
    pub fn leader_key(&self) -> &str {
        self.engine.key()
    }

    /// Latest status
    pub fn status(&self) -> LeadershipStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status.subscribe()
    }

    /// Sleep for `delay` unless cancelled first
    async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run the election until `cancel` fires, then step down
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            "Starting election for {} as {} (key {})",
            self.identity.name,
            self.identity.id,
            self.leader_key()
        );

        match self.reporter.establish(&cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                self.status.send_modify(|s| *s = s.clone().stopped());
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // Own token so the check keeps passing while we release on shutdown
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = Arc::clone(&self.reporter).spawn(heartbeat_cancel.clone());

        self.election_loop(&cancel).await;

        if self.settings.release_on_shutdown {
            self.step_down().await;
        }
        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!("Heartbeat task ended abnormally: {}", e);
        }

        self.status.send_modify(|s| *s = s.clone().stopped());
        tracing::info!("Election for {} stopped", self.identity.id);
        Ok(())
    }

    async fn election_loop(&self, cancel: &CancellationToken) {
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut index = 0u64;
        let mut wait = self.watcher.wait();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            tracing::debug!("Monitor key {} with index {}", self.watcher.key(), index);
            let observation = match self.watcher.blocking_read_for(index, wait, cancel).await {
                Ok(observation) => observation,
                Err(Error::Cancelled) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Blocking read of {} failed: {}, retrying in {:?}", self.watcher.key(), e, delay);
                    if !Self::pause(delay, cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if index > 0 && observation.index < index {
                let stale = Error::StaleObservation {
                    expected: index,
                    observed: observation.index,
                };
                tracing::warn!("{}, re-reading current state", stale);
                index = 0;
                continue;
            }

            match self.engine.evaluate(&observation).await {
                Ok(evaluation) => {
                    backoff.reset();
                    // after a lost race the key may stay free until lock-delay passes
                    wait = if evaluation.decision == Decision::LostRace {
                        self.settings.lock_delay + LOST_RACE_MARGIN
                    } else {
                        self.watcher.wait()
                    };
                    index = next_wait_index(index, evaluation.next_index);

                    let session = self.sessions.current().await;
                    let status = LeadershipStatus::from_evaluation(&self.identity, &evaluation, session);
                    self.status.send_if_modified(|current| {
                        let changed = current.role != status.role || current.leader != status.leader;
                        *current = status;
                        changed
                    });
                }
                Err(e) => {
                    // decide again from fresh state rather than the observation that failed
                    index = 0;
                    let delay = backoff.next_delay();
                    tracing::warn!("Election round failed: {}, retrying in {:?}", e, delay);
                    if !Self::pause(delay, cancel).await {
                        break;
                    }
                }
            }
        }
    }

    /// Give up leadership and the session
    async fn step_down(&self) {
        let Some(session) = self.sessions.current().await else {
            return;
        };
        match self.coordinator.release(self.leader_key(), &session).await {
            Ok(true) => tracing::info!("Released leadership of {}", self.leader_key()),
            Ok(false) => tracing::debug!("Session {} did not hold {}", session, self.leader_key()),
            Err(e) => tracing::warn!("Failed to release {}: {}", self.leader_key(), e),
        }
        self.sessions.destroy().await;
    }
}
