//! Liveness Reporter
//!
//! Registers this instance with a TTL check and keeps the check passing.
//! A check that stays silent past its TTL turns critical, which invalidates
//! the session bound to it and releases any leadership held under it. That
//! is the only failure detector in the system.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::coordination::{Coordinator, ServiceRegistration, TtlCheck};
use crate::error::{Error, Result};
use crate::identity::ServiceIdentity;

/// Periodic TTL check reporter
pub struct LivenessReporter {
    coordinator: Arc<dyn Coordinator>,
    registration: ServiceRegistration,
    interval: Duration,
    deregister_on_shutdown: bool,
}

impl LivenessReporter {
    /// Create a reporter; `interval` must be shorter than `ttl`
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        identity: &ServiceIdentity,
        ttl: Duration,
        deregister_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            registration: ServiceRegistration {
                id: identity.id.clone(),
                name: identity.name.clone(),
                check: TtlCheck {
                    id: identity.check_id(),
                    ttl,
                    deregister_after,
                },
            },
            interval,
            deregister_on_shutdown: true,
        }
    }

    /// Whether the service is deregistered when the reporter stops
    pub fn with_deregister_on_shutdown(mut self, deregister: bool) -> Self {
        self.deregister_on_shutdown = deregister;
        self
    }

    /// Registration this reporter maintains
    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    /// Register the service and its TTL check
    pub async fn register(&self) -> Result<()> {
        self.coordinator.register_service(&self.registration).await?;
        tracing::info!(
            "Registered service {} with check {} (ttl {:?}, deregister after {:?})",
            self.registration.id,
            self.registration.check.id,
            self.registration.check.ttl,
            self.registration.check.deregister_after
        );
        Ok(())
    }

    /// Report the check as passing once
    pub async fn report(&self) -> Result<()> {
        self.coordinator
            .report_check_passing(&self.registration.check.id)
            .await?;
        tracing::debug!("Mark as passing {}", self.registration.check.id);
        Ok(())
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.interval / 10, self.interval)
    }

    /// Upper bound for one heartbeat attempt: a hung attempt must fail early
    /// enough that a retry still lands inside the TTL
    pub fn attempt_timeout(&self) -> Duration {
        let slack = self.registration.check.ttl.saturating_sub(self.interval);
        self.interval.min(slack / 2).max(Duration::from_millis(1))
    }

    /// One heartbeat attempt (re-registering first if asked), bounded by
    /// `attempt_timeout`
    async fn beat(&self, register: bool) -> Result<()> {
        let attempt = async {
            if register {
                self.register().await?;
            }
            self.report().await
        };
        let timeout = self.attempt_timeout();
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::CoordinationUnavailable(format!(
                "heartbeat for {} timed out after {:?}",
                self.registration.check.id, timeout
            ))),
        }
    }

    /// Register and report until both succeed once.
    ///
    /// Returns `Error::Cancelled` if cancelled first.
    pub async fn establish(&self, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = self.backoff();
        loop {
            let delay = match self.beat(true).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Failed to register {} (attempt {}): {}, retrying in {:?}",
                        self.registration.id,
                        backoff.attempt(),
                        e,
                        delay
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Keep the check passing until cancelled.
    ///
    /// Expects `establish` to have succeeded; the first report is sent one
    /// interval from now and then on a fixed cadence. Each attempt is bounded
    /// by `attempt_timeout`. A failed report is retried with backoff, never
    /// later than the regular cadence, and re-registers first in case the
    /// agent lost the registration.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = self.backoff();

        'beats: loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut register = false;
            loop {
                match self.beat(register).await {
                    Ok(()) => {
                        if backoff.attempt() > 0 {
                            tracing::info!("Check {} is passing again", self.registration.check.id);
                            ticker.reset();
                        }
                        backoff.reset();
                        break;
                    }
                    Err(e) => {
                        register = true;
                        let retry = backoff.next_delay();
                        tracing::warn!(
                            "Failed to mark {} as passing (attempt {}): {}, retrying in {:?}",
                            self.registration.check.id,
                            backoff.attempt(),
                            e,
                            retry
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break 'beats,
                            _ = tokio::time::sleep(retry) => {}
                        }
                    }
                }
            }
        }

        if self.deregister_on_shutdown {
            match self.coordinator.deregister_service(&self.registration.id).await {
                Ok(()) => tracing::info!("Deregistered service {}", self.registration.id),
                Err(e) => tracing::warn!("Failed to deregister {}: {}", self.registration.id, e),
            }
        }
        tracing::info!("Heartbeat for {} stopped", self.registration.check.id);
    }

    /// Spawn `run` on the runtime
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
