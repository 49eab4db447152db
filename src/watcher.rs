//! Change Watcher
//!
//! Long-polls the leadership key. Each call blocks until the key's index
//! moves past the last one seen, the wait elapses, or shutdown is requested.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::coordination::{Coordinator, Observation};
use crate::error::{Error, Result};

/// Blocking reader for a single key
pub struct ChangeWatcher {
    coordinator: Arc<dyn Coordinator>,
    key: String,
    wait: Duration,
}

impl ChangeWatcher {
    /// Create a watcher for `key` with the given maximum wait
    pub fn new(coordinator: Arc<dyn Coordinator>, key: impl Into<String>, wait: Duration) -> Self {
        Self {
            coordinator,
            key: key.into(),
            wait,
        }
    }

    /// Watched key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configured maximum wait
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Block until the key changes after `since_index`.
    ///
    /// `since_index == 0` returns the current state immediately.
    pub async fn blocking_read(&self, since_index: u64, cancel: &CancellationToken) -> Result<Observation> {
        self.blocking_read_for(since_index, self.wait, cancel).await
    }

    /// Like `blocking_read` with an explicit wait, capped at the configured one
    pub async fn blocking_read_for(
        &self,
        since_index: u64,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Observation> {
        let wait = wait.min(self.wait);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.coordinator.blocking_read(&self.key, since_index, wait) => result,
        }
    }
}

/// Index to wait on after an observation, following Consul's rules:
/// a backwards index means the service state was reset, so start over from
/// zero; zero itself is never waited on after the first read.
pub fn next_wait_index(previous: u64, observed: u64) -> u64 {
    if observed < previous {
        tracing::debug!("Index went backwards ({} -> {}), resetting", previous, observed);
        return 0;
    }
    observed.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinator;

    const KEY: &str = "service/svc/leader";

    #[test]
    fn test_next_wait_index() {
        assert_eq!(next_wait_index(0, 7), 7);
        assert_eq!(next_wait_index(7, 9), 9);
        assert_eq!(next_wait_index(9, 9), 9);
        assert_eq!(next_wait_index(9, 3), 0);
        assert_eq!(next_wait_index(0, 0), 1);
    }

    #[tokio::test]
    async fn test_first_read_is_immediate() {
        let sim = Arc::new(InMemoryCoordinator::with_index(3));
        let watcher = ChangeWatcher::new(sim, KEY, Duration::from_secs(600));
        let cancel = CancellationToken::new();

        let observation = tokio::time::timeout(Duration::from_secs(1), watcher.blocking_read(0, &cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observation.index, 3);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_read() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let watcher = Arc::new(ChangeWatcher::new(sim, KEY, Duration::from_secs(600)));
        let cancel = CancellationToken::new();

        let reader = {
            let watcher = Arc::clone(&watcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.blocking_read(1, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_explicit_wait_is_capped() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let watcher = ChangeWatcher::new(sim, KEY, Duration::from_millis(30));
        let cancel = CancellationToken::new();

        let observation = tokio::time::timeout(
            Duration::from_secs(1),
            watcher.blocking_read_for(1, Duration::from_secs(600), &cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(observation.index, 1);
    }

    #[tokio::test]
    async fn test_outage_is_an_error() {
        let sim = Arc::new(InMemoryCoordinator::new());
        sim.set_available(false);
        let watcher = ChangeWatcher::new(sim, KEY, Duration::from_secs(1));
        let err = watcher.blocking_read(0, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
    }
}
