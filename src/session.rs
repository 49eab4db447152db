//! Session Manager
//!
//! Owns this process's coordination session. The session is created on
//! first use, bound to nothing but the instance's own TTL check, and cached
//! until it is known to be invalid.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::coordination::{Coordinator, SessionRequest};
use crate::error::Result;
use crate::identity::{ServiceIdentity, SessionId};

/// Lazily created, cached session
pub struct SessionManager {
    coordinator: Arc<dyn Coordinator>,
    request: SessionRequest,
    /// Held across creation so concurrent first callers share one session
    cached: Mutex<Option<SessionId>>,
}

impl SessionManager {
    /// Create a manager for the given identity
    pub fn new(coordinator: Arc<dyn Coordinator>, identity: &ServiceIdentity, lock_delay: Duration) -> Self {
        Self {
            coordinator,
            request: SessionRequest {
                name: identity.id.clone(),
                checks: vec![identity.check_id()],
                lock_delay,
            },
            cached: Mutex::new(None),
        }
    }

    /// Return the cached session, creating it first if there is none
    pub async fn get_or_create(&self) -> Result<SessionId> {
        let mut cached = self.cached.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }

        let session = self.coordinator.create_session(&self.request).await?;
        tracing::info!("Created session {} bound to {:?}", session, self.request.checks);
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Cached session without touching the network
    pub async fn current(&self) -> Option<SessionId> {
        self.cached.lock().await.clone()
    }

    /// Forget `session` so the next call creates a fresh one.
    ///
    /// Only the session the caller observed failing is dropped; a newer
    /// session created in the meantime is kept.
    pub async fn invalidate(&self, session: &SessionId) -> bool {
        let mut cached = self.cached.lock().await;
        if cached.as_ref() == Some(session) {
            tracing::warn!("Session {} is no longer valid, a new one will be created", session);
            *cached = None;
            true
        } else {
            false
        }
    }

    /// Destroy the cached session, if any. Failures are logged, not returned.
    pub async fn destroy(&self) {
        let Some(session) = self.cached.lock().await.take() else {
            return;
        };
        match self.coordinator.destroy_session(&session).await {
            Ok(()) => tracing::info!("Destroyed session {}", session),
            Err(e) => tracing::warn!("Failed to destroy session {}: {}", session, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{InMemoryCoordinator, ServiceRegistration, TtlCheck};
    use crate::error::Error;

    async fn registered(sim: &InMemoryCoordinator, identity: &ServiceIdentity) {
        sim.register_service(&ServiceRegistration {
            id: identity.id.clone(),
            name: identity.name.clone(),
            check: TtlCheck {
                id: identity.check_id(),
                ttl: Duration::from_secs(5),
                deregister_after: Duration::from_secs(60),
            },
        })
        .await
        .unwrap();
        sim.report_check_passing(&identity.check_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_is_cached() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let identity = ServiceIdentity::new("svc", "svc-1");
        registered(&sim, &identity).await;

        let manager = SessionManager::new(sim.clone(), &identity, Duration::ZERO);
        assert_eq!(manager.current().await, None);

        let first = manager.get_or_create().await.unwrap();
        let second = manager.get_or_create().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sim.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_access_creates_one_session() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let identity = ServiceIdentity::new("svc", "svc-1");
        registered(&sim, &identity).await;

        let manager = Arc::new(SessionManager::new(sim.clone(), &identity, Duration::ZERO));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.get_or_create().await.unwrap() }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        sessions.dedup();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sim.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_is_not_cached() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let identity = ServiceIdentity::new("svc", "svc-1");
        registered(&sim, &identity).await;
        let manager = SessionManager::new(sim.clone(), &identity, Duration::ZERO);

        sim.set_available(false);
        let err = manager.get_or_create().await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        assert_eq!(manager.current().await, None);

        sim.set_available(true);
        assert!(manager.get_or_create().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_only_matching_session() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let identity = ServiceIdentity::new("svc", "svc-1");
        registered(&sim, &identity).await;
        let manager = SessionManager::new(sim.clone(), &identity, Duration::ZERO);

        let first = manager.get_or_create().await.unwrap();
        assert!(!manager.invalidate(&SessionId::new("someone-else")).await);
        assert_eq!(manager.current().await, Some(first.clone()));

        assert!(manager.invalidate(&first).await);
        let second = manager.get_or_create().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(sim.sessions_created(), 2);
    }

    #[tokio::test]
    async fn test_destroy() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let identity = ServiceIdentity::new("svc", "svc-1");
        registered(&sim, &identity).await;
        let manager = SessionManager::new(sim.clone(), &identity, Duration::ZERO);

        let session = manager.get_or_create().await.unwrap();
        manager.destroy().await;
        assert!(!sim.session_exists(&session));
        assert_eq!(manager.current().await, None);
    }
}
