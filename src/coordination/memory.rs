//! In-Memory Coordinator
//!
//! A single-process simulation of the coordination service. It follows the
//! Consul agent's rules closely enough to exercise the election protocol:
//! TTL checks turn critical when not refreshed, a critical check invalidates
//! every session bound to it, invalidation releases locks (with lock-delay),
//! and long-critical services are deregistered.
//!
//! Expiry is evaluated lazily on every call; blocking reads additionally
//! wake at the next expiry deadline so a lock released by a silent leader
//! is noticed without any other traffic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{
    Coordinator, KeyEntry, Observation, ServiceRegistration, SessionRequest,
};
use crate::error::{Error, Result};
use crate::identity::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckStatus {
    Passing,
    Critical,
}

struct SimCheck {
    service_id: String,
    ttl: Duration,
    deregister_after: Duration,
    status: CheckStatus,
    /// Passing: when the TTL runs out. Critical: when the check went critical.
    since: Instant,
}

struct SimSession {
    checks: Vec<String>,
    lock_delay: Duration,
}

struct SimEntry {
    value: Vec<u8>,
    session: Option<SessionId>,
    lock_index: u64,
    modify_index: u64,
    lock_delay_until: Option<Instant>,
}

struct SimState {
    /// Index of the last KV mutation
    kv_index: u64,
    next_session: u64,
    available: bool,
    checks: HashMap<String, SimCheck>,
    sessions: HashMap<String, SimSession>,
    keys: HashMap<String, SimEntry>,
    sessions_created: u64,
}

impl SimState {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable("simulated outage".into()))
        }
    }

    fn bump(&mut self) -> u64 {
        self.kv_index += 1;
        self.kv_index
    }

    fn observe(&self, key: &str) -> Observation {
        match self.keys.get(key) {
            Some(e) => Observation {
                key: key.to_string(),
                entry: Some(KeyEntry {
                    value: e.value.clone(),
                    session: e.session.clone(),
                    lock_index: e.lock_index,
                    modify_index: e.modify_index,
                }),
                index: e.modify_index,
            },
            None => Observation::missing(key, self.kv_index),
        }
    }

    /// Apply TTL expiry and deregistration up to `now`. Returns true if the KV store changed.
    fn reap(&mut self, now: Instant) -> bool {
        let mut newly_critical = Vec::new();
        let mut deregister = Vec::new();

        for (id, check) in self.checks.iter_mut() {
            // a lapsed TTL makes the check critical as of the moment it lapsed
            if check.status == CheckStatus::Passing && check.since <= now {
                check.status = CheckStatus::Critical;
                newly_critical.push(id.clone());
            }
            if check.status == CheckStatus::Critical && check.since + check.deregister_after <= now {
                deregister.push(id.clone());
            }
        }

        for id in &deregister {
            if let Some(check) = self.checks.remove(id) {
                tracing::debug!("Deregistered critical service {}", check.service_id);
            }
        }

        let mut changed = false;
        for check_id in newly_critical.iter().chain(deregister.iter()) {
            let doomed: Vec<String> = self
                .sessions
                .iter()
                .filter(|(_, s)| s.checks.iter().any(|c| c == check_id))
                .map(|(id, _)| id.clone())
                .collect();
            for session_id in doomed {
                tracing::debug!("Invalidating session {} (check {} critical)", session_id, check_id);
                changed |= self.invalidate_session(&session_id, now);
            }
        }
        changed
    }

    /// Remove a session and release whatever it holds
    fn invalidate_session(&mut self, session_id: &str, now: Instant) -> bool {
        let Some(session) = self.sessions.remove(session_id) else {
            return false;
        };

        let held: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, e)| e.session.as_ref().map(|s| s.as_str()) == Some(session_id))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &held {
            let index = self.bump();
            if let Some(entry) = self.keys.get_mut(key) {
                entry.session = None;
                entry.modify_index = index;
                if !session.lock_delay.is_zero() {
                    entry.lock_delay_until = Some(now + session.lock_delay);
                }
            }
        }
        !held.is_empty()
    }

    /// Earliest instant at which `reap` could change something
    fn next_deadline(&self) -> Option<Instant> {
        self.checks
            .values()
            .map(|c| match c.status {
                CheckStatus::Passing => c.since,
                CheckStatus::Critical => c.since + c.deregister_after,
            })
            .min()
    }
}

/// Simulated coordination service shared by any number of local contenders
pub struct InMemoryCoordinator {
    state: Mutex<SimState>,
    changed: watch::Sender<u64>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self::with_index(1)
    }

    /// Create an empty coordinator whose KV index starts at `index`
    pub fn with_index(index: u64) -> Self {
        let (changed, _) = watch::channel(index);
        Self {
            state: Mutex::new(SimState {
                kv_index: index,
                next_session: 1,
                available: true,
                checks: HashMap::new(),
                sessions: HashMap::new(),
                keys: HashMap::new(),
                sessions_created: 0,
            }),
            changed,
        }
    }

    /// Simulate the service becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.available = available;
        }
    }

    /// Number of sessions created since start
    pub fn sessions_created(&self) -> u64 {
        self.state.lock().map(|s| s.sessions_created).unwrap_or(0)
    }

    /// Whether a session is still valid
    pub fn session_exists(&self, session: &SessionId) -> bool {
        self.state
            .lock()
            .map(|s| s.sessions.contains_key(session.as_str()))
            .unwrap_or(false)
    }

    /// Whether a service's check is currently registered
    pub fn check_registered(&self, check_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.checks.contains_key(check_id))
            .unwrap_or(false)
    }

    /// Run one step of the service's own bookkeeping and return the state lock
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::CoordinationUnavailable("simulator state poisoned".into()))?;
        if state.reap(Instant::now()) {
            self.changed.send_replace(state.kv_index);
        }
        Ok(state)
    }

    fn notify(&self, index: u64) {
        self.changed.send_replace(index);
    }
}

#[async_trait::async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let mut state = self.lock()?;
        state.ensure_available()?;

        // Registering again keeps a passing check passing, like the agent does
        let now = Instant::now();
        let check = &registration.check;
        let (status, since) = match state.checks.get(&check.id) {
            Some(existing) => (existing.status, existing.since),
            None => (CheckStatus::Critical, now),
        };
        state.checks.insert(
            check.id.clone(),
            SimCheck {
                service_id: registration.id.clone(),
                ttl: check.ttl,
                deregister_after: check.deregister_after,
                status,
                since,
            },
        );
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let now = Instant::now();
        let changed = {
            let mut state = self.lock()?;
            state.ensure_available()?;
            let removed: Vec<String> = state
                .checks
                .iter()
                .filter(|(_, c)| c.service_id == service_id)
                .map(|(id, _)| id.clone())
                .collect();
            let mut changed = false;
            for check_id in removed {
                state.checks.remove(&check_id);
                let doomed: Vec<String> = state
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.checks.contains(&check_id))
                    .map(|(id, _)| id.clone())
                    .collect();
                for session_id in doomed {
                    changed |= state.invalidate_session(&session_id, now);
                }
            }
            changed.then_some(state.kv_index)
        };
        if let Some(index) = changed {
            self.notify(index);
        }
        Ok(())
    }

    async fn report_check_passing(&self, check_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.ensure_available()?;
        let check = state
            .checks
            .get_mut(check_id)
            .ok_or_else(|| Error::CoordinationUnavailable(format!("Unknown check ID \"{}\"", check_id)))?;
        check.status = CheckStatus::Passing;
        check.since = Instant::now() + check.ttl;
        Ok(())
    }

    async fn create_session(&self, request: &SessionRequest) -> Result<SessionId> {
        let mut state = self.lock()?;
        state.ensure_available()?;

        for check_id in &request.checks {
            match state.checks.get(check_id) {
                None => {
                    return Err(Error::CoordinationUnavailable(format!(
                        "Missing check '{}' registration",
                        check_id
                    )))
                }
                Some(c) if c.status == CheckStatus::Critical => {
                    return Err(Error::CoordinationUnavailable(format!(
                        "Check '{}' is in critical state",
                        check_id
                    )))
                }
                Some(_) => {}
            }
        }

        let id = format!("sim-session-{:08}", state.next_session);
        state.next_session += 1;
        state.sessions_created += 1;
        state.sessions.insert(
            id.clone(),
            SimSession {
                checks: request.checks.clone(),
                lock_delay: request.lock_delay,
            },
        );
        Ok(SessionId::new(id))
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let index = {
            let mut state = self.lock()?;
            state.ensure_available()?;
            let changed = state.invalidate_session(session.as_str(), Instant::now());
            changed.then_some(state.kv_index)
        };
        if let Some(index) = index {
            self.notify(index);
        }
        Ok(())
    }

    async fn read_key(&self, key: &str) -> Result<Observation> {
        let state = self.lock()?;
        state.ensure_available()?;
        Ok(state.observe(key))
    }

    async fn blocking_read(&self, key: &str, since_index: u64, wait: Duration) -> Result<Observation> {
        let deadline = Instant::now() + wait;
        let mut rx = self.changed.subscribe();

        loop {
            let (observation, next_deadline) = {
                let state = self.lock()?;
                state.ensure_available()?;
                (state.observe(key), state.next_deadline())
            };

            if since_index == 0 || observation.index > since_index {
                return Ok(observation);
            }

            if Instant::now() >= deadline {
                return Ok(observation);
            }

            let wake_at = next_deadline.map_or(deadline, |d| d.min(deadline));
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        let now = Instant::now();
        let index = {
            let mut state = self.lock()?;
            state.ensure_available()?;

            if !state.sessions.contains_key(session.as_str()) {
                return Err(Error::SessionLost(format!("invalid session \"{}\"", session)));
            }

            if let Some(entry) = state.keys.get(key) {
                match &entry.session {
                    Some(holder) if holder != session => return Ok(false),
                    None if entry.lock_delay_until.is_some_and(|until| until > now) => {
                        return Ok(false)
                    }
                    _ => {}
                }
            }

            let index = state.bump();
            let entry = state.keys.entry(key.to_string()).or_insert_with(|| SimEntry {
                value: Vec::new(),
                session: None,
                lock_index: 0,
                modify_index: index,
                lock_delay_until: None,
            });
            if entry.session.is_none() {
                entry.lock_index += 1;
            }
            entry.value = value.to_vec();
            entry.session = Some(session.clone());
            entry.modify_index = index;
            entry.lock_delay_until = None;
            index
        };
        self.notify(index);
        Ok(true)
    }

    async fn release(&self, key: &str, session: &SessionId) -> Result<bool> {
        let index = {
            let mut state = self.lock()?;
            state.ensure_available()?;

            let held = state
                .keys
                .get(key)
                .is_some_and(|e| e.session.as_ref() == Some(session));
            if !held {
                return Ok(false);
            }
            let index = state.bump();
            if let Some(entry) = state.keys.get_mut(key) {
                entry.session = None;
                entry.modify_index = index;
            }
            index
        };
        self.notify(index);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::TtlCheck;
    use std::sync::Arc;

    const KEY: &str = "service/svc/leader";

    fn registration(id: &str, ttl: Duration, deregister_after: Duration) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: "svc".to_string(),
            check: TtlCheck {
                id: format!("service:{}", id),
                ttl,
                deregister_after,
            },
        }
    }

    fn session_request(check: &str) -> SessionRequest {
        SessionRequest {
            name: "test".into(),
            checks: vec![check.to_string()],
            lock_delay: Duration::ZERO,
        }
    }

    async fn live_session(sim: &InMemoryCoordinator, id: &str, ttl: Duration) -> SessionId {
        sim.register_service(&registration(id, ttl, Duration::from_secs(60)))
            .await
            .unwrap();
        let check = format!("service:{}", id);
        sim.report_check_passing(&check).await.unwrap();
        sim.create_session(&session_request(&check)).await.unwrap()
    }

    #[tokio::test]
    async fn test_session_requires_passing_check() {
        let sim = InMemoryCoordinator::new();
        sim.register_service(&registration("a", Duration::from_secs(5), Duration::from_secs(60)))
            .await
            .unwrap();

        let err = sim.create_session(&session_request("service:a")).await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));

        sim.report_check_passing("service:a").await.unwrap();
        assert!(sim.create_session(&session_request("service:a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let sim = InMemoryCoordinator::new();
        let a = live_session(&sim, "a", Duration::from_secs(5)).await;
        let b = live_session(&sim, "b", Duration::from_secs(5)).await;

        assert!(sim.acquire(KEY, b"a", &a).await.unwrap());
        assert!(!sim.acquire(KEY, b"b", &b).await.unwrap());
        // the holder may re-acquire
        assert!(sim.acquire(KEY, b"a", &a).await.unwrap());

        let observation = sim.read_key(KEY).await.unwrap();
        assert_eq!(observation.lock_holder(), Some(&a));
        assert_eq!(observation.entry.unwrap().lock_index, 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_have_one_winner() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let mut sessions = Vec::new();
        for i in 0..8 {
            sessions.push(live_session(&sim, &format!("n{}", i), Duration::from_secs(5)).await);
        }

        let mut handles = Vec::new();
        for session in sessions {
            let sim = Arc::clone(&sim);
            handles.push(tokio::spawn(async move {
                sim.acquire(KEY, session.as_str().as_bytes(), &session).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_acquire_with_unknown_session_is_session_lost() {
        let sim = InMemoryCoordinator::new();
        let err = sim
            .acquire(KEY, b"x", &SessionId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionLost(_)));
    }

    #[tokio::test]
    async fn test_ttl_expiry_releases_lock() {
        let sim = InMemoryCoordinator::new();
        let a = live_session(&sim, "a", Duration::from_millis(50)).await;
        assert!(sim.acquire(KEY, b"a", &a).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let observation = sim.read_key(KEY).await.unwrap();
        assert!(!observation.is_locked());
        // release keeps the value
        assert_eq!(observation.value(), Some(&b"a"[..]));
        assert!(!sim.session_exists(&a));
    }

    #[tokio::test]
    async fn test_lock_delay_blocks_reacquire() {
        let sim = InMemoryCoordinator::new();
        sim.register_service(&registration("a", Duration::from_secs(5), Duration::from_secs(60)))
            .await
            .unwrap();
        sim.report_check_passing("service:a").await.unwrap();
        let mut request = session_request("service:a");
        request.lock_delay = Duration::from_millis(100);
        let a = sim.create_session(&request).await.unwrap();
        let b = live_session(&sim, "b", Duration::from_secs(5)).await;

        assert!(sim.acquire(KEY, b"a", &a).await.unwrap());
        sim.destroy_session(&a).await.unwrap();

        assert!(!sim.acquire(KEY, b"b", &b).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sim.acquire(KEY, b"b", &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_read_first_call_returns_immediately() {
        let sim = InMemoryCoordinator::with_index(5);
        let observation = sim
            .blocking_read(KEY, 0, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(observation.index, 5);
        assert!(observation.entry.is_none());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_change() {
        let sim = Arc::new(InMemoryCoordinator::new());
        let a = live_session(&sim, "a", Duration::from_secs(5)).await;
        let since = sim.read_key(KEY).await.unwrap().index;

        let reader = {
            let sim = Arc::clone(&sim);
            tokio::spawn(async move { sim.blocking_read(KEY, since, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sim.acquire(KEY, b"a", &a).await.unwrap());

        let observation = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(observation.index > since);
        assert_eq!(observation.lock_holder(), Some(&a));
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_with_same_index() {
        let sim = InMemoryCoordinator::new();
        let since = sim.read_key(KEY).await.unwrap().index;
        let observation = sim
            .blocking_read(KEY, since, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(observation.index, since);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_ttl_expiry() {
        let sim = InMemoryCoordinator::new();
        let a = live_session(&sim, "a", Duration::from_millis(50)).await;
        assert!(sim.acquire(KEY, b"a", &a).await.unwrap());
        let since = sim.read_key(KEY).await.unwrap().index;

        let observation = tokio::time::timeout(
            Duration::from_secs(1),
            sim.blocking_read(KEY, since, Duration::from_secs(30)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(observation.index > since);
        assert!(!observation.is_locked());
    }

    #[tokio::test]
    async fn test_critical_service_is_deregistered() {
        let sim = InMemoryCoordinator::new();
        sim.register_service(&registration("a", Duration::from_millis(10), Duration::from_millis(20)))
            .await
            .unwrap();
        sim.report_check_passing("service:a").await.unwrap();
        assert!(sim.check_registered("service:a"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = sim.read_key(KEY).await.unwrap();
        assert!(!sim.check_registered("service:a"));
        assert!(sim.report_check_passing("service:a").await.is_err());
    }

    #[tokio::test]
    async fn test_outage() {
        let sim = InMemoryCoordinator::new();
        sim.set_available(false);
        let err = sim.read_key(KEY).await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        sim.set_available(true);
        assert!(sim.read_key(KEY).await.is_ok());
    }
}
