//! Coordination Service Module
//!
//! Client-side view of the strongly-consistent coordination service the
//! election runs against: service registration with TTL checks, sessions
//! bound to those checks, and a key/value store with session locks and
//! indexed blocking reads.

mod consul;
mod memory;

pub use consul::ConsulClient;
pub use memory::InMemoryCoordinator;

use std::time::Duration;

use crate::error::Result;
use crate::identity::SessionId;

/// Session value some clients write in place of an absent lock holder
const NULL_SESSION: &str = "null";

/// Service registration with its single TTL check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Instance id
    pub id: String,
    /// Logical service name
    pub name: String,
    /// TTL check attached to the registration
    pub check: TtlCheck,
}

/// TTL health check definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlCheck {
    /// Check id (`service:{id}`)
    pub id: String,
    /// Time the check stays passing after each report
    pub ttl: Duration,
    /// Remove the service once the check has been critical this long
    pub deregister_after: Duration,
}

/// Session creation request.
///
/// Sessions are always created with the `release` behavior: on invalidation
/// their locks are dropped and the stored values are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Human readable session name
    pub name: String,
    /// Checks the session is bound to
    pub checks: Vec<String>,
    /// Window after invalidation during which released locks cannot be re-acquired
    pub lock_delay: Duration,
}

/// A key/value entry as stored by the coordination service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Raw value
    pub value: Vec<u8>,
    /// Session currently holding the lock, if any
    pub session: Option<SessionId>,
    /// Number of times the lock has been acquired
    pub lock_index: u64,
    /// Index of the last modification
    pub modify_index: u64,
}

impl KeyEntry {
    /// Build an entry, folding empty and `"null"` session ids into `None`
    pub fn new(value: Vec<u8>, session: Option<String>, lock_index: u64, modify_index: u64) -> Self {
        let session = session
            .filter(|s| !s.is_empty() && s != NULL_SESSION)
            .map(SessionId::new);
        Self {
            value,
            session,
            lock_index,
            modify_index,
        }
    }
}

/// Result of reading a key: its entry (if present) and the index to wait on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Key that was read
    pub key: String,
    /// Entry, absent when the key does not exist
    pub entry: Option<KeyEntry>,
    /// Index returned with the read
    pub index: u64,
}

impl Observation {
    /// Observation of a key that does not exist
    pub fn missing(key: impl Into<String>, index: u64) -> Self {
        Self {
            key: key.into(),
            entry: None,
            index,
        }
    }

    /// Session holding the lock
    pub fn lock_holder(&self) -> Option<&SessionId> {
        self.entry.as_ref().and_then(|e| e.session.as_ref())
    }

    /// Whether any session holds the lock
    pub fn is_locked(&self) -> bool {
        self.lock_holder().is_some()
    }

    /// Stored value, absent for missing keys and empty values
    pub fn value(&self) -> Option<&[u8]> {
        self.entry
            .as_ref()
            .map(|e| e.value.as_slice())
            .filter(|v| !v.is_empty())
    }
}

/// Operations the election protocol needs from the coordination service
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// Register (or re-register) a service with its TTL check
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Remove a service registration and its checks
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Mark a TTL check as passing
    async fn report_check_passing(&self, check_id: &str) -> Result<()>;

    /// Create a session bound to the given checks
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionId>;

    /// Destroy a session, releasing its locks
    async fn destroy_session(&self, session: &SessionId) -> Result<()>;

    /// Non-blocking point read
    async fn read_key(&self, key: &str) -> Result<Observation>;

    /// Read that returns once the key index exceeds `since_index` or `wait` elapses
    async fn blocking_read(&self, key: &str, since_index: u64, wait: Duration) -> Result<Observation>;

    /// Set the value and take the lock, only if no other session holds it
    async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool>;

    /// Drop the lock if held by `session`
    async fn release(&self, key: &str, session: &SessionId) -> Result<bool>;
}

/// Format a duration the way Consul duration strings expect
fn duration_string(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
