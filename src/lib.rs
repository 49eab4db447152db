//! WolfLeader - Session-Based Leader Election for Consul
//!
//! Elects a single leader among the instances of a service by taking a lock
//! on a well-known key in a Consul-style key/value store.
//!
//! # Architecture
//!
//! Each instance registers itself with a TTL health check and keeps it
//! passing from a background heartbeat. A session bound to that check is
//! used to acquire `service/<name>/leader`. If the instance stops
//! heartbeating, the check goes critical, the session is invalidated and the
//! lock is released for the remaining instances to contend for.
//!
//! # Features
//!
//! - TTL liveness reporting with automatic re-registration
//! - Lazily created, cached sessions that are replaced when lost
//! - Blocking-query change watching with index hygiene
//! - Voluntary step-down on shutdown
//! - In-memory coordinator for tests and local experiments
//! - HTTP status API

pub mod api;
pub mod backoff;
pub mod config;
pub mod coordination;
pub mod election;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod node;
pub mod session;
pub mod watcher;

pub use config::WolfLeaderConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfLeaderConfig;
    pub use crate::coordination::{ConsulClient, Coordinator, InMemoryCoordinator, Observation};
    pub use crate::election::{Decision, LeadershipStatus, Role};
    pub use crate::error::{Error, Result};
    pub use crate::identity::{ServiceIdentity, SessionId};
    pub use crate::node::{ElectionSettings, LeaderElection};
}
