//! Service Identity
//!
//! Names a single running instance of a service. The identity doubles as
//! the health check owner and as the value written into the leadership key
//! when this instance wins an election.

use serde::{Deserialize, Serialize};

/// Prefix Consul uses for checks attached to a service registration
const SERVICE_CHECK_PREFIX: &str = "service:";

/// Immutable (service name, instance id) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Logical service name shared by all competing instances
    pub name: String,
    /// Unique id of this instance
    pub id: String,
}

impl ServiceIdentity {
    /// Create an identity with an explicit instance id
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Create an identity whose id is the name suffixed with the current
    /// unix time in milliseconds
    pub fn generate(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = format!("{}-{}", name, chrono::Utc::now().timestamp_millis());
        Self { name, id }
    }

    /// Key whose lock holder is the elected leader
    pub fn leader_key(&self) -> String {
        leader_key(&self.name)
    }

    /// Id of the TTL check registered for this instance
    pub fn check_id(&self) -> String {
        format!("{}{}", SERVICE_CHECK_PREFIX, self.id)
    }

    /// Encode as the value stored in the leadership key
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a leadership key value.
    ///
    /// Values that are not JSON are taken to be a bare instance id.
    pub fn decode(service_name: &str, raw: &[u8]) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        if let Ok(identity) = serde_json::from_slice::<ServiceIdentity>(raw) {
            return Some(identity);
        }
        let id = std::str::from_utf8(raw).ok()?.trim();
        if id.is_empty() {
            return None;
        }
        Some(Self::new(service_name, id))
    }
}

impl std::fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Leadership key for a service name
pub fn leader_key(service_name: &str) -> String {
    format!("service/{}/leader", service_name)
}

/// Opaque session id issued by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw session id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
