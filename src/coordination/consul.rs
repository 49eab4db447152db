//! Consul Client
//!
//! Coordinator implementation over the Consul agent HTTP API (v1).

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{duration_string, Coordinator, KeyEntry, Observation, ServiceRegistration, SessionRequest};
use crate::config::ConsulConfig;
use crate::error::{Error, Result};
use crate::identity::SessionId;

/// Header carrying the index of a read
const INDEX_HEADER: &str = "X-Consul-Index";

/// Header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Invalidated sessions release their locks and keep the values
const SESSION_BEHAVIOR: &str = "release";

/// Timeout for every request that is not a blocking query
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack on top of the blocking wait: Consul adds up to wait/16 of jitter
fn blocking_timeout(wait: Duration) -> Duration {
    wait + wait / 16 + Duration::from_secs(5)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    check: RegisterCheck<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterCheck<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    deregister_critical_service_after: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionBody<'a> {
    name: &'a str,
    checks: &'a [String],
    behavior: &'a str,
    lock_delay: String,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    lock_index: u64,
    #[serde(default)]
    modify_index: u64,
}

/// Consul agent client
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    /// Create a client for the configured agent
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            datacenter: config.datacenter.clone().filter(|d| !d.is_empty()),
        })
    }

    /// Agent base URL
    pub fn address(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT);
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder
    }

    /// Request scoped to the configured datacenter (sessions and KV)
    fn dc_request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.request(method, path);
        match &self.datacenter {
            Some(dc) => builder.query(&[("dc", dc.as_str())]),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(what, status, &body))
    }

    async fn read(&self, key: &str, blocking: Option<(u64, Duration)>) -> Result<Observation> {
        let mut builder = self.dc_request(Method::GET, &format!("/v1/kv/{}", key));
        if let Some((index, wait)) = blocking {
            builder = builder
                .query(&[("index", index.to_string()), ("wait", duration_string(wait))])
                .timeout(blocking_timeout(wait));
        }

        let response = builder.send().await?;
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Observation::missing(key, index)),
            status if status.is_success() => {
                let pairs: Vec<KvPair> = response.json().await?;
                let pair = pairs
                    .into_iter()
                    .find(|p| p.key == key)
                    .ok_or_else(|| Error::CoordinationUnavailable(format!("no entry for {} in KV response", key)))?;
                let value = match pair.value {
                    Some(encoded) => BASE64.decode(encoded.as_bytes()).map_err(|e| {
                        Error::CoordinationUnavailable(format!("undecodable value for {}: {}", key, e))
                    })?,
                    None => Vec::new(),
                };
                Ok(Observation {
                    key: key.to_string(),
                    entry: Some(KeyEntry::new(value, pair.session, pair.lock_index, pair.modify_index)),
                    index,
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_failure("read key", status, &body))
            }
        }
    }

    async fn kv_bool(&self, builder: RequestBuilder, what: &str) -> Result<bool> {
        let response = self.send(builder, what).await?;
        let body = response.text().await?;
        Ok(body.trim() == "true")
    }
}

/// Map a non-success response onto the error taxonomy
fn classify_failure(what: &str, status: StatusCode, body: &str) -> Error {
    let body = body.trim();
    if body.to_ascii_lowercase().contains("invalid session") {
        return Error::SessionLost(body.to_string());
    }
    Error::CoordinationUnavailable(format!("{} failed with {}: {}", what, status, body))
}

#[async_trait::async_trait]
impl Coordinator for ConsulClient {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let body = RegisterBody {
            id: &registration.id,
            name: &registration.name,
            check: RegisterCheck {
                check_id: &registration.check.id,
                ttl: duration_string(registration.check.ttl),
                deregister_critical_service_after: duration_string(registration.check.deregister_after),
            },
        };
        let builder = self
            .request(Method::PUT, "/v1/agent/service/register")
            .json(&body);
        self.send(builder, "register service").await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let builder = self.request(Method::PUT, &format!("/v1/agent/service/deregister/{}", service_id));
        self.send(builder, "deregister service").await?;
        Ok(())
    }

    async fn report_check_passing(&self, check_id: &str) -> Result<()> {
        let builder = self.request(Method::PUT, &format!("/v1/agent/check/pass/{}", check_id));
        self.send(builder, "pass check").await?;
        Ok(())
    }

    async fn create_session(&self, request: &SessionRequest) -> Result<SessionId> {
        let body = SessionBody {
            name: &request.name,
            checks: &request.checks,
            behavior: SESSION_BEHAVIOR,
            lock_delay: duration_string(request.lock_delay),
        };
        let builder = self.dc_request(Method::PUT, "/v1/session/create").json(&body);
        let created: SessionCreated = self.send(builder, "create session").await?.json().await?;
        Ok(SessionId::new(created.id))
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let builder = self.dc_request(Method::PUT, &format!("/v1/session/destroy/{}", session));
        self.send(builder, "destroy session").await?;
        Ok(())
    }

    async fn read_key(&self, key: &str) -> Result<Observation> {
        self.read(key, None).await
    }

    async fn blocking_read(&self, key: &str, since_index: u64, wait: Duration) -> Result<Observation> {
        self.read(key, Some((since_index, wait))).await
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        let builder = self
            .dc_request(Method::PUT, &format!("/v1/kv/{}", key))
            .query(&[("acquire", session.as_str())])
            .body(value.to_vec());
        self.kv_bool(builder, "acquire").await
    }

    async fn release(&self, key: &str, session: &SessionId) -> Result<bool> {
        let builder = self
            .dc_request(Method::PUT, &format!("/v1/kv/{}", key))
            .query(&[("release", session.as_str())]);
        self.kv_bool(builder, "release").await
    }
}
