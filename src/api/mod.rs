//! HTTP API Module
//!
//! Exposes this node's view of the election over HTTP.

mod http;

pub use http::{HealthResponse, HttpServer, LeaderResponse};
