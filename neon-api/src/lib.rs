//! Client for the Neon control-plane REST API.
//!
//! Exposes resource-oriented operations (organizations, projects, branches,
//! endpoints, roles, databases, connection URIs) over a retrying HTTP
//! client. The retry policy is injectable so tests can run without real
//! backoff delays.

pub mod client;
pub mod retry;
pub mod types;

pub use client::{NeonApiClient, NeonApiError};
pub use retry::RetryPolicy;
