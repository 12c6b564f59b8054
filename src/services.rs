//! Service-registry port: service steps resolve a target by slug, then issue
//! a request through `fetch_from_service`. Kept as a trait so the in-process
//! HTTP client (`reqwest`-free here, since no example in the pack pulls it
//! in for this kind of internal call) can be swapped for a test double.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unknown,
    Unreachable,
}

impl ServiceStatus {
    pub fn is_invocable(self, require_healthy: bool, allow_degraded: bool) -> bool {
        match self {
            ServiceStatus::Healthy => true,
            ServiceStatus::Degraded => !require_healthy && allow_degraded,
            ServiceStatus::Unknown => !require_healthy && allow_degraded,
            ServiceStatus::Unreachable => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub slug: String,
    pub base_url: String,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub body_text: String,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {0} not found")]
    NotFound(String),
    #[error("request to {slug} timed out after {timeout_ms}ms")]
    Timeout { slug: String, timeout_ms: u64 },
    #[error("network failure calling {slug}: {message}")]
    Network { slug: String, message: String },
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    async fn get_service_by_slug(&self, slug: &str) -> Option<ServiceDescriptor>;
    async fn fetch_from_service(
        &self,
        service: &ServiceDescriptor,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_requires_allow_degraded() {
        assert!(ServiceStatus::Degraded.is_invocable(false, true));
        assert!(!ServiceStatus::Degraded.is_invocable(false, false));
        assert!(!ServiceStatus::Degraded.is_invocable(true, true));
    }

    #[test]
    fn unreachable_never_invocable() {
        assert!(!ServiceStatus::Unreachable.is_invocable(false, true));
    }
}
