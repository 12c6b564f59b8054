//! Secret store port: service-step headers reference secrets by name rather
//! than carrying values inline. A thin async-trait port at the boundary
//! rather than a concrete client struct threaded through the call stack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretAccessContext {
    pub actor: Option<String>,
    pub actor_type: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub value: Option<String>,
}

#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    async fn resolve_secret(&self, reference: &str, ctx: SecretAccessContext) -> Result<ResolvedSecret, SecretError>;

    /// Replaces a secret value with a fixed-width mask for safe storage in
    /// `sanitizedHeaders`/logs.
    fn mask_secret(&self, value: &str) -> String {
        if value.len() <= 4 {
            "****".to_string()
        } else {
            format!("{}****", &value[..2])
        }
    }

    /// Human-readable label for a secret reference, never the value itself.
    fn describe_secret(&self, reference: &str) -> String {
        format!("secret:{reference}")
    }
}

/// Secret store that always reports the secret missing. Useful as a default
/// wiring when no real secret backend has been configured, without making
/// the dependency optional at every call site.
pub struct NullSecretStore;

#[async_trait]
impl SecretStore for NullSecretStore {
    async fn resolve_secret(&self, reference: &str, _ctx: SecretAccessContext) -> Result<ResolvedSecret, SecretError> {
        Err(SecretError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_a_short_prefix() {
        let store = NullSecretStore;
        assert_eq!(store.mask_secret("sk-abcdef"), "sk****");
        assert_eq!(store.mask_secret("ab"), "****");
    }
}
