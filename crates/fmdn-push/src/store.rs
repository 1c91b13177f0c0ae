//! # Tenant Store
//!
//! Per-tenant persistence on top of the key-value collaborator. Each tenant
//! is its own namespace:
//!
//! ```text
//! namespace = tenant id
//!   "fcm_credentials"     Credentials JSON blob
//!   "fcm_routing_tokens"  JSON array of push tokens, newest first
//! ```

use std::sync::Arc;

use fmdn_core::{Credentials, TenantId};
use fmdn_store::KeyValueStore;
use tracing::warn;

use crate::error::{PushError, PushResult};

const CREDENTIALS_KEY: &str = "fcm_credentials";
const ROUTING_TOKENS_KEY: &str = "fcm_routing_tokens";

/// Typed access to a tenant's persisted push state.
#[derive(Clone)]
pub struct TenantStore {
    kv: Arc<dyn KeyValueStore>,
}

impl TenantStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        TenantStore { kv }
    }

    /// Loads the credentials blob. A corrupt blob is logged and treated as
    /// absent so the tenant registers again.
    pub async fn load_credentials(&self, tenant: &TenantId) -> PushResult<Option<Credentials>> {
        let Some(raw) = self.kv.get(tenant.as_str(), CREDENTIALS_KEY).await? else {
            return Ok(None);
        };
        match Credentials::from_json(&raw) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Stored credentials are unreadable; ignoring");
                Ok(None)
            }
        }
    }

    pub async fn save_credentials(&self, tenant: &TenantId, credentials: &Credentials) -> PushResult<()> {
        let json = credentials
            .to_json()
            .map_err(|e| PushError::Serialization(e.to_string()))?;
        self.kv.set(tenant.as_str(), CREDENTIALS_KEY, &json).await?;
        Ok(())
    }

    pub async fn load_routing_tokens(&self, tenant: &TenantId) -> PushResult<Vec<String>> {
        let Some(raw) = self.kv.get(tenant.as_str(), ROUTING_TOKENS_KEY).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn save_routing_tokens(&self, tenant: &TenantId, tokens: &[String]) -> PushResult<()> {
        let json = serde_json::to_string(tokens)?;
        self.kv.set(tenant.as_str(), ROUTING_TOKENS_KEY, &json).await?;
        Ok(())
    }

    /// Forgets everything stored for a tenant.
    pub async fn clear(&self, tenant: &TenantId) -> PushResult<()> {
        self.kv.delete(tenant.as_str(), CREDENTIALS_KEY).await?;
        self.kv.delete(tenant.as_str(), ROUTING_TOKENS_KEY).await?;
        Ok(())
    }
}
