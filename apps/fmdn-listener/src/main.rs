//! # FMDN Listener
//!
//! Listens for location pushes on behalf of the configured tenants.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info)                                    │
//! │  2. PushConfig::load(path from argv[1] or platform config dir)          │
//! │  3. SQLite store (or in-memory when no data dir exists)                 │
//! │  4. import credentials files, register one LoggingConsumer per tenant   │
//! │  5. wait for Ctrl-C, release the receiver                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use fmdn_core::payload::canonic_device_id;
use fmdn_core::{Credentials, LocationRecord, TenantId};
use fmdn_push::{Consumer, LocationDecryptor, PushConfig, PushResult, ReceiverBuilder, ReceiverLease};
use fmdn_store::{KeyValueStore, MemoryStore, SqliteStore, StoreConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs every update for its tenant. Tracks all devices.
struct LoggingConsumer {
    tenant: TenantId,
}

impl Consumer for LoggingConsumer {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant
    }

    fn is_tracked(&self, _device_id: &str) -> bool {
        true
    }

    fn update_cache(&self, device_id: &str, record: &LocationRecord) -> PushResult<()> {
        info!(
            tenant = %self.tenant,
            device_id = %device_id,
            latitude = ?record.latitude,
            longitude = ?record.longitude,
            accuracy = ?record.accuracy,
            "Location update"
        );
        Ok(())
    }
}

/// Reports the device id without decrypting the location itself.
struct PassthroughDecryptor;

#[async_trait]
impl LocationDecryptor for PassthroughDecryptor {
    async fn decrypt(&self, payload: &[u8], tenant: &TenantId) -> PushResult<LocationRecord> {
        let device_id = canonic_device_id(payload)?;
        info!(tenant = %tenant, device_id = %device_id, bytes = payload.len(), "Encrypted location received");
        Ok(LocationRecord::for_device(device_id))
    }
}

async fn open_store(config: &PushConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let Some(path) = config.storage.resolved_path() else {
        warn!("No data directory; credentials will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::new(StoreConfig::new(path.clone()))
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    info!(path = %path.display(), "Store opened");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = PushConfig::load(config_path).context("loading push config")?;
    if config.tenants.is_empty() {
        bail!("no [[tenants]] configured");
    }
    info!(tenants = config.tenants.len(), host = %config.mcs.host, "Configuration loaded");

    let store = open_store(&config).await?;
    let tenants = config.tenants.clone();
    let lease = ReceiverLease::new(ReceiverBuilder::new(config, store, Arc::new(PassthroughDecryptor)));
    let receiver = lease.acquire().await?;

    for entry in &tenants {
        let tenant = entry.tenant_id();
        if let Some(path) = &entry.credentials_file {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let credentials = Credentials::from_json(&raw)?;
            receiver.import_credentials(&tenant, credentials).await?;
        }
        receiver
            .register_consumer(Arc::new(LoggingConsumer { tenant: tenant.clone() }))
            .await?;
        info!(tenant = %tenant, "Listening");
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    lease.release().await;
    Ok(())
}
