//! # Shared Receiver
//!
//! The process-wide façade hosts talk to. Owns one supervisor per tenant,
//! the token routing table, the consumer list and the router task.
//!
//! ## Composition
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SharedReceiver                                  │
//! │                                                                         │
//! │   register_consumer ──► ConsumerRegistry ──┐                            │
//! │          │                                 │                            │
//! │          ▼                                 ▼                            │
//! │   TenantSupervisor (per tenant)        Router task ◄── mpsc ──┐         │
//! │          │  tokens                         ▲                  │         │
//! │          ▼                                 │                  │         │
//! │   TokenRoutingTable ───────────────────────┘        McsConnection(s)    │
//! │                                                                         │
//! │   register_for_location_updates ──► ManualLocateRegistry ──► Router     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`ReceiverLease`] wraps construction in an acquire/release pair so that
//! several hosts share one receiver and the last release tears it down.

use std::collections::BTreeMap;
use std::sync::Arc;

use fmdn_core::{Credentials, InboundPush, TenantId};
use fmdn_store::KeyValueStore;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::consumer::{Consumer, LocationDecryptor, ManualLocateCallback, OwnerIndex};
use crate::error::PushResult;
use crate::mcs::{Dialer, TlsDialer};
use crate::router::{Router, RouterParts};
use crate::routing::{ConsumerRegistry, ManualLocateRegistry, TokenRoutingTable};
use crate::store::TenantStore;
use crate::supervisor::{TenantStatus, TenantSupervisor};

// =============================================================================
// Builder
// =============================================================================

/// Collects the collaborators a [`SharedReceiver`] needs.
#[derive(Clone)]
pub struct ReceiverBuilder {
    config: PushConfig,
    store: Arc<dyn KeyValueStore>,
    decryptor: Arc<dyn LocationDecryptor>,
    dialer: Option<Arc<dyn Dialer>>,
    owner_index: Option<Arc<dyn OwnerIndex>>,
}

impl ReceiverBuilder {
    pub fn new(config: PushConfig, store: Arc<dyn KeyValueStore>, decryptor: Arc<dyn LocationDecryptor>) -> Self {
        ReceiverBuilder {
            config,
            store,
            decryptor,
            dialer: None,
            owner_index: None,
        }
    }

    /// Replaces the TLS dialer.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Enables the device → tenant fallback lookup.
    pub fn owner_index(mut self, owner_index: Arc<dyn OwnerIndex>) -> Self {
        self.owner_index = Some(owner_index);
        self
    }

    /// Builds the receiver and spawns its router task. Must run inside a
    /// tokio runtime.
    pub fn build(&self) -> PushResult<SharedReceiver> {
        self.config.validate()?;

        let routing = Arc::new(TokenRoutingTable::new());
        let consumers = Arc::new(ConsumerRegistry::new());
        let manual = Arc::new(ManualLocateRegistry::new());
        let (router, push_tx) = Router::spawn(
            self.config.router.clone(),
            RouterParts {
                routing: Arc::clone(&routing),
                consumers: Arc::clone(&consumers),
                manual: Arc::clone(&manual),
                decryptor: Arc::clone(&self.decryptor),
                owner_index: self.owner_index.clone(),
            },
        );
        let dialer = self
            .dialer
            .clone()
            .unwrap_or_else(|| Arc::new(TlsDialer::new()) as Arc<dyn Dialer>);

        Ok(SharedReceiver {
            config: Arc::new(self.config.clone()),
            store: TenantStore::new(Arc::clone(&self.store)),
            dialer,
            routing,
            consumers,
            manual,
            router,
            push_tx,
            supervisors: Mutex::new(BTreeMap::new()),
            membership: Mutex::new(()),
        })
    }
}

// =============================================================================
// Shared Receiver
// =============================================================================

/// Multi-tenant push receiver.
pub struct SharedReceiver {
    config: Arc<PushConfig>,
    store: TenantStore,
    dialer: Arc<dyn Dialer>,
    routing: Arc<TokenRoutingTable>,
    consumers: Arc<ConsumerRegistry>,
    manual: Arc<ManualLocateRegistry>,
    router: Router,
    push_tx: mpsc::Sender<InboundPush>,
    supervisors: Mutex<BTreeMap<TenantId, Arc<TenantSupervisor>>>,
    /// Held across a consumer change and the supervisor start or stop it
    /// triggers.
    membership: Mutex<()>,
}

impl SharedReceiver {
    /// Adds a consumer to the fan-out list and makes sure its tenant is
    /// listening.
    pub async fn register_consumer(&self, consumer: Arc<dyn Consumer>) -> PushResult<()> {
        let tenant = consumer.tenant_id().clone();
        let _membership = self.membership.lock().await;
        if !self.consumers.register(consumer).await {
            debug!(tenant = %tenant, "Consumer already registered");
        }

        let supervisor = self.supervisor(&tenant).await?;
        supervisor.start().await?;
        supervisor.publish_tokens().await;
        info!(tenant = %tenant, "Consumer registered");
        Ok(())
    }

    /// Removes a consumer. When it was the tenant's last one, the tenant's
    /// supervisor is stopped and its tokens leave the routing table.
    pub async fn unregister_consumer(&self, consumer: &Arc<dyn Consumer>) -> bool {
        let tenant = consumer.tenant_id().clone();
        let _membership = self.membership.lock().await;
        if !self.consumers.unregister(consumer).await {
            return false;
        }
        if self.consumers.has_tenant(&tenant).await {
            return true;
        }

        let supervisor = self.supervisors.lock().await.remove(&tenant);
        if let Some(supervisor) = supervisor {
            info!(tenant = %tenant, "Last consumer left; stopping tenant");
            supervisor.stop().await;
        }
        self.routing.unbind_tenant(&tenant).await;
        true
    }

    /// Prepares a request-correlated locate of `device_id`.
    ///
    /// Returns the push token the caller embeds in its outbound request, or
    /// `None` if no tenant can receive the answer right now. The callback
    /// fires at most once.
    pub async fn register_for_location_updates(
        &self,
        device_id: &str,
        callback: ManualLocateCallback,
    ) -> Option<String> {
        let Some(tenant) = self.owner_for(device_id).await else {
            warn!(device_id = %device_id, "No tenant available for locate request");
            return None;
        };

        let supervisor = match self.supervisor(&tenant).await {
            Ok(supervisor) => supervisor,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Cannot set up tenant for locate request");
                return None;
            }
        };
        if let Err(e) = supervisor.start().await {
            warn!(tenant = %tenant, error = %e, "Tenant did not start");
            return None;
        }

        self.manual.register(device_id, tenant.clone(), callback).await;

        let token = match supervisor.ensure_token(false).await {
            Some(token) => Some(token),
            None => supervisor.ensure_token(true).await,
        };
        match token {
            Some(token) => {
                info!(tenant = %tenant, device_id = %device_id, "Locate request armed");
                Some(token)
            }
            None => {
                self.manual.cancel(device_id).await;
                warn!(tenant = %tenant, device_id = %device_id, "No push token; locate unavailable");
                None
            }
        }
    }

    /// Drops a pending locate callback. Returns false if none was pending.
    pub async fn cancel_location_request(&self, device_id: &str) -> bool {
        self.manual.cancel(device_id).await
    }

    /// Hands host-held credentials to a tenant. The tenant is not started.
    pub async fn import_credentials(&self, tenant: &TenantId, credentials: Credentials) -> PushResult<()> {
        let supervisor = self.supervisor(tenant).await?;
        supervisor.import_credentials(credentials).await
    }

    pub async fn credentials(&self, tenant: &TenantId) -> Option<Credentials> {
        let supervisor = self.supervisors.lock().await.get(tenant).cloned()?;
        supervisor.credentials().await
    }

    pub async fn tenant_status(&self, tenant: &TenantId) -> Option<TenantStatus> {
        self.supervisors.lock().await.get(tenant).map(|s| s.status())
    }

    /// Tenants with a supervisor.
    pub async fn tenants(&self) -> Vec<TenantId> {
        self.supervisors.lock().await.keys().cloned().collect()
    }

    /// Stops every tenant and flushes pending updates.
    pub async fn shutdown(&self) {
        let _membership = self.membership.lock().await;
        let supervisors: Vec<Arc<TenantSupervisor>> =
            std::mem::take(&mut *self.supervisors.lock().await).into_values().collect();

        let mut stops = JoinSet::new();
        for supervisor in supervisors {
            stops.spawn(async move { supervisor.stop().await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Supervisor stop task failed");
            }
        }

        self.router.shutdown().await;
        info!("Receiver shut down");
    }

    /// Returns the tenant's supervisor, creating it if needed.
    async fn supervisor(&self, tenant: &TenantId) -> PushResult<Arc<TenantSupervisor>> {
        let mut supervisors = self.supervisors.lock().await;
        if let Some(existing) = supervisors.get(tenant) {
            return Ok(Arc::clone(existing));
        }

        let supervisor = Arc::new(TenantSupervisor::new(
            tenant.clone(),
            Arc::clone(&self.config),
            self.store.clone(),
            Arc::clone(&self.routing),
            self.push_tx.clone(),
            Arc::clone(&self.dialer),
        )?);
        supervisors.insert(tenant.clone(), Arc::clone(&supervisor));
        debug!(tenant = %tenant, "Supervisor created");
        Ok(supervisor)
    }

    /// Picks the tenant that should answer a locate of `device_id`.
    ///
    /// A tenant listing the device as present wins, then one that merely
    /// knows it, then the first consumer's tenant, then any tenant.
    async fn owner_for(&self, device_id: &str) -> Option<TenantId> {
        let consumers = self.consumers.snapshot().await;

        let chosen = consumers
            .iter()
            .find(|c| c.device_present(device_id))
            .or_else(|| consumers.iter().find(|c| c.knows_device(device_id)))
            .or_else(|| consumers.first())
            .map(|c| c.tenant_id().clone());
        match chosen {
            Some(tenant) => Some(tenant),
            None => self.supervisors.lock().await.keys().next().cloned(),
        }
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Reference-counted access to one [`SharedReceiver`].
///
/// The receiver is built on the first [`acquire`](Self::acquire) and shut
/// down on the matching last [`release`](Self::release).
pub struct ReceiverLease {
    builder: ReceiverBuilder,
    slot: Mutex<Option<(Arc<SharedReceiver>, usize)>>,
}

impl ReceiverLease {
    pub fn new(builder: ReceiverBuilder) -> Self {
        ReceiverLease {
            builder,
            slot: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) -> PushResult<Arc<SharedReceiver>> {
        let mut slot = self.slot.lock().await;
        if let Some((receiver, count)) = slot.as_mut() {
            *count += 1;
            return Ok(Arc::clone(receiver));
        }

        let receiver = Arc::new(self.builder.build()?);
        *slot = Some((Arc::clone(&receiver), 1));
        info!("Shared receiver created");
        Ok(receiver)
    }

    /// Returns true if this release tore the receiver down.
    pub async fn release(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let Some((_, count)) = slot.as_mut() else {
            warn!("Release without a matching acquire");
            return false;
        };

        *count -= 1;
        if *count > 0 {
            return false;
        }
        if let Some((receiver, _)) = slot.take() {
            receiver.shutdown().await;
        }
        true
    }

    pub async fn ref_count(&self) -> usize {
        self.slot.lock().await.as_ref().map_or(0, |(_, count)| *count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{McsSettings, RegistrationSettings};
    use crate::testkit::{
        data_message, device_payload, fmdn_body, mount_registration_mocks, test_credentials, test_fcm_settings, ChannelDialer,
        FakeMcsServer, RecordingConsumer, StaticDecryptor,
    };
    use fmdn_core::LocationRecord;
    use fmdn_store::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;
    use wiremock::MockServer;

    const WAIT: Duration = Duration::from_secs(10);

    fn config(base_url: &str) -> PushConfig {
        PushConfig {
            mcs: McsSettings {
                client_heartbeat_secs: None,
                ..Default::default()
            },
            registration: RegistrationSettings::with_base_url(base_url),
            fcm: test_fcm_settings(),
            ..Default::default()
        }
    }

    fn builder(base_url: &str, dialer: Arc<ChannelDialer>) -> ReceiverBuilder {
        ReceiverBuilder::new(
            config(base_url),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticDecryptor::new()),
        )
        .dialer(dialer)
    }

    #[tokio::test]
    async fn test_lease_tears_down_on_last_release() {
        let lease = ReceiverLease::new(builder("http://127.0.0.1:9", ChannelDialer::failing()));

        let first = lease.acquire().await.unwrap();
        let second = lease.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(lease.ref_count().await, 2);

        assert!(!lease.release().await);
        assert_eq!(lease.ref_count().await, 1);
        assert!(lease.release().await);
        assert_eq!(lease.ref_count().await, 0);
        assert!(!lease.release().await);

        let third = lease.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        lease.release().await;
    }

    #[tokio::test]
    async fn test_locate_without_tenant_yields_no_token() {
        let receiver = builder("http://127.0.0.1:9", ChannelDialer::failing()).build().unwrap();
        let token = receiver
            .register_for_location_updates("dev-1", Box::new(|_, _| {}))
            .await;
        assert!(token.is_none());
        assert!(!receiver.manual.contains("dev-1").await);
    }

    #[tokio::test]
    async fn test_owner_prefers_present_then_known_device() {
        let receiver = builder("http://127.0.0.1:9", ChannelDialer::failing()).build().unwrap();
        let plain: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("a", &[]));
        let knows: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("b", &[]).knowing(&["dev-1"]));
        let present: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("c", &[]).present(&["dev-1"]));
        for consumer in [&plain, &knows, &present] {
            receiver.consumers.register(Arc::clone(consumer)).await;
        }

        assert_eq!(receiver.owner_for("dev-1").await, Some(TenantId::from("c")));
        receiver.consumers.unregister(&present).await;
        assert_eq!(receiver.owner_for("dev-1").await, Some(TenantId::from("b")));
        assert_eq!(receiver.owner_for("dev-9").await, Some(TenantId::from("a")));
    }

    #[tokio::test]
    async fn test_last_consumer_stops_tenant() {
        let receiver = builder("http://127.0.0.1:9", ChannelDialer::failing()).build().unwrap();
        let tenant = TenantId::from("alice");
        let first: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("alice", &["dev-1"]));
        let second: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("alice", &["dev-2"]));

        receiver.register_consumer(Arc::clone(&first)).await.unwrap();
        receiver.register_consumer(Arc::clone(&second)).await.unwrap();
        assert_eq!(receiver.tenants().await, vec![tenant.clone()]);

        assert!(receiver.unregister_consumer(&first).await);
        assert!(receiver.tenant_status(&tenant).await.is_some());
        assert!(receiver.unregister_consumer(&second).await);
        assert!(receiver.tenant_status(&tenant).await.is_none());
        assert!(!receiver.unregister_consumer(&second).await);

        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejoin_during_teardown_keeps_tenant_listening() {
        let receiver = builder("http://127.0.0.1:9", ChannelDialer::failing()).build().unwrap();
        let tenant = TenantId::from("alice");
        receiver.import_credentials(&tenant, test_credentials()).await.unwrap();
        let leaving: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("alice", &["dev-1"]));
        let joining: Arc<dyn Consumer> = Arc::new(RecordingConsumer::new("alice", &["dev-1"]));
        receiver.register_consumer(Arc::clone(&leaving)).await.unwrap();

        let (left, joined) = tokio::join!(
            receiver.unregister_consumer(&leaving),
            receiver.register_consumer(Arc::clone(&joining)),
        );
        assert!(left);
        joined.unwrap();

        let supervisor = receiver.supervisors.lock().await.get(&tenant).cloned().unwrap();
        assert!(supervisor.is_running().await);
        let token = test_credentials().fcm_token().unwrap().to_string();
        assert!(receiver.routing.lookup(&token).await.contains(&tenant));

        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_locate_registers_and_delivers_once() {
        let http = MockServer::start().await;
        mount_registration_mocks(&http, "fcm-token-1").await;
        let (dialer, mut accepts) = ChannelDialer::new();
        let receiver = builder(&http.uri(), dialer).build().unwrap();
        let tenant = TenantId::from("alice");

        let consumer = Arc::new(RecordingConsumer::new("alice", &["dev-1"]));
        receiver.register_consumer(consumer.clone()).await.unwrap();

        let (result_tx, mut results) = mpsc::unbounded_channel::<(String, LocationRecord)>();
        let token = receiver
            .register_for_location_updates(
                "dev-1",
                Box::new(move |device, record| {
                    let _ = result_tx.send((device, record));
                }),
            )
            .await
            .expect("push token");
        assert_eq!(token, "fcm-token-1");

        let mut mcs = timeout(WAIT, FakeMcsServer::accept(&mut accepts)).await.unwrap();
        mcs.accept_login().await;
        let keys = receiver.credentials(&tenant).await.unwrap().keys;
        let body = fmdn_body(&device_payload("dev-1", 7));
        mcs.send(data_message(&keys, "0:1", Some(&token), &body)).await;
        assert_eq!(timeout(WAIT, mcs.expect_ack()).await.unwrap(), vec!["0:1"]);

        let (device, record) = timeout(WAIT, results.recv()).await.unwrap().unwrap();
        assert_eq!(device, "dev-1");
        assert_eq!(record.accuracy, Some(7.0));
        assert!(timeout(WAIT, results.recv()).await.unwrap().is_none());
        assert!(!receiver.manual.contains("dev-1").await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(consumer.updates().is_empty());

        receiver.shutdown().await;
        assert_eq!(receiver.tenants().await, Vec::<TenantId>::new());
    }
}
