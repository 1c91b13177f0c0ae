//! # Push Router
//!
//! Turns decrypted envelopes from every tenant's connection into consumer
//! updates.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  mpsc<InboundPush> ──► router task                                      │
//! │                            │                                            │
//! │                            ▼                                            │
//! │                  FMDN payload + canonic device id                       │
//! │                            │                                            │
//! │         ┌──────────────────┴────────────────────┐                       │
//! │         │ manual locate pending for device?     │                       │
//! │         ▼ yes                                   ▼ no                    │
//! │   decrypt ──► callback (once)          resolve route                    │
//! │   (no debounce, no fan-out)                     │                       │
//! │                                                 ▼                       │
//! │                           pending[(tenant hint, device)] = latest       │
//! │                           restart 250ms timer                           │
//! │                                                 │ fires                 │
//! │                                                 ▼                       │
//! │                           consumers in route, tracking, not ignoring    │
//! │                           decrypt once per tenant ──► update_cache      │
//! │                                                       request_refresh   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fmdn_core::payload::{canonic_device_id, fmdn_payload};
use fmdn_core::{InboundPush, LocationRecord, TenantId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouterSettings;
use crate::consumer::{LocationDecryptor, OwnerIndex};
use crate::routing::{
    fulfill, resolve_route, ConsumerRegistry, ManualLocateRegistry, Route, RouteInputs, RouteSource,
    TokenRoutingTable,
};

/// Debounce key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub tenant_hint: Option<TenantId>,
    pub device_id: String,
}

struct PendingUpdate {
    payload: Vec<u8>,
    route: Route,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Collaborators the router reads from.
#[derive(Clone)]
pub struct RouterParts {
    pub routing: Arc<TokenRoutingTable>,
    pub consumers: Arc<ConsumerRegistry>,
    pub manual: Arc<ManualLocateRegistry>,
    pub decryptor: Arc<dyn LocationDecryptor>,
    pub owner_index: Option<Arc<dyn OwnerIndex>>,
}

// =============================================================================
// Router
// =============================================================================

/// Handle to the routing task.
pub struct Router {
    inner: Arc<RouterInner>,
    intake: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct RouterInner {
    settings: RouterSettings,
    parts: RouterParts,
    pending: Mutex<HashMap<PendingKey, PendingUpdate>>,
    generation: AtomicU64,
}

impl Router {
    /// Spawns the routing task. Returns the router and the sender connections
    /// hand their pushes to.
    pub fn spawn(settings: RouterSettings, parts: RouterParts) -> (Router, mpsc::Sender<InboundPush>) {
        let (tx, mut rx) = mpsc::channel(settings.channel_capacity.max(1));
        let inner = Arc::new(RouterInner {
            settings,
            parts,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        });

        let task_inner = Arc::clone(&inner);
        let intake = tokio::spawn(async move {
            while let Some(push) = rx.recv().await {
                task_inner.handle(push).await;
            }
            debug!("Router intake closed");
        });

        (
            Router {
                inner,
                intake: std::sync::Mutex::new(Some(intake)),
            },
            tx,
        )
    }

    /// Routes one push as the task would.
    pub async fn handle_push(&self, push: InboundPush) {
        self.inner.handle(push).await;
    }

    /// Delivers every pending update now.
    pub async fn flush(&self) {
        let drained: Vec<(PendingKey, PendingUpdate)> = self.inner.pending.lock().await.drain().collect();
        for (key, update) in drained {
            update.timer.abort();
            self.inner.deliver(&key.device_id, &update.payload, &update.route).await;
        }
    }

    /// Stops intake and flushes what is pending.
    pub async fn shutdown(&self) {
        let intake = self
            .intake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = intake {
            handle.abort();
        }
        self.flush().await;
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Some(handle) = self
            .intake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl RouterInner {
    async fn handle(self: &Arc<Self>, push: InboundPush) {
        let InboundPush { origin, envelope } = push;

        let payload = match fmdn_payload(&envelope.data) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(tenant = ?origin, persistent_id = %envelope.persistent_id, error = %e, "Push carries no location payload");
                return;
            }
        };
        let device_id = match canonic_device_id(&payload) {
            Ok(device_id) => device_id,
            Err(e) => {
                warn!(tenant = ?origin, error = %e, "Location payload without device id");
                return;
            }
        };

        if let Some(tenant) = self.parts.manual.tenant_for(&device_id).await {
            self.fulfill_manual(&device_id, &payload, &tenant).await;
            return;
        }

        let token_tenants = match envelope.destination_token.as_deref() {
            Some(token) => self.parts.routing.lookup(token).await,
            None => Default::default(),
        };
        // The owner index is only asked about pushes with no delivering tenant.
        let owner = if token_tenants.is_empty() && origin.is_none() {
            self.parts
                .owner_index
                .as_ref()
                .and_then(|index| index.owner_of(&device_id))
        } else {
            None
        };

        let inputs = RouteInputs {
            token_tenants,
            origin: origin.clone(),
            owner,
            broadcast_fallback: self.settings.broadcast_fallback,
        };
        let Some(route) = resolve_route(inputs) else {
            info!(%device_id, "No tenant resolved for push; dropping");
            return;
        };

        if route.source == RouteSource::Broadcast {
            warn!(%device_id, "Push has no resolved tenant; broadcasting to all consumers");
        } else {
            debug!(%device_id, source = %route.source, targets = ?route.targets, "Push routed");
        }

        let key = PendingKey {
            tenant_hint: route.tenant_hint(),
            device_id,
        };
        self.schedule(key, payload, route).await;
    }

    async fn fulfill_manual(&self, device_id: &str, payload: &[u8], tenant: &TenantId) {
        match self.parts.decryptor.decrypt(payload, tenant).await {
            Ok(record) => match self.parts.manual.take(device_id).await {
                Some(callback) => {
                    info!(tenant = %tenant, %device_id, "Manual locate fulfilled");
                    fulfill(callback, device_id, record);
                }
                None => debug!(%device_id, "Manual locate was cancelled meanwhile"),
            },
            Err(e) => warn!(tenant = %tenant, %device_id, error = %e, "Manual locate decrypt failed; request kept"),
        }
    }

    /// Replaces the pending update for `key` and restarts its timer.
    async fn schedule(self: &Arc<Self>, key: PendingKey, payload: Vec<u8>, route: Route) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut pending = self.pending.lock().await;

        if let Some(previous) = pending.remove(&key) {
            previous.timer.abort();
            debug!(device_id = %key.device_id, "Superseded pending update");
        }

        let inner = Arc::clone(self);
        let timer_key = key.clone();
        let delay = self.settings.debounce();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(timer_key, generation).await;
        });

        pending.insert(
            key,
            PendingUpdate {
                payload,
                route,
                generation,
                timer,
            },
        );
    }

    async fn fire(&self, key: PendingKey, generation: u64) {
        let update = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(update) if update.generation == generation => pending.remove(&key),
                _ => None,
            }
        };
        if let Some(update) = update {
            self.deliver(&key.device_id, &update.payload, &update.route).await;
        }
    }

    async fn deliver(&self, device_id: &str, payload: &[u8], route: &Route) {
        let consumers: Vec<_> = self
            .parts
            .consumers
            .snapshot()
            .await
            .into_iter()
            .filter(|c| route.includes(c.tenant_id()) && c.is_tracked(device_id) && !c.is_ignored(device_id))
            .collect();
        if consumers.is_empty() {
            debug!(%device_id, "No consumer tracks device; update dropped");
            return;
        }

        let mut records: HashMap<TenantId, Option<LocationRecord>> = HashMap::new();
        for consumer in consumers {
            let tenant = consumer.tenant_id().clone();
            if !records.contains_key(&tenant) {
                let record = match self.parts.decryptor.decrypt(payload, &tenant).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(tenant = %tenant, %device_id, error = %e, "Location decrypt failed");
                        None
                    }
                };
                records.insert(tenant.clone(), record);
            }
            let Some(record) = records.get(&tenant).and_then(Option::as_ref) else {
                continue;
            };

            match consumer.update_cache(device_id, record) {
                Ok(()) => consumer.request_refresh(),
                Err(e) => warn!(tenant = %tenant, %device_id, error = %e, "Consumer rejected update"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use crate::testkit::{push_for, unattributed_push, RecordingConsumer, StaticDecryptor};
    use std::time::Duration;
    use tokio::time::Instant;

    struct FixedOwner(&'static str);

    impl OwnerIndex for FixedOwner {
        fn owner_of(&self, _device_id: &str) -> Option<TenantId> {
            Some(TenantId::from(self.0))
        }
    }

    struct Fixture {
        router: Router,
        parts: RouterParts,
        decryptor: Arc<StaticDecryptor>,
    }

    fn fixture(broadcast_fallback: bool) -> Fixture {
        let decryptor = Arc::new(StaticDecryptor::new());
        let parts = RouterParts {
            routing: Arc::new(TokenRoutingTable::new()),
            consumers: Arc::new(ConsumerRegistry::new()),
            manual: Arc::new(ManualLocateRegistry::new()),
            decryptor: decryptor.clone(),
            owner_index: None,
        };
        let settings = RouterSettings {
            broadcast_fallback,
            ..Default::default()
        };
        let (router, _tx) = Router::spawn(settings, parts.clone());
        Fixture {
            router,
            parts,
            decryptor,
        }
    }

    async fn add(fixture: &Fixture, consumer: &Arc<RecordingConsumer>) {
        let consumer: Arc<dyn Consumer> = consumer.clone();
        fixture.parts.consumers.register(consumer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_delivers_only_latest() {
        let fixture = fixture(true);
        let consumer = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&fixture, &consumer).await;

        let start = Instant::now();
        fixture.router.handle_push(push_for("a", None, "dev-1", 1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.router.handle_push(push_for("a", None, "dev-1", 2)).await;

        tokio::time::sleep(Duration::from_millis(240)).await;
        assert!(consumer.updates().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let updates = consumer.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "dev-1");
        assert_eq!(updates[0].1.accuracy, Some(2.0));
        assert!(consumer.delivered_at()[0] - start >= Duration::from_millis(350));
        assert_eq!(consumer.refreshes(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(consumer.updates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let fixture = fixture(true);
        let consumer = Arc::new(RecordingConsumer::new("a", &["dev-1", "dev-2"]));
        add(&fixture, &consumer).await;

        fixture.router.handle_push(push_for("a", None, "dev-1", 1)).await;
        fixture.router.handle_push(push_for("a", None, "dev-2", 2)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut devices: Vec<String> = consumer.updates().into_iter().map(|(d, _)| d).collect();
        devices.sort();
        assert_eq!(devices, vec!["dev-1", "dev-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_route_beats_delivering_tenant() {
        let fixture = fixture(true);
        let a = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        let b = Arc::new(RecordingConsumer::new("b", &["dev-1"]));
        add(&fixture, &a).await;
        add(&fixture, &b).await;
        fixture.parts.routing.bind("token-a", &TenantId::from("a")).await;

        fixture
            .router
            .handle_push(push_for("b", Some("token-a"), "dev-1", 7))
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(a.updates().len(), 1);
        assert!(b.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_locate_bypasses_fan_out() {
        let fixture = fixture(true);
        let consumer = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&fixture, &consumer).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        fixture
            .parts
            .manual
            .register(
                "dev-1",
                TenantId::from("a"),
                Box::new(move |device, record| {
                    let _ = tx.send((device, record));
                }),
            )
            .await;

        fixture.router.handle_push(push_for("a", None, "dev-1", 5)).await;
        let (device, record) = rx.recv().await.unwrap();
        assert_eq!(device, "dev-1");
        assert_eq!(record.accuracy, Some(5.0));
        assert!(!fixture.parts.manual.contains("dev-1").await);
        assert_eq!(fixture.router.pending_len().await, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(consumer.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_locate_kept_when_decrypt_fails() {
        let fixture = fixture(true);
        fixture.decryptor.fail_for("a");
        fixture
            .parts
            .manual
            .register("dev-1", TenantId::from("a"), Box::new(|_, _| panic!("must not be called")))
            .await;

        fixture.router.handle_push(push_for("a", None, "dev-1", 5)).await;
        assert!(fixture.parts.manual.contains("dev-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_and_ignored_devices_are_dropped() {
        let fixture = fixture(true);
        let untracked = Arc::new(RecordingConsumer::new("a", &["dev-2"]));
        let ignoring = Arc::new(RecordingConsumer::new("a", &["dev-1"]).ignoring(&["dev-1"]));
        add(&fixture, &untracked).await;
        add(&fixture, &ignoring).await;

        fixture.router.handle_push(push_for("a", None, "dev-1", 1)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(untracked.updates().is_empty());
        assert!(ignoring.updates().is_empty());
        assert_eq!(fixture.decryptor.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivering_tenant_keeps_its_push() {
        let fixture = fixture(true);
        let a = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&fixture, &a).await;

        // b has no consumers; its push must not reach a
        fixture.router.handle_push(push_for("b", None, "dev-1", 9)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(a.updates().is_empty());
        assert_eq!(fixture.decryptor.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattributed_push_uses_owner_index() {
        let mut fixture = fixture(true);
        fixture.parts.owner_index = Some(Arc::new(FixedOwner("b")) as Arc<dyn OwnerIndex>);
        let (router, _tx) = Router::spawn(
            RouterSettings {
                broadcast_fallback: true,
                ..Default::default()
            },
            fixture.parts.clone(),
        );
        let a = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        let b = Arc::new(RecordingConsumer::new("b", &["dev-1"]));
        add(&fixture, &a).await;
        add(&fixture, &b).await;

        router.handle_push(unattributed_push(None, "dev-1", 4)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(b.updates().len(), 1);
        assert!(a.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_fallback_policy() {
        let open = fixture(true);
        let consumer = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&open, &consumer).await;
        open.router.handle_push(unattributed_push(None, "dev-1", 1)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(consumer.updates().len(), 1);

        let closed = fixture(false);
        let consumer = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&closed, &consumer).await;
        closed.router.handle_push(unattributed_push(None, "dev-1", 1)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(consumer.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrypt_once_per_tenant() {
        let fixture = fixture(true);
        let first = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        let second = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&fixture, &first).await;
        add(&fixture, &second).await;

        fixture.router.handle_push(push_for("a", None, "dev-1", 3)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(first.updates().len(), 1);
        assert_eq!(second.updates().len(), 1);
        assert_eq!(fixture.decryptor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_pending_immediately() {
        let fixture = fixture(true);
        let consumer = Arc::new(RecordingConsumer::new("a", &["dev-1"]));
        add(&fixture, &consumer).await;

        fixture.router.handle_push(push_for("a", None, "dev-1", 4)).await;
        assert_eq!(fixture.router.pending_len().await, 1);

        fixture.router.shutdown().await;
        assert_eq!(consumer.updates().len(), 1);
        assert_eq!(fixture.router.pending_len().await, 0);
    }
}
