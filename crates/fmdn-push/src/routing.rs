//! # Routing Tables
//!
//! The state shared across tenants, one lock per table:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  TokenRoutingTable      push token ──► {tenant}                         │
//! │  ConsumerRegistry       [Arc<dyn Consumer>]                             │
//! │  ManualLocateRegistry   device id ──► (tenant, one-shot callback)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Route Precedence
//! ```text
//! 1. destination token found in TokenRoutingTable  ──► those tenants
//! 2. tenant whose connection delivered the push    ──► that tenant
//! 3. owner index knows the device                  ──► its owner
//! 4. broadcast (when enabled)                      ──► every consumer
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use fmdn_core::{LocationRecord, TenantId};
use tokio::sync::{Mutex, RwLock};

use crate::consumer::{Consumer, ManualLocateCallback};

// =============================================================================
// Token Routing Table
// =============================================================================

/// Maps push tokens to the tenants registered under them.
#[derive(Debug, Default)]
pub struct TokenRoutingTable {
    tokens: RwLock<HashMap<String, BTreeSet<TenantId>>>,
}

impl TokenRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, token: &str, tenant: &TenantId) {
        if token.is_empty() {
            return;
        }
        self.tokens
            .write()
            .await
            .entry(token.to_string())
            .or_default()
            .insert(tenant.clone());
    }

    pub async fn unbind(&self, token: &str, tenant: &TenantId) {
        let mut tokens = self.tokens.write().await;
        if let Some(tenants) = tokens.get_mut(token) {
            tenants.remove(tenant);
            if tenants.is_empty() {
                tokens.remove(token);
            }
        }
    }

    /// Removes every binding of a tenant.
    pub async fn unbind_tenant(&self, tenant: &TenantId) {
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, tenants| {
            tenants.remove(tenant);
            !tenants.is_empty()
        });
    }

    /// Tenants bound to `token`; empty if unknown.
    pub async fn lookup(&self, token: &str) -> BTreeSet<TenantId> {
        self.tokens.read().await.get(token).cloned().unwrap_or_default()
    }

    pub async fn tokens_for(&self, tenant: &TenantId) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .tokens
            .read()
            .await
            .iter()
            .filter(|(_, tenants)| tenants.contains(tenant))
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        tokens
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

// =============================================================================
// Route Resolution
// =============================================================================

/// Which rule produced a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Token,
    Origin,
    OwnerIndex,
    Broadcast,
}

impl std::fmt::Display for RouteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteSource::Token => write!(f, "token"),
            RouteSource::Origin => write!(f, "origin"),
            RouteSource::OwnerIndex => write!(f, "owner_index"),
            RouteSource::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Target tenants of one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source: RouteSource,
    /// Empty for [`RouteSource::Broadcast`].
    pub targets: BTreeSet<TenantId>,
}

impl Route {
    /// Returns true if consumers of `tenant` receive this push.
    pub fn includes(&self, tenant: &TenantId) -> bool {
        self.source == RouteSource::Broadcast || self.targets.contains(tenant)
    }

    /// Tenant half of the debounce key: the single target, if there is one.
    pub fn tenant_hint(&self) -> Option<TenantId> {
        if self.targets.len() == 1 {
            self.targets.iter().next().cloned()
        } else {
            None
        }
    }
}

/// Everything route resolution looks at.
#[derive(Debug, Clone, Default)]
pub struct RouteInputs {
    /// Tenants bound to the envelope's destination token.
    pub token_tenants: BTreeSet<TenantId>,
    /// Tenant whose connection delivered the push.
    pub origin: Option<TenantId>,
    /// Owner index answer for the device.
    pub owner: Option<TenantId>,
    pub broadcast_fallback: bool,
}

/// Applies the precedence rules. First match wins.
pub fn resolve_route(inputs: RouteInputs) -> Option<Route> {
    if !inputs.token_tenants.is_empty() {
        return Some(Route {
            source: RouteSource::Token,
            targets: inputs.token_tenants,
        });
    }
    if let Some(origin) = inputs.origin {
        return Some(Route {
            source: RouteSource::Origin,
            targets: BTreeSet::from([origin]),
        });
    }
    if let Some(owner) = inputs.owner {
        return Some(Route {
            source: RouteSource::OwnerIndex,
            targets: BTreeSet::from([owner]),
        });
    }
    inputs.broadcast_fallback.then(|| Route {
        source: RouteSource::Broadcast,
        targets: BTreeSet::new(),
    })
}

// =============================================================================
// Consumer Registry
// =============================================================================

/// The fan-out list.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: RwLock<Vec<Arc<dyn Consumer>>>,
}

fn same_consumer(a: &Arc<dyn Consumer>, b: &Arc<dyn Consumer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer. Returns false if it was already registered.
    pub async fn register(&self, consumer: Arc<dyn Consumer>) -> bool {
        let mut consumers = self.consumers.write().await;
        if consumers.iter().any(|existing| same_consumer(existing, &consumer)) {
            return false;
        }
        consumers.push(consumer);
        true
    }

    /// Removes a consumer. Returns false if it was not registered.
    pub async fn unregister(&self, consumer: &Arc<dyn Consumer>) -> bool {
        let mut consumers = self.consumers.write().await;
        let before = consumers.len();
        consumers.retain(|existing| !same_consumer(existing, consumer));
        consumers.len() != before
    }

    /// Copy of the list, so hooks run without the lock held.
    pub async fn snapshot(&self) -> Vec<Arc<dyn Consumer>> {
        self.consumers.read().await.clone()
    }

    pub async fn has_tenant(&self, tenant: &TenantId) -> bool {
        self.consumers.read().await.iter().any(|c| c.tenant_id() == tenant)
    }

    pub async fn tenants(&self) -> BTreeSet<TenantId> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|c| c.tenant_id().clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }
}

// =============================================================================
// Manual Locate Registry
// =============================================================================

struct ManualLocateRequest {
    tenant: TenantId,
    callback: ManualLocateCallback,
}

/// Pending request-correlated locates, keyed by device id.
#[derive(Default)]
pub struct ManualLocateRegistry {
    requests: Mutex<HashMap<String, ManualLocateRequest>>,
}

impl ManualLocateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a callback, replacing any earlier one for the device.
    pub async fn register(&self, device_id: &str, tenant: TenantId, callback: ManualLocateCallback) {
        self.requests
            .lock()
            .await
            .insert(device_id.to_string(), ManualLocateRequest { tenant, callback });
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.requests.lock().await.contains_key(device_id)
    }

    /// Tenant the request was made under.
    pub async fn tenant_for(&self, device_id: &str) -> Option<TenantId> {
        self.requests.lock().await.get(device_id).map(|r| r.tenant.clone())
    }

    /// Removes and returns the callback.
    pub async fn take(&self, device_id: &str) -> Option<ManualLocateCallback> {
        self.requests.lock().await.remove(device_id).map(|r| r.callback)
    }

    /// Drops a pending request. Returns false if none existed.
    pub async fn cancel(&self, device_id: &str) -> bool {
        self.requests.lock().await.remove(device_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.lock().await.is_empty()
    }
}

/// Delivers a decoded record to a taken callback.
pub(crate) fn fulfill(callback: ManualLocateCallback, device_id: &str, record: LocationRecord) {
    callback(device_id.to_string(), record);
}
