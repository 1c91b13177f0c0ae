//! # Tenant Supervisor
//!
//! Keeps one live MCS connection per tenant, forever, until told to stop.
//!
//! ## Round Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────────────┐  credentials   ┌──────────────┐  login ok            │
//! │   │ Registering  │───────────────►│  Connecting  │──────────┐           │
//! │   └──────▲───────┘                └──────┬───────┘          ▼           │
//! │          │                               │ failed     ┌───────────┐     │
//! │          │                               ▼            │ Connected │     │
//! │          │   sleep (1s → 60s, +0-10%) ┌─────────┐     │ poll 1s   │     │
//! │          └────────────────────────────│ Backoff │◄────┴───────────┘     │
//! │                                       └─────────┘  connection ended     │
//! │                                                    (backoff reset)      │
//! │                                                                         │
//! │   stop signal: honored during every wait; bounded by stop_timeout       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A rejected registration reports `AuthFailed` and keeps retrying on the
//! capped schedule. A rejected login forces full re-registration on the next
//! round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fmdn_core::{Credentials, InboundPush, TenantId};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::PushConfig;
use crate::error::{PushError, PushResult};
use crate::mcs::{Dialer, McsConnection, PersistentIdSet};
use crate::registration::RegistrationClient;
use crate::retry::RetryPolicy;
use crate::routing::TokenRoutingTable;
use crate::store::TenantStore;

/// Tokens kept routable after a re-registration replaced them.
const TOKEN_HISTORY: usize = 4;

/// Observable condition of one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TenantStatus {
    #[default]
    Idle,
    Registering,
    Connecting,
    Connected,
    /// Sleeping this long before the next round.
    Backoff(Duration),
    /// Registration was rejected; the user likely has to sign in again.
    AuthFailed,
    Stopped,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantStatus::Idle => write!(f, "idle"),
            TenantStatus::Registering => write!(f, "registering"),
            TenantStatus::Connecting => write!(f, "connecting"),
            TenantStatus::Connected => write!(f, "connected"),
            TenantStatus::Backoff(delay) => write!(f, "backoff ({:?})", delay),
            TenantStatus::AuthFailed => write!(f, "auth_failed"),
            TenantStatus::Stopped => write!(f, "stopped"),
        }
    }
}

enum RoundOutcome {
    /// A connection was up and has ended.
    Ended,
    Failed,
    Stopped,
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the credentials, registration and connection of one tenant.
pub struct TenantSupervisor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    tenant: TenantId,
    config: Arc<PushConfig>,
    store: TenantStore,
    routing: Arc<TokenRoutingTable>,
    push_tx: mpsc::Sender<InboundPush>,
    dialer: Arc<dyn Dialer>,
    registration: RegistrationClient,
    credentials: RwLock<Option<Credentials>>,
    /// Set once check-in (or the host) vouched for `credentials`.
    validated: AtomicBool,
    force_register: AtomicBool,
    register_lock: Mutex<()>,
    /// Push tokens bound for this tenant, newest first.
    tokens: Mutex<Vec<String>>,
    client: Mutex<Option<Arc<McsConnection>>>,
    persistent_ids: Arc<StdMutex<PersistentIdSet>>,
    loaded: AtomicBool,
    status: watch::Sender<TenantStatus>,
    stop: watch::Sender<bool>,
}

impl TenantSupervisor {
    pub fn new(
        tenant: TenantId,
        config: Arc<PushConfig>,
        store: TenantStore,
        routing: Arc<TokenRoutingTable>,
        push_tx: mpsc::Sender<InboundPush>,
        dialer: Arc<dyn Dialer>,
    ) -> PushResult<Self> {
        let registration = RegistrationClient::new(config.registration.clone(), config.fcm.clone())?;
        let (status, _) = watch::channel(TenantStatus::Idle);
        let (stop, _) = watch::channel(false);

        Ok(TenantSupervisor {
            shared: Arc::new(Shared {
                tenant,
                config,
                store,
                routing,
                push_tx,
                dialer,
                registration,
                credentials: RwLock::new(None),
                validated: AtomicBool::new(false),
                force_register: AtomicBool::new(false),
                register_lock: Mutex::new(()),
                tokens: Mutex::new(Vec::new()),
                client: Mutex::new(None),
                persistent_ids: Arc::new(StdMutex::new(PersistentIdSet::new())),
                loaded: AtomicBool::new(false),
                status,
                stop,
            }),
            task: Mutex::new(None),
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.shared.tenant
    }

    /// Starts the supervision loop. Idempotent.
    ///
    /// The first start restores persisted credentials and routing tokens.
    pub async fn start(&self) -> PushResult<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        self.shared.load_persisted().await?;
        self.shared.stop.send_replace(false);
        let stop_rx = self.shared.stop.subscribe();
        *task = Some(tokio::spawn(run(Arc::clone(&self.shared), stop_rx)));
        info!(tenant = %self.shared.tenant, "Supervisor started");
        Ok(())
    }

    /// Stops the loop and the connection.
    ///
    /// Each wait is bounded by the stop timeout; past it the task is aborted
    /// and the connection detached.
    pub async fn stop(&self) {
        let shared = &self.shared;
        let stop_timeout = shared.config.supervisor.stop_timeout();
        shared.stop.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(stop_timeout, &mut handle).await.is_err() {
                warn!(tenant = %shared.tenant, "Supervisor did not stop in time; aborting");
                handle.abort();
            }
        }

        let client = match timeout(stop_timeout, shared.client.lock()).await {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                warn!(tenant = %shared.tenant, "Connection slot busy; detaching");
                None
            }
        };
        if let Some(connection) = client {
            if timeout(stop_timeout, connection.stop()).await.is_err() {
                warn!(tenant = %shared.tenant, "Connection did not stop in time; detaching");
            }
        }

        shared.set_status(TenantStatus::Stopped);
        info!(tenant = %shared.tenant, "Supervisor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns a push token, registering if needed.
    ///
    /// Without `force`, a usable stored token is returned without network
    /// calls. With `force`, the tenant registers from scratch. `None` means
    /// no token can be had right now.
    pub async fn ensure_token(&self, force: bool) -> Option<String> {
        let shared = &self.shared;
        if !force {
            if let Some(token) = shared.current_token().await {
                return Some(token);
            }
        }
        match shared.ensure_credentials(force).await {
            Ok(credentials) => credentials.fcm_token().map(str::to_string),
            Err(e) => {
                warn!(tenant = %shared.tenant, error = %e, force, "No push token available");
                if e.is_auth_failure() {
                    shared.set_status(TenantStatus::AuthFailed);
                }
                None
            }
        }
    }

    /// Adopts credentials supplied by the host.
    pub async fn import_credentials(&self, credentials: Credentials) -> PushResult<()> {
        if !credentials.has_gcm_identity() {
            return Err(PushError::KeyMaterial("imported credentials lack android_id/security_token".into()));
        }
        let shared = &self.shared;
        let _guard = shared.register_lock.lock().await;
        shared.adopt(credentials).await;
        shared.validated.store(true, Ordering::SeqCst);
        info!(tenant = %shared.tenant, "Credentials imported");
        Ok(())
    }

    /// Current credentials snapshot.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.shared.credentials.read().await.clone()
    }

    /// Binds the tenant's known tokens into the routing table again.
    pub async fn publish_tokens(&self) {
        let tokens = self.shared.tokens.lock().await.clone();
        for token in tokens {
            self.shared.routing.bind(&token, &self.shared.tenant).await;
        }
    }

    pub fn status(&self) -> TenantStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TenantStatus> {
        self.shared.status.subscribe()
    }
}

// =============================================================================
// Supervision Loop
// =============================================================================

async fn run(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let mut backoff = RetryPolicy::supervisor(&shared.config.supervisor).backoff();
    let mut round_stop = stop_rx.clone();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let outcome = tokio::select! {
            outcome = shared.run_round(&mut round_stop) => outcome,
            _ = stop_requested(&mut stop_rx) => break,
        };
        match outcome {
            RoundOutcome::Stopped => break,
            RoundOutcome::Ended => backoff.reset(),
            RoundOutcome::Failed => {}
        }

        let delay = backoff.next_delay();
        if shared.status() != TenantStatus::AuthFailed {
            shared.set_status(TenantStatus::Backoff(delay));
        }
        debug!(tenant = %shared.tenant, ?delay, "Next round after backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut stop_rx) => break,
        }
    }

    shared.set_status(TenantStatus::Stopped);
}

impl Shared {
    fn status(&self) -> TenantStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: TenantStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(tenant = %self.tenant, from = %previous, to = %status, "Tenant status");
        }
    }

    async fn run_round(&self, stop: &mut watch::Receiver<bool>) -> RoundOutcome {
        self.set_status(TenantStatus::Registering);
        let force = self.force_register.swap(false, Ordering::SeqCst);
        let credentials = match self.ensure_credentials(force).await {
            Ok(credentials) => credentials,
            Err(e) if e.is_auth_failure() => {
                error!(tenant = %self.tenant, error = %e, "Registration rejected");
                self.set_status(TenantStatus::AuthFailed);
                return RoundOutcome::Failed;
            }
            Err(e) => {
                warn!(tenant = %self.tenant, error = %e, "Registration failed");
                return RoundOutcome::Failed;
            }
        };

        self.set_status(TenantStatus::Connecting);
        let connection = {
            let mut slot = self.client.lock().await;
            if let Some(previous) = slot.take() {
                previous.stop().await;
            }
            let built = McsConnection::new(
                self.tenant.clone(),
                self.config.mcs.clone(),
                &credentials,
                Arc::clone(&self.dialer),
                Arc::clone(&self.persistent_ids),
                self.push_tx.clone(),
            );
            match built {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    *slot = Some(Arc::clone(&connection));
                    connection
                }
                Err(e) => {
                    warn!(tenant = %self.tenant, error = %e, "Credentials unusable for login");
                    self.force_register.store(true, Ordering::SeqCst);
                    return RoundOutcome::Failed;
                }
            }
        };

        if let Err(e) = connection.start().await {
            warn!(tenant = %self.tenant, error = %e, "Connection did not start");
            if connection.login_rejected() {
                info!(tenant = %self.tenant, "Login rejected; registering again next round");
                self.force_register.store(true, Ordering::SeqCst);
            }
            self.release_client(&connection).await;
            return RoundOutcome::Failed;
        }

        self.set_status(TenantStatus::Connected);
        info!(tenant = %self.tenant, "Listening for pushes");

        let poll = self.config.supervisor.poll_interval();
        let outcome = loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {
                    if !connection.is_running() {
                        info!(tenant = %self.tenant, "Connection ended; restarting");
                        break RoundOutcome::Ended;
                    }
                }
                _ = stop_requested(stop) => break RoundOutcome::Stopped,
            }
        };

        connection.stop().await;
        self.release_client(&connection).await;
        outcome
    }

    async fn release_client(&self, connection: &Arc<McsConnection>) {
        let mut slot = self.client.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, connection)) {
            slot.take();
        }
    }

    async fn current_token(&self) -> Option<String> {
        self.credentials
            .read()
            .await
            .as_ref()
            .filter(|credentials| credentials.is_usable())
            .and_then(|credentials| credentials.fcm_token())
            .map(str::to_string)
    }

    async fn load_persisted(&self) -> PushResult<()> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tokens = self.store.load_routing_tokens(&self.tenant).await?;
        for token in &tokens {
            self.routing.bind(token, &self.tenant).await;
        }
        *self.tokens.lock().await = tokens;

        let mut credentials = self.credentials.write().await;
        if credentials.is_none() {
            *credentials = self.store.load_credentials(&self.tenant).await?;
            if credentials.is_some() {
                debug!(tenant = %self.tenant, "Restored stored credentials");
            }
        }
        let token = credentials.as_ref().and_then(|c| c.fcm_token()).map(str::to_string);
        drop(credentials);

        if let Some(token) = token {
            self.remember_token(&token).await;
        }
        Ok(())
    }

    /// Returns validated credentials, registering under the register lock
    /// when there are none, they were never validated, or `force` is set.
    async fn ensure_credentials(&self, force: bool) -> PushResult<Credentials> {
        let _guard = self.register_lock.lock().await;

        let current = self.credentials.read().await.clone();
        if !force && self.validated.load(Ordering::SeqCst) {
            if let Some(credentials) = current.as_ref().filter(|c| c.is_usable()) {
                return Ok(credentials.clone());
            }
        }

        let existing = if force { None } else { current.as_ref() };
        let fresh = self.registration.check_in_and_register(existing).await?;
        self.validated.store(true, Ordering::SeqCst);
        self.adopt(fresh.clone()).await;
        Ok(fresh)
    }

    /// Installs new credentials: persist, publish the token, and drop a
    /// connection still logged in under a different identity.
    async fn adopt(&self, credentials: Credentials) {
        let previous = self.credentials.read().await.clone();
        if previous.as_ref() == Some(&credentials) {
            return;
        }

        if let Err(e) = self.store.save_credentials(&self.tenant, &credentials).await {
            warn!(tenant = %self.tenant, error = %e, "Failed to persist credentials");
        }
        let token = credentials.fcm_token().map(str::to_string);
        let identity_changed = previous
            .as_ref()
            .is_some_and(|p| p.gcm.android_id != credentials.gcm.android_id);
        *self.credentials.write().await = Some(credentials);

        if let Some(token) = token {
            self.remember_token(&token).await;
        }

        if identity_changed {
            let client = self.client.lock().await.clone();
            if let Some(connection) = client {
                info!(tenant = %self.tenant, "Identity changed; dropping current connection");
                connection.stop().await;
            }
        }
    }

    /// Binds `token` and keeps a short history of earlier tokens routable.
    async fn remember_token(&self, token: &str) {
        self.routing.bind(token, &self.tenant).await;

        let mut tokens = self.tokens.lock().await;
        if tokens.first().map(String::as_str) == Some(token) {
            return;
        }
        tokens.retain(|existing| existing != token);
        tokens.insert(0, token.to_string());
        let evicted = if tokens.len() > TOKEN_HISTORY {
            tokens.split_off(TOKEN_HISTORY)
        } else {
            Vec::new()
        };
        for old in &evicted {
            self.routing.unbind(old, &self.tenant).await;
        }

        if let Err(e) = self.store.save_routing_tokens(&self.tenant, &tokens).await {
            warn!(tenant = %self.tenant, error = %e, "Failed to persist routing tokens");
        }
    }
}
