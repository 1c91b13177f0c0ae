//! # MCS Connection
//!
//! Protocol state machine of one session with the push server.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         McsConnection                                   │
//! │                                                                         │
//! │  start()                                                                │
//! │    dial (retry, 0.5s → 60s) ─► send LoginRequest ─► wait for Started    │
//! │                                                                         │
//! │  ┌──────────────────────┐        ┌──────────────────────┐               │
//! │  │    Receive Task      │        │   Heartbeat Task     │               │
//! │  │  read frame          │        │  every client        │               │
//! │  │   (idle timeout)     │        │  heartbeat interval: │               │
//! │  │  dispatch in order   │        │  HeartbeatPing       │               │
//! │  └──────────┬───────────┘        └──────────────────────┘               │
//! │             │ DataMessageStanza                                         │
//! │             ▼                                                           │
//! │   decrypt ─► mpsc::Sender<InboundPush> ─► append id ─► selective ack    │
//! │                                                                         │
//! │  Any terminal condition ─► terminate() ─► Stopped (never reconnects)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fmdn_core::message::{heartbeat_ack, heartbeat_ping, login_request, selective_ack, selective_ack_ids};
use fmdn_core::proto::{DataMessageStanza, LoginResponse};
use fmdn_core::{Credentials, InboundPush, McsMessage, PushEnvelope, TenantId};
use serde_json::Value;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::transport::{BoxedStream, Dialer, FrameReader, FrameWriter};
use super::{ErrorCategory, PersistentIdSet, RunState, SequentialErrorCounters};
use crate::config::McsSettings;
use crate::error::{PushError, PushResult};
use crate::retry::RetryPolicy;
use crate::webpush::WebPushDecryptor;

type Writer = FrameWriter<WriteHalf<BoxedStream>>;
type Reader = FrameReader<ReadHalf<BoxedStream>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of dispatching one message.
enum Flow {
    Continue,
    Stop(String),
}

// =============================================================================
// McsConnection
// =============================================================================

/// One MCS session. Build it, `start()` it, and discard it once stopped.
pub struct McsConnection {
    inner: Arc<Inner>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    tenant: TenantId,
    settings: McsSettings,
    android_id: u64,
    security_token: u64,
    decryptor: WebPushDecryptor,
    dialer: Arc<dyn Dialer>,
    push_tx: mpsc::Sender<InboundPush>,
    persistent_ids: Arc<Mutex<PersistentIdSet>>,
    counters: Mutex<SequentialErrorCounters>,
    state_tx: watch::Sender<RunState>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    /// Frames received on this stream.
    stream_id: AtomicI32,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    stopped: tokio::sync::Mutex<bool>,
    login_rejection: Mutex<Option<String>>,
}

impl McsConnection {
    /// Creates a connection for a tenant.
    ///
    /// `persistent_ids` is shared with the tenant's previous and next
    /// connections so unacknowledged-at-login ids survive a restart.
    pub fn new(
        tenant: TenantId,
        settings: McsSettings,
        credentials: &Credentials,
        dialer: Arc<dyn Dialer>,
        persistent_ids: Arc<Mutex<PersistentIdSet>>,
        push_tx: mpsc::Sender<InboundPush>,
    ) -> PushResult<Self> {
        let android_id = credentials
            .gcm
            .android_id()
            .map_err(|e| PushError::KeyMaterial(e.to_string()))?;
        let security_token = credentials
            .gcm
            .security_token()
            .map_err(|e| PushError::KeyMaterial(e.to_string()))?;
        let decryptor = WebPushDecryptor::from_keys(&credentials.keys)?;
        let (state_tx, _) = watch::channel(RunState::Created);
        let threshold = settings.sequential_error_threshold;

        Ok(McsConnection {
            inner: Arc::new(Inner {
                tenant,
                settings,
                android_id,
                security_token,
                decryptor,
                dialer,
                push_tx,
                persistent_ids,
                counters: Mutex::new(SequentialErrorCounters::new(threshold)),
                state_tx,
                writer: tokio::sync::Mutex::new(None),
                stream_id: AtomicI32::new(0),
                heartbeat_task: Mutex::new(None),
                stopped: tokio::sync::Mutex::new(false),
                login_rejection: Mutex::new(None),
            }),
            receive_task: Mutex::new(None),
        })
    }

    /// Connects, logs in, and starts the receive and heartbeat tasks.
    ///
    /// Returns once the server accepted the login. On error the connection
    /// is already `Stopped`.
    pub async fn start(&self) -> PushResult<()> {
        let inner = &self.inner;
        if inner.state() != RunState::Created {
            return Err(PushError::ConnectionFailed("connection was already started".into()));
        }

        inner.set_state(RunState::ConnectingTcp);
        let stream = match inner.connect_with_retry().await {
            Ok(stream) => stream,
            Err(e) => {
                inner.terminate("connect attempts exhausted").await;
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *inner.writer.lock().await = Some(FrameWriter::new(write_half));

        inner.set_state(RunState::LoggingIn);
        let mut state_rx = inner.state_tx.subscribe();
        let login = inner.login_message();
        if let Err(e) = inner.send(&login).await {
            inner.record_failure(ErrorCategory::Login);
            inner.terminate("login send failed").await;
            return Err(PushError::LoginFailed(e.to_string()));
        }
        debug!(tenant = %inner.tenant, "Login request sent");

        let receive = tokio::spawn(receive_loop(Arc::clone(inner), FrameReader::new(read_half)));
        *locked(&self.receive_task) = Some(receive);

        let login_timeout = inner.settings.login_timeout();
        let reached = timeout(login_timeout, async {
            state_rx
                .wait_for(|state| matches!(state, RunState::Started | RunState::Stopping | RunState::Stopped))
                .await
                .map(|state| *state)
        })
        .await;

        match reached {
            Ok(Ok(RunState::Started)) => {
                if let Some(heartbeat) = spawn_heartbeat(inner) {
                    *locked(&inner.heartbeat_task) = Some(heartbeat);
                }
                Ok(())
            }
            Ok(_) => {
                self.stop().await;
                let reason = locked(&inner.login_rejection)
                    .clone()
                    .unwrap_or_else(|| "connection ended before login completed".to_string());
                Err(PushError::LoginFailed(reason))
            }
            Err(_) => {
                inner.record_failure(ErrorCategory::Login);
                warn!(tenant = %inner.tenant, ?login_timeout, "No login response");
                self.stop().await;
                Err(PushError::LoginFailed(format!("no login response within {:?}", login_timeout)))
            }
        }
    }

    /// Stops the connection. Idempotent; concurrent calls collapse into one.
    pub async fn stop(&self) {
        self.inner.terminate("stop requested").await;
        if let Some(handle) = locked(&self.receive_task).take() {
            handle.abort();
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    /// Watches run-state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns true until the connection begins shutting down.
    pub fn is_running(&self) -> bool {
        self.inner.state().is_live()
    }

    /// True if the server refused the login (stale identity).
    pub fn login_rejected(&self) -> bool {
        locked(&self.inner.login_rejection).is_some()
    }

    pub fn tenant(&self) -> &TenantId {
        &self.inner.tenant
    }
}

impl Drop for McsConnection {
    fn drop(&mut self) {
        if let Some(handle) = locked(&self.receive_task).take() {
            handle.abort();
        }
        if let Some(handle) = locked(&self.inner.heartbeat_task).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for McsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McsConnection")
            .field("tenant", &self.inner.tenant)
            .field("state", &self.inner.state())
            .finish()
    }
}

// =============================================================================
// Connection Internals
// =============================================================================

impl Inner {
    fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: RunState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(tenant = %self.tenant, from = %previous, to = %state, "MCS state change");
        }
    }

    fn record_failure(&self, category: ErrorCategory) -> bool {
        let exceeded = locked(&self.counters).record_failure(category);
        if exceeded {
            warn!(tenant = %self.tenant, %category, "Sequential error threshold reached");
        }
        exceeded
    }

    fn record_success(&self, category: ErrorCategory) {
        locked(&self.counters).record_success(category);
    }

    fn last_stream_id(&self) -> i32 {
        self.stream_id.load(Ordering::SeqCst)
    }

    fn login_message(&self) -> McsMessage {
        let replay = locked(&self.persistent_ids).snapshot();
        if !replay.is_empty() {
            debug!(tenant = %self.tenant, count = replay.len(), "Replaying persistent ids");
        }
        let server_heartbeat_ms = self
            .settings
            .server_heartbeat()
            .map(|interval| interval.as_millis().min(u32::MAX as u128) as u32);
        login_request(self.android_id, self.security_token, &replay, server_heartbeat_ms)
    }

    async fn connect_with_retry(&self) -> PushResult<BoxedStream> {
        let attempts = self.settings.connect_attempts();
        let connect_timeout = self.settings.connect_timeout();
        let mut backoff = RetryPolicy::connect(&self.settings).backoff();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let dialed = timeout(connect_timeout, self.dialer.dial(&self.settings.host, self.settings.port)).await;
            let error = match dialed {
                Ok(Ok(stream)) => {
                    self.record_success(ErrorCategory::Connection);
                    info!(tenant = %self.tenant, host = %self.settings.host, attempt, "MCS connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => PushError::ConnectionFailed(format!("connect timed out after {:?}", connect_timeout)),
            };

            warn!(tenant = %self.tenant, attempt, attempts, error = %error, "MCS connect failed");
            let exceeded = self.record_failure(ErrorCategory::Connection);
            last_error = Some(error);
            if exceeded || attempt == attempts {
                break;
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }

        Err(last_error.unwrap_or_else(|| PushError::ConnectionFailed("no connect attempt made".into())))
    }

    async fn send(&self, message: &McsMessage) -> PushResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(PushError::ConnectionClosed)?;
        writer.write_message(message).await
    }

    /// Shuts the session down once. Later callers wait for the first to
    /// finish and return.
    async fn terminate(&self, reason: &str) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }
        *stopped = true;

        info!(tenant = %self.tenant, reason, "Stopping MCS connection");
        self.set_state(RunState::Stopping);

        if let Some(handle) = locked(&self.heartbeat_task).take() {
            handle.abort();
        }

        let close_timeout = self.settings.close_timeout();
        let writer = match timeout(close_timeout, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!(tenant = %self.tenant, "Writer busy during stop; dropping transport");
                None
            }
        };
        if let Some(mut writer) = writer {
            match timeout(close_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(tenant = %self.tenant, error = %e, "Transport shutdown error"),
                Err(_) => warn!(tenant = %self.tenant, "TLS shutdown timed out; force closing"),
            }
        }

        self.set_state(RunState::Stopped);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch(&self, message: McsMessage) -> Flow {
        match message {
            McsMessage::LoginResponse(response) => self.on_login_response(response),
            McsMessage::DataMessage(stanza) => self.on_data_message(stanza).await,
            McsMessage::HeartbeatPing(_) => {
                debug!(tenant = %self.tenant, "Server heartbeat ping");
                if let Err(e) = self.send(&heartbeat_ack(self.last_stream_id())).await {
                    warn!(tenant = %self.tenant, error = %e, "Failed to answer heartbeat");
                }
                Flow::Continue
            }
            McsMessage::HeartbeatAck(_) => Flow::Continue,
            McsMessage::Close => Flow::Stop("server sent Close".to_string()),
            McsMessage::IqStanza(iq) => {
                debug!(
                    tenant = %self.tenant,
                    iq_type = iq.r#type,
                    acked = ?selective_ack_ids(&iq),
                    "IQ stanza received"
                );
                Flow::Continue
            }
            McsMessage::StreamError(error) => {
                warn!(
                    tenant = %self.tenant,
                    error_type = %error.r#type,
                    text = error.text.as_deref().unwrap_or(""),
                    "Stream error from server"
                );
                Flow::Continue
            }
            McsMessage::LoginRequest(_) => {
                warn!(tenant = %self.tenant, "Unexpected LoginRequest from server");
                Flow::Continue
            }
            McsMessage::Unhandled { tag, len } => {
                debug!(tenant = %self.tenant, tag, len, "Ignoring unhandled MCS message");
                Flow::Continue
            }
        }
    }

    fn on_login_response(&self, response: LoginResponse) -> Flow {
        if let Some(error) = response.error {
            let reason = format!("code {}: {}", error.code, error.message.unwrap_or_default());
            warn!(tenant = %self.tenant, %reason, "MCS login rejected");
            *locked(&self.login_rejection) = Some(reason.clone());
            self.record_failure(ErrorCategory::Login);
            return Flow::Stop(format!("login rejected ({})", reason));
        }

        info!(tenant = %self.tenant, "MCS login succeeded");
        locked(&self.persistent_ids).clear();
        locked(&self.counters).reset_all();
        self.set_state(RunState::Started);
        Flow::Continue
    }

    async fn on_data_message(&self, stanza: DataMessageStanza) -> Flow {
        let persistent_id = stanza.persistent_id.clone().unwrap_or_default();
        if !persistent_id.is_empty() && locked(&self.persistent_ids).contains(&persistent_id) {
            debug!(tenant = %self.tenant, %persistent_id, "Skipping already received message");
            // the earlier ack may have been lost
            self.acknowledge(&persistent_id).await;
            return Flow::Continue;
        }

        let mut exceeded = false;
        match self.open_envelope(&stanza, &persistent_id) {
            Ok(envelope) => {
                let push = InboundPush {
                    origin: Some(self.tenant.clone()),
                    envelope,
                };
                match self.push_tx.send(push).await {
                    Ok(()) => self.record_success(ErrorCategory::Notify),
                    Err(_) => {
                        warn!(tenant = %self.tenant, %persistent_id, "Push router is gone");
                        exceeded = self.record_failure(ErrorCategory::Notify);
                    }
                }
            }
            Err(e) => {
                warn!(tenant = %self.tenant, %persistent_id, error = %e, "Failed to open push");
                exceeded = self.record_failure(ErrorCategory::Notify);
            }
        }

        if !persistent_id.is_empty() {
            locked(&self.persistent_ids).insert(persistent_id.clone());
            self.acknowledge(&persistent_id).await;
        }

        if exceeded {
            Flow::Stop("too many notification failures".to_string())
        } else {
            Flow::Continue
        }
    }

    async fn acknowledge(&self, persistent_id: &str) {
        if !self.settings.selective_ack {
            return;
        }
        if let Err(e) = self.send(&selective_ack(persistent_id)).await {
            warn!(tenant = %self.tenant, %persistent_id, error = %e, "Selective ack failed");
        }
    }

    fn open_envelope(&self, stanza: &DataMessageStanza, persistent_id: &str) -> PushResult<PushEnvelope> {
        let data = match (stanza.app_data_value("crypto-key"), stanza.app_data_value("encryption")) {
            (Some(crypto_key), Some(encryption)) => {
                let raw = stanza
                    .raw_data
                    .as_deref()
                    .ok_or_else(|| PushError::Decrypt("encrypted message without raw data".into()))?;
                let plaintext = self.decryptor.decrypt(
                    header_param(crypto_key, "dh="),
                    header_param(encryption, "salt="),
                    raw,
                )?;
                serde_json::from_slice(&plaintext)
                    .map_err(|e| PushError::Decrypt(format!("decrypted body is not JSON: {}", e)))?
            }
            _ => Value::Object(
                stanza
                    .app_data
                    .iter()
                    .map(|entry| (entry.key.clone(), Value::String(entry.value.clone())))
                    .collect(),
            ),
        };

        let destination_token = stanza
            .token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| data.get("to").and_then(Value::as_str).map(str::to_string));

        Ok(PushEnvelope {
            persistent_id: persistent_id.to_string(),
            destination_token,
            from: stanza.from.clone(),
            category: stanza.category.clone(),
            sent_at_ms: stanza.sent,
            data,
        })
    }
}

/// Extracts `prefix`'s value from a `;`-separated header value.
fn header_param<'a>(value: &'a str, prefix: &str) -> &'a str {
    value
        .split(';')
        .find_map(|part| part.trim().strip_prefix(prefix))
        .unwrap_or(value)
}

// =============================================================================
// Tasks
// =============================================================================

async fn receive_loop(inner: Arc<Inner>, mut reader: Reader) {
    let idle = inner.settings.idle_timeout();

    let reason = loop {
        let frame = match timeout(idle, reader.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                inner.record_failure(ErrorCategory::Read);
                break format!("read failed: {}", e);
            }
            Err(_) => {
                inner.record_failure(ErrorCategory::Read);
                break format!("no data received for {:?}", idle);
            }
        };
        inner.stream_id.fetch_add(1, Ordering::SeqCst);

        let message = match McsMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(tenant = %inner.tenant, tag = frame.tag, error = %e, "Undecodable MCS frame");
                if inner.record_failure(ErrorCategory::Read) {
                    break "too many undecodable frames".to_string();
                }
                continue;
            }
        };
        inner.record_success(ErrorCategory::Read);

        if let Flow::Stop(reason) = inner.dispatch(message).await {
            break reason;
        }
    };

    inner.terminate(&reason).await;
}

fn spawn_heartbeat(inner: &Arc<Inner>) -> Option<JoinHandle<()>> {
    let period = inner.settings.client_heartbeat()?;
    let inner = Arc::clone(inner);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match inner.state() {
                RunState::Started => {}
                state if !state.is_live() => break,
                _ => continue,
            }
            match inner.send(&heartbeat_ping(inner.last_stream_id())).await {
                Ok(()) => debug!(tenant = %inner.tenant, "Heartbeat sent"),
                Err(e) => warn!(tenant = %inner.tenant, error = %e, "Heartbeat failed"),
            }
        }
    }))
}
