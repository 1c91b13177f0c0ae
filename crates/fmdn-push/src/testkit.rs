//! Shared fixtures for this crate's tests: canned credentials, registration
//! mocks, an in-memory MCS server and recording collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fmdn_core::credentials::RegistrationCredentials;
use fmdn_core::message::selective_ack_ids;
use fmdn_core::payload::{canonic_device_id, encode_device_update, FMDN_PAYLOAD_KEY};
use fmdn_core::proto::{AndroidCheckinResponse, AppData, DataMessageStanza, ErrorInfo, LoginRequest, LoginResponse};
use fmdn_core::{
    Credentials, GcmCredentials, InboundPush, LocationRecord, McsMessage, McsTag, PushEnvelope, TenantId, WebPushKeys,
};
use prost::Message;
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::FcmSettings;
use crate::consumer::{Consumer, LocationDecryptor};
use crate::error::{PushError, PushResult};
use crate::mcs::{BoxedStream, Dialer, FrameReader, FrameWriter};
use crate::webpush::{generate_keys, seal};

// =============================================================================
// Credentials & Registration
// =============================================================================

pub(crate) fn test_credentials() -> Credentials {
    Credentials {
        gcm: GcmCredentials {
            android_id: "4242".into(),
            security_token: "9001".into(),
            app_id: "wp:receiver.push.com#test".into(),
            token: Some("gcm-token-1".into()),
        },
        fcm: fmdn_core::FcmCredentials {
            installation: None,
            registration: Some(RegistrationCredentials {
                token: "fcm-token-1".into(),
            }),
        },
        keys: generate_keys().unwrap(),
    }
}

pub(crate) fn test_fcm_settings() -> FcmSettings {
    FcmSettings {
        project_id: "test-project".into(),
        app_id: "1:1234567890:web:abc".into(),
        api_key: "test-api-key".into(),
        sender_id: "1234567890".into(),
        ..Default::default()
    }
}

pub(crate) fn checkin_response(android_id: u64, security_token: u64) -> Vec<u8> {
    AndroidCheckinResponse {
        stats_ok: true,
        android_id: Some(android_id),
        security_token: Some(security_token),
        ..Default::default()
    }
    .encode_to_vec()
}

/// Mounts a happy path for every registration endpoint.
pub(crate) async fn mount_registration_mocks(server: &MockServer, fcm_token: &str) {
    Mock::given(method("POST"))
        .and(path("/checkin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(checkin_response(4242, 9001)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/c2dm/register3"))
        .respond_with(ResponseTemplate::new(200).set_body_string("token=gcm-token-1"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/installations/v1/projects/test-project/installations/[^/]+/authTokens:generate$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "fis-auth-token-2",
            "expiresIn": "604800s",
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/installations/v1/projects/test-project/installations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "fid": "cAbCdEfGhIjKlMnOpQrStU",
            "refreshToken": "fis-refresh-token",
            "authToken": {"token": "fis-auth-token", "expiresIn": "604800s"},
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/registrations/v1/projects/test-project/registrations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": fcm_token})))
        .mount(server)
        .await;
}

// =============================================================================
// In-Memory MCS
// =============================================================================

/// Dialer handing out in-memory pipes; the server ends arrive on a channel.
pub(crate) struct ChannelDialer {
    accepts: Option<mpsc::UnboundedSender<DuplexStream>>,
    fail_first: usize,
    attempts: AtomicUsize,
}

impl ChannelDialer {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::failing_first(0)
    }

    /// Fails the first `n` dials, then connects.
    pub(crate) fn failing_first(n: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = ChannelDialer {
            accepts: Some(tx),
            fail_first: n,
            attempts: AtomicUsize::new(0),
        };
        (Arc::new(dialer), rx)
    }

    /// Never connects.
    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(ChannelDialer {
            accepts: None,
            fail_first: 0,
            attempts: AtomicUsize::new(0),
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ChannelDialer {
    async fn dial(&self, _host: &str, _port: u16) -> PushResult<BoxedStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(accepts) = self.accepts.as_ref().filter(|_| attempt > self.fail_first) else {
            return Err(PushError::ConnectionFailed("connection refused".into()));
        };
        let (client, server) = tokio::io::duplex(64 * 1024);
        accepts
            .send(server)
            .map_err(|_| PushError::ConnectionFailed("test server gone".into()))?;
        Ok(Box::new(client))
    }
}

/// Server end of one in-memory MCS session.
pub(crate) struct FakeMcsServer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl FakeMcsServer {
    pub(crate) async fn accept(accepts: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Self {
        let stream = accepts.recv().await.expect("client dialed");
        let (read, write) = tokio::io::split(stream);
        FakeMcsServer {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        }
    }

    pub(crate) async fn recv(&mut self) -> McsMessage {
        self.reader.read_message().await.expect("client frame")
    }

    pub(crate) async fn send(&mut self, message: McsMessage) {
        self.writer.write_message(&message).await.expect("server write");
    }

    /// Sends a frame whose body does not decode as a heartbeat ping.
    pub(crate) async fn send_garbage(&mut self) {
        self.writer
            .write_frame(McsTag::HeartbeatPing, &[0xff])
            .await
            .expect("server write");
    }

    async fn login_request(&mut self) -> LoginRequest {
        loop {
            if let McsMessage::LoginRequest(login) = self.recv().await {
                return login;
            }
        }
    }

    pub(crate) async fn accept_login(&mut self) -> LoginRequest {
        let login = self.login_request().await;
        self.send(McsMessage::LoginResponse(LoginResponse {
            id: login.id.clone(),
            ..Default::default()
        }))
        .await;
        login
    }

    pub(crate) async fn reject_login(&mut self, code: i32) {
        let login = self.login_request().await;
        self.send(McsMessage::LoginResponse(LoginResponse {
            id: login.id,
            error: Some(ErrorInfo {
                code,
                message: Some("rejected".into()),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await;
    }

    /// Skips to the next IQ stanza and returns the ids it acknowledges.
    pub(crate) async fn expect_ack(&mut self) -> Vec<String> {
        loop {
            if let McsMessage::IqStanza(iq) = self.recv().await {
                return selective_ack_ids(&iq);
            }
        }
    }
}

/// An encrypted data message carrying `body`.
pub(crate) fn data_message(keys: &WebPushKeys, persistent_id: &str, token: Option<&str>, body: &Value) -> McsMessage {
    let (dh, salt, ciphertext) = seal(keys, body.to_string().as_bytes());
    McsMessage::DataMessage(DataMessageStanza {
        id: Some(persistent_id.to_string()),
        from: "1234567890".into(),
        category: "org.chromium.linux".into(),
        token: token.map(str::to_string),
        app_data: vec![
            AppData {
                key: "crypto-key".into(),
                value: format!("dh={}", dh),
            },
            AppData {
                key: "encryption".into(),
                value: format!("salt={}", salt),
            },
        ],
        persistent_id: Some(persistent_id.to_string()),
        raw_data: Some(ciphertext),
        ..Default::default()
    })
}

// =============================================================================
// Payloads
// =============================================================================

/// A routable payload for `device_id` whose last byte is `marker`.
pub(crate) fn device_payload(device_id: &str, marker: u8) -> Vec<u8> {
    let mut payload = encode_device_update(device_id);
    // field 15, varint
    payload.extend([0x78, marker & 0x7f]);
    payload
}

pub(crate) fn fmdn_body(payload: &[u8]) -> Value {
    json!({ "data": { FMDN_PAYLOAD_KEY: STANDARD.encode(payload) } })
}

pub(crate) fn push_for(origin: &str, token: Option<&str>, device_id: &str, marker: u8) -> InboundPush {
    InboundPush {
        origin: Some(TenantId::from(origin)),
        ..unattributed_push(token, device_id, marker)
    }
}

/// A push with no delivering connection.
pub(crate) fn unattributed_push(token: Option<&str>, device_id: &str, marker: u8) -> InboundPush {
    InboundPush {
        origin: None,
        envelope: PushEnvelope {
            persistent_id: format!("0:{}", marker),
            destination_token: token.map(str::to_string),
            from: "1234567890".into(),
            category: "org.chromium.linux".into(),
            sent_at_ms: None,
            data: fmdn_body(&device_payload(device_id, marker)),
        },
    }
}

// =============================================================================
// Collaborators
// =============================================================================

fn set_of(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Consumer that records every update it receives.
pub(crate) struct RecordingConsumer {
    tenant: TenantId,
    tracked: HashSet<String>,
    ignored: HashSet<String>,
    present: HashSet<String>,
    known: HashSet<String>,
    updates: Mutex<Vec<(String, LocationRecord)>>,
    delivered_at: Mutex<Vec<Instant>>,
    refreshes: AtomicUsize,
}

impl RecordingConsumer {
    pub(crate) fn new(tenant: &str, tracked: &[&str]) -> Self {
        RecordingConsumer {
            tenant: TenantId::from(tenant),
            tracked: set_of(tracked),
            ignored: HashSet::new(),
            present: HashSet::new(),
            known: HashSet::new(),
            updates: Mutex::new(Vec::new()),
            delivered_at: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn ignoring(mut self, ids: &[&str]) -> Self {
        self.ignored = set_of(ids);
        self
    }

    pub(crate) fn present(mut self, ids: &[&str]) -> Self {
        self.present = set_of(ids);
        self
    }

    pub(crate) fn knowing(mut self, ids: &[&str]) -> Self {
        self.known = set_of(ids);
        self
    }

    pub(crate) fn updates(&self) -> Vec<(String, LocationRecord)> {
        self.updates.lock().unwrap().clone()
    }

    pub(crate) fn delivered_at(&self) -> Vec<Instant> {
        self.delivered_at.lock().unwrap().clone()
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl Consumer for RecordingConsumer {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant
    }

    fn is_tracked(&self, device_id: &str) -> bool {
        self.tracked.contains(device_id)
    }

    fn is_ignored(&self, device_id: &str) -> bool {
        self.ignored.contains(device_id)
    }

    fn device_present(&self, device_id: &str) -> bool {
        self.present.contains(device_id)
    }

    fn knows_device(&self, device_id: &str) -> bool {
        self.known.contains(device_id)
    }

    fn update_cache(&self, device_id: &str, record: &LocationRecord) -> PushResult<()> {
        self.updates.lock().unwrap().push((device_id.to_string(), record.clone()));
        self.delivered_at.lock().unwrap().push(Instant::now());
        Ok(())
    }

    fn request_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decryptor that reads the device id and reports the payload's last byte
/// as the accuracy.
pub(crate) struct StaticDecryptor {
    calls: AtomicUsize,
    failing: Mutex<HashSet<TenantId>>,
}

impl StaticDecryptor {
    pub(crate) fn new() -> Self {
        StaticDecryptor {
            calls: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn fail_for(&self, tenant: &str) {
        self.failing.lock().unwrap().insert(TenantId::from(tenant));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationDecryptor for StaticDecryptor {
    async fn decrypt(&self, payload: &[u8], tenant: &TenantId) -> PushResult<LocationRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(tenant) {
            return Err(PushError::Decrypt(format!("no key for {}", tenant)));
        }
        let mut record = LocationRecord::for_device(canonic_device_id(payload)?);
        record.accuracy = payload.last().map(|byte| f64::from(*byte));
        Ok(record)
    }
}
