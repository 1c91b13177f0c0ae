//! # Registration Client
//!
//! Mints and validates a tenant's push identity over HTTP.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  check_in_and_register(existing)                                        │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  GCM check-in (protobuf, ≤8 attempts, stale ids dropped once)           │
//! │     │                                                                   │
//! │     ├── same android id as existing ──► refresh FIS token if expired    │
//! │     │                                   └─► existing credentials        │
//! │     ▼                                                                   │
//! │  GCM register (form, AidLogin, 404/HTML → alternate endpoint)           │
//! │     ▼                                                                   │
//! │  FCM installation (JSON, x-goog-api-key) ──► FID + auth token           │
//! │     ▼                                                                   │
//! │  web push keys (P-256 + auth secret)                                    │
//! │     ▼                                                                   │
//! │  FCM registration (JSON, installation auth) ──► push token              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No call retries forever. Every stage has an attempt budget and the caller
//! sees the final error once it is spent.

use std::future::Future;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use fmdn_core::gcm::{self, RegisterReply};
use fmdn_core::proto::{
    AndroidCheckinProto, AndroidCheckinRequest, AndroidCheckinResponse, ChromeBuildProto, DEVICE_CHROME_BROWSER,
};
use fmdn_core::credentials::RegistrationCredentials;
use fmdn_core::{Credentials, FcmCredentials, GcmCredentials, InstallationCredentials, WebPushKeys};
use prost::Message;
use rand::RngCore;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FcmSettings, RegistrationSettings};
use crate::error::{PushError, PushResult, RegistrationStage};
use crate::retry::RetryPolicy;
use crate::webpush::{encode_b64, generate_keys};

/// `app` form field of GCM register.
const GCM_APP: &str = "org.chromium.linux";

/// User agent GCM register expects.
const GCM_USER_AGENT: &str = "Android-GCM/1.5 (generic_x86 KK)";

const CHROME_VERSION: &str = "63.0.3234.0";
const CHROME_PLATFORM_LINUX: i32 = 2;
const CHROME_CHANNEL_STABLE: i32 = 1;
const CHECKIN_VERSION: i32 = 3;

const FIS_AUTH_VERSION: &str = "FIS_v2";
const FIS_SDK_VERSION: &str = "w:0.6.4";
const FIREBASE_CLIENT_HEARTBEAT: &str = r#"{"heartbeats":[],"version":2}"#;

/// Identity returned by check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckinIdentity {
    pub android_id: u64,
    pub security_token: u64,
}

// =============================================================================
// Wire Bodies
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthTokenBody {
    token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallationBody {
    #[serde(default)]
    fid: Option<String>,
    refresh_token: String,
    auth_token: AuthTokenBody,
}

#[derive(Debug, Deserialize)]
struct RegistrationBody {
    #[serde(default)]
    token: Option<String>,
}

/// Outcome of one GCM register request.
enum GcmAttempt {
    Token(String),
    /// 404 or an HTML page: the request went to the wrong endpoint.
    Misrouted(StatusCode),
    Failed(PushError),
}

// =============================================================================
// Registration Client
// =============================================================================

/// HTTP client for check-in and GCM/FCM registration.
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    http: reqwest::Client,
    settings: RegistrationSettings,
    fcm: FcmSettings,
}

impl RegistrationClient {
    pub fn new(settings: RegistrationSettings, fcm: FcmSettings) -> PushResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| PushError::InvalidConfig(format!("http client: {}", e)))?;
        Ok(RegistrationClient { http, settings, fcm })
    }

    /// Validates `existing` credentials or mints new ones.
    ///
    /// Returns `existing` (with a refreshed installation token if it had
    /// expired) when check-in confirms its identity; otherwise runs the full
    /// registration flow.
    pub async fn check_in_and_register(&self, existing: Option<&Credentials>) -> PushResult<Credentials> {
        let prior = existing.filter(|creds| creds.has_gcm_identity());
        let prior_identity = prior.and_then(|creds| {
            Some(CheckinIdentity {
                android_id: creds.gcm.android_id().ok()?,
                security_token: creds.gcm.security_token().ok()?,
            })
        });

        let identity = self.check_in(prior_identity).await?;

        if let Some(creds) = prior.filter(|creds| creds.is_usable()) {
            if prior_identity.map(|p| p.android_id) == Some(identity.android_id) {
                debug!(android_id = identity.android_id, "Check-in confirmed existing credentials");
                match self.refresh_installation(creds).await {
                    Ok(refreshed) => return Ok(refreshed),
                    Err(e) => warn!(error = %e, "Installation refresh failed; registering again"),
                }
            } else {
                info!("Check-in issued a new identity; registering from scratch");
            }
        }

        self.register(identity).await
    }

    /// Full registration for a checked-in identity.
    async fn register(&self, identity: CheckinIdentity) -> PushResult<Credentials> {
        if !self.fcm.is_complete() {
            return Err(PushError::InvalidConfig(
                "fcm project_id, app_id, api_key and sender_id are required to register".into(),
            ));
        }

        let app_id = format!("wp:receiver.push.com#{}", Uuid::new_v4());
        let gcm_token = self.gcm_register(identity, &app_id).await?;

        let installation = self
            .with_retry(RegistrationStage::FcmInstall, self.settings.fcm_attempts, || {
                self.fcm_install()
            })
            .await?;

        let keys = generate_keys()?;
        let fcm_token = self
            .with_retry(RegistrationStage::FcmRegister, self.settings.fcm_attempts, || {
                self.fcm_register(&gcm_token, &installation, &keys)
            })
            .await?;

        info!(android_id = identity.android_id, "Push registration complete");
        Ok(Credentials {
            gcm: GcmCredentials {
                android_id: identity.android_id.to_string(),
                security_token: identity.security_token.to_string(),
                app_id,
                token: Some(gcm_token),
            },
            fcm: FcmCredentials {
                installation: Some(installation),
                registration: Some(RegistrationCredentials { token: fcm_token }),
            },
            keys,
        })
    }

    async fn refresh_installation(&self, creds: &Credentials) -> PushResult<Credentials> {
        let Some(installation) = creds.fcm.installation.as_ref() else {
            return Ok(creds.clone());
        };
        if !installation.is_expired(Utc::now()) {
            return Ok(creds.clone());
        }

        debug!(fid = %installation.fid, "Installation token expired; refreshing");
        let refreshed = self
            .with_retry(RegistrationStage::FcmTokenRefresh, self.settings.fcm_attempts, || {
                self.fcm_refresh_install_token(installation)
            })
            .await?;

        let mut updated = creds.clone();
        updated.fcm.installation = Some(refreshed);
        Ok(updated)
    }

    // =========================================================================
    // GCM Check-in
    // =========================================================================

    /// Checks in, reusing `existing` when given.
    ///
    /// The first failure with an existing identity drops it and retries
    /// immediately without it.
    pub async fn check_in(&self, existing: Option<CheckinIdentity>) -> PushResult<CheckinIdentity> {
        let attempts = self.settings.checkin_attempts.max(1);
        let mut backoff = RetryPolicy::registration(&self.settings).backoff();
        let mut identity = existing;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.check_in_once(identity).await {
                Ok(confirmed) => return Ok(confirmed),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "GCM check-in failed");
                    if identity.take().is_some() {
                        debug!("Retrying check-in without the stored identity");
                        last_error = Some(e);
                        continue;
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| registration_failed(RegistrationStage::Checkin, "no attempt made")))
    }

    async fn check_in_once(&self, identity: Option<CheckinIdentity>) -> PushResult<CheckinIdentity> {
        let stage = RegistrationStage::Checkin;
        let request = checkin_request(identity);

        let response = self
            .http
            .post(&self.settings.checkin_url)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .body(request.encode_to_vec())
            .send()
            .await
            .map_err(|e| registration_failed(stage, e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| registration_failed(stage, e))?;
        check_status(stage, status)?;

        let decoded = AndroidCheckinResponse::decode(body.as_ref())
            .map_err(|e| registration_failed(stage, format!("undecodable response: {}", e)))?;
        match (decoded.android_id, decoded.security_token) {
            (Some(android_id), Some(security_token)) if android_id != 0 && security_token != 0 => {
                Ok(CheckinIdentity {
                    android_id,
                    security_token,
                })
            }
            _ => Err(registration_failed(stage, "response carries no identity")),
        }
    }

    // =========================================================================
    // GCM Register
    // =========================================================================

    /// Obtains the GCM send token for `app_id`.
    ///
    /// The second attempt uses the legacy sender. A 404 or HTML reply
    /// switches endpoints once per attempt without spending the attempt.
    pub async fn gcm_register(&self, identity: CheckinIdentity, app_id: &str) -> PushResult<String> {
        let attempts = self.settings.gcm_register_attempts.max(1);
        let mut backoff = RetryPolicy::registration(&self.settings).backoff();
        let mut use_alternate = false;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let sender = if attempt == 2 {
                self.fcm.legacy_sender.as_str()
            } else {
                self.fcm.sender_id.as_str()
            };

            let mut switched = false;
            let outcome = loop {
                let url = if use_alternate {
                    &self.settings.gcm_register_alt_url
                } else {
                    &self.settings.gcm_register_url
                };
                match self.gcm_register_once(url, identity, app_id, sender).await {
                    GcmAttempt::Misrouted(status) if !switched => {
                        debug!(%status, url = %url, "GCM register misrouted; switching endpoint");
                        switched = true;
                        use_alternate = !use_alternate;
                    }
                    GcmAttempt::Misrouted(status) => {
                        break GcmAttempt::Failed(registration_failed(
                            RegistrationStage::GcmRegister,
                            format!("both endpoints misrouted (HTTP {})", status),
                        ))
                    }
                    other => break other,
                }
            };

            match outcome {
                GcmAttempt::Token(token) => {
                    debug!(attempt, "GCM register succeeded");
                    return Ok(token);
                }
                GcmAttempt::Failed(e) if !e.is_retryable() => {
                    warn!(attempt, error = %e, "GCM register rejected");
                    return Err(e);
                }
                GcmAttempt::Failed(e) => {
                    warn!(attempt, attempts, error = %e, "GCM register failed");
                    last_error = Some(e);
                }
                GcmAttempt::Misrouted(_) => {}
            }

            if attempt < attempts {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }

        Err(last_error.unwrap_or_else(|| registration_failed(RegistrationStage::GcmRegister, "no attempt made")))
    }

    async fn gcm_register_once(
        &self,
        url: &str,
        identity: CheckinIdentity,
        app_id: &str,
        sender: &str,
    ) -> GcmAttempt {
        let stage = RegistrationStage::GcmRegister;
        let android_id = identity.android_id.to_string();
        let form = [
            ("app", GCM_APP),
            ("X-subtype", app_id),
            ("device", android_id.as_str()),
            ("sender", sender),
        ];

        let sent = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("AidLogin {}:{}", identity.android_id, identity.security_token))
            .header(USER_AGENT, GCM_USER_AGENT)
            .form(&form)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => return GcmAttempt::Failed(registration_failed(stage, e)),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return GcmAttempt::Failed(registration_failed(stage, e)),
        };

        if status == StatusCode::NOT_FOUND || gcm::looks_like_html(&body) {
            return GcmAttempt::Misrouted(status);
        }

        match RegisterReply::parse(&body) {
            Some(RegisterReply::Token(token)) => GcmAttempt::Token(token),
            Some(RegisterReply::Error(code)) if gcm::is_non_retryable(&code) => {
                GcmAttempt::Failed(PushError::RegistrationRejected { stage, code })
            }
            Some(RegisterReply::Error(code)) => GcmAttempt::Failed(registration_failed(stage, code)),
            None => match check_status(stage, status) {
                Err(e) => GcmAttempt::Failed(e),
                Ok(()) => GcmAttempt::Failed(registration_failed(stage, "reply carries neither token nor error")),
            },
        }
    }

    // =========================================================================
    // FCM Installation
    // =========================================================================

    /// Creates a Firebase installation with a fresh FID.
    pub async fn fcm_install(&self) -> PushResult<InstallationCredentials> {
        let stage = RegistrationStage::FcmInstall;
        let fid = generate_fid();
        let url = format!(
            "{}projects/{}/installations",
            self.settings.fcm_install_url, self.fcm.project_id
        );
        let body = json!({
            "appId": self.fcm.app_id,
            "authVersion": FIS_AUTH_VERSION,
            "fid": fid,
            "sdkVersion": FIS_SDK_VERSION,
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.fcm.api_key)
            .header("x-firebase-client", firebase_client_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| registration_failed(stage, e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| registration_failed(stage, e))?;
        check_status(stage, status)?;

        let parsed: InstallationBody =
            serde_json::from_str(&text).map_err(|e| registration_failed(stage, format!("bad body: {}", e)))?;
        Ok(InstallationCredentials {
            token: parsed.auth_token.token,
            refresh_token: parsed.refresh_token,
            fid: parsed.fid.unwrap_or(fid),
            expires_at: expiry(parsed.auth_token.expires_in.as_deref()),
        })
    }

    /// Mints a new installation auth token with the refresh token.
    pub async fn fcm_refresh_install_token(
        &self,
        installation: &InstallationCredentials,
    ) -> PushResult<InstallationCredentials> {
        let stage = RegistrationStage::FcmTokenRefresh;
        let url = format!(
            "{}projects/{}/installations/{}/authTokens:generate",
            self.settings.fcm_install_url, self.fcm.project_id, installation.fid
        );
        let body = json!({
            "installation": {
                "appId": self.fcm.app_id,
                "sdkVersion": FIS_SDK_VERSION,
            }
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.fcm.api_key)
            .header("x-firebase-client", firebase_client_header())
            .header(AUTHORIZATION, format!("{} {}", FIS_AUTH_VERSION, installation.refresh_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| registration_failed(stage, e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| registration_failed(stage, e))?;
        check_status(stage, status)?;

        let parsed: AuthTokenBody =
            serde_json::from_str(&text).map_err(|e| registration_failed(stage, format!("bad body: {}", e)))?;
        Ok(InstallationCredentials {
            token: parsed.token,
            refresh_token: installation.refresh_token.clone(),
            fid: installation.fid.clone(),
            expires_at: expiry(parsed.expires_in.as_deref()),
        })
    }

    // =========================================================================
    // FCM Registration
    // =========================================================================

    /// Registers the web push subscription and returns the push token.
    pub async fn fcm_register(
        &self,
        gcm_token: &str,
        installation: &InstallationCredentials,
        keys: &WebPushKeys,
    ) -> PushResult<String> {
        let stage = RegistrationStage::FcmRegister;
        let url = format!(
            "{}projects/{}/registrations",
            self.settings.fcm_register_url, self.fcm.project_id
        );
        let endpoint = format!("{}{}", self.settings.fcm_endpoint, gcm_token);
        let body = fcm_registration_body(&endpoint, keys, self.fcm.effective_vapid_key());

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.fcm.api_key)
            .header("x-goog-firebase-installations-auth", &installation.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| registration_failed(stage, e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| registration_failed(stage, e))?;
        check_status(stage, status)?;

        let parsed: RegistrationBody =
            serde_json::from_str(&text).map_err(|e| registration_failed(stage, format!("bad body: {}", e)))?;
        parsed
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| registration_failed(stage, "response carries no token"))
    }

    // =========================================================================
    // Retry
    // =========================================================================

    async fn with_retry<T, F, Fut>(&self, stage: RegistrationStage, attempts: u32, mut call: F) -> PushResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PushResult<T>>,
    {
        let attempts = attempts.max(1);
        let mut backoff = RetryPolicy::registration(&self.settings).backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= attempts => {
                    warn!(%stage, attempt, error = %e, "Registration call gave up");
                    return Err(e);
                }
                Err(e) => {
                    warn!(%stage, attempt, attempts, error = %e, "Registration call failed");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn registration_failed(stage: RegistrationStage, reason: impl std::fmt::Display) -> PushError {
    PushError::RegistrationFailed {
        stage,
        reason: reason.to_string(),
    }
}

/// 4xx other than 408/429 is a rejection; anything else unsuccessful may
/// succeed later.
fn check_status(stage: RegistrationStage, status: StatusCode) -> PushResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let retryable_client_error = status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS;
    if status.is_client_error() && !retryable_client_error {
        return Err(PushError::RegistrationRejected {
            stage,
            code: format!("HTTP {}", status.as_u16()),
        });
    }
    Err(registration_failed(stage, format!("HTTP {}", status.as_u16())))
}

fn checkin_request(identity: Option<CheckinIdentity>) -> AndroidCheckinRequest {
    AndroidCheckinRequest {
        id: identity.map(|i| i.android_id as i64),
        security_token: identity.map(|i| i.security_token),
        checkin: Some(AndroidCheckinProto {
            r#type: Some(DEVICE_CHROME_BROWSER),
            user_number: Some(0),
            chrome_build: Some(ChromeBuildProto {
                platform: Some(CHROME_PLATFORM_LINUX),
                chrome_version: Some(CHROME_VERSION.to_string()),
                channel: Some(CHROME_CHANNEL_STABLE),
            }),
            ..Default::default()
        }),
        version: Some(CHECKIN_VERSION),
        user_serial_number: Some(0),
        ..Default::default()
    }
}

fn firebase_client_header() -> String {
    STANDARD.encode(FIREBASE_CLIENT_HEARTBEAT)
}

/// Parses a `"604800s"` lifetime into an absolute expiry.
fn expiry(expires_in: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    let secs = expires_in?.trim().trim_end_matches('s').parse::<i64>().ok()?;
    Some(Utc::now() + chrono::Duration::seconds(secs))
}

/// Generates a Firebase installation id.
///
/// 17 random bytes with the first byte forced to `0b0111xxxx`, base64url,
/// truncated to 22 characters.
pub fn generate_fid() -> String {
    let mut bytes = [0u8; 17];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = 0b0111_0000 + (bytes[0] % 16);
    let mut fid = encode_b64(&bytes);
    fid.truncate(22);
    fid
}

/// JSON body of the FCM registration call.
///
/// `vapid_key` must already exclude the legacy default.
pub fn fcm_registration_body(endpoint: &str, keys: &WebPushKeys, vapid_key: Option<&str>) -> Value {
    let mut web = json!({
        "endpoint": endpoint,
        "auth": keys.secret,
        "p256dh": keys.public,
    });
    if let Some(key) = vapid_key {
        web["applicationPubKey"] = Value::String(key.to_string());
    }
    json!({ "web": web })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_VAPID_KEY;
    use crate::testkit::{checkin_response, mount_registration_mocks, test_credentials, test_fcm_settings};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RegistrationClient {
        let mut settings = RegistrationSettings::with_base_url(&server.uri());
        settings.initial_backoff_ms = 1;
        RegistrationClient::new(settings, test_fcm_settings()).unwrap()
    }

    const IDENTITY: CheckinIdentity = CheckinIdentity {
        android_id: 4242,
        security_token: 9001,
    };

    #[tokio::test]
    async fn test_full_registration() {
        let server = MockServer::start().await;
        mount_registration_mocks(&server, "fcm-token-1").await;

        let creds = client(&server).check_in_and_register(None).await.unwrap();
        assert_eq!(creds.gcm.android_id, "4242");
        assert_eq!(creds.gcm.security_token, "9001");
        assert!(creds.gcm.app_id.starts_with("wp:receiver.push.com#"));
        assert_eq!(creds.gcm.token.as_deref(), Some("gcm-token-1"));
        assert_eq!(creds.fcm_token(), Some("fcm-token-1"));
        let installation = creds.fcm.installation.as_ref().unwrap();
        assert_eq!(installation.token, "fis-auth-token");
        assert!(installation.expires_at.is_some());
        assert!(creds.keys.is_complete());
        assert!(creds.is_usable());
    }

    #[tokio::test]
    async fn test_existing_credentials_take_cheap_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(checkin_response(4242, 9001)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/c2dm/register3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("token=unexpected"))
            .expect(0)
            .mount(&server)
            .await;

        let existing = test_credentials();
        let creds = client(&server).check_in_and_register(Some(&existing)).await.unwrap();
        assert_eq!(creds, existing);
    }

    #[tokio::test]
    async fn test_checkin_drops_stale_identity_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(checkin_response(7, 8)))
            .mount(&server)
            .await;

        let identity = client(&server).check_in(Some(IDENTITY)).await.unwrap();
        assert_eq!(identity.android_id, 7);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let first = AndroidCheckinRequest::decode(requests[0].body.as_slice()).unwrap();
        let second = AndroidCheckinRequest::decode(requests[1].body.as_slice()).unwrap();
        assert_eq!(first.id, Some(4242));
        assert_eq!(second.id, None);
        assert_eq!(second.security_token, None);
    }

    #[tokio::test]
    async fn test_non_retryable_gcm_error_stops_immediately() {
        for code in gcm::NON_RETRYABLE_ERRORS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/c2dm/register3"))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!("Error={}", code)))
                .expect(1)
                .mount(&server)
                .await;

            let result = client(&server).gcm_register(IDENTITY, "wp:test").await;
            match result {
                Err(PushError::RegistrationRejected { stage, code: got }) => {
                    assert_eq!(stage, RegistrationStage::GcmRegister);
                    assert_eq!(got, code);
                }
                other => panic!("expected rejection for {}, got {:?}", code, other),
            }
        }
    }

    #[tokio::test]
    async fn test_retryable_gcm_error_uses_whole_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c2dm/register3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Error=TIMEOUT"))
            .expect(5)
            .mount(&server)
            .await;

        let result = client(&server).gcm_register(IDENTITY, "wp:test").await;
        assert!(matches!(result, Err(PushError::RegistrationFailed { .. })));
    }

    #[tokio::test]
    async fn test_second_gcm_attempt_uses_legacy_sender() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c2dm/register3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Error=TIMEOUT"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/c2dm/register3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("token=gcm-token-2"))
            .mount(&server)
            .await;

        let token = client(&server).gcm_register(IDENTITY, "wp:test").await.unwrap();
        assert_eq!(token, "gcm-token-2");

        let requests = server.received_requests().await.unwrap();
        let first = String::from_utf8_lossy(&requests[0].body).to_string();
        let second = String::from_utf8_lossy(&requests[1].body).to_string();
        assert!(first.contains("sender=1234567890"));
        assert!(second.contains(&format!("sender={}", DEFAULT_VAPID_KEY)));
        assert_eq!(
            requests[0].headers.get("authorization").unwrap().to_str().unwrap(),
            "AidLogin 4242:9001"
        );
        assert_eq!(
            requests[0].headers.get("user-agent").unwrap().to_str().unwrap(),
            GCM_USER_AGENT
        );
    }

    #[tokio::test]
    async fn test_html_reply_switches_endpoint_without_spending_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c2dm/register3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<!DOCTYPE html><html>moved</html>"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/alt/c2dm/register3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("token=gcm-token-alt"))
            .expect(1)
            .mount(&server)
            .await;

        let mut settings = RegistrationSettings::with_base_url(&server.uri());
        settings.gcm_register_attempts = 1;
        let client = RegistrationClient::new(settings, test_fcm_settings()).unwrap();

        assert_eq!(client.gcm_register(IDENTITY, "wp:test").await.unwrap(), "gcm-token-alt");
    }

    #[tokio::test]
    async fn test_fcm_install_sends_firebase_headers() {
        let server = MockServer::start().await;
        mount_registration_mocks(&server, "fcm-token-1").await;

        let installation = client(&server).fcm_install().await.unwrap();
        assert_eq!(installation.refresh_token, "fis-refresh-token");

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        assert_eq!(request.headers.get("x-goog-api-key").unwrap().to_str().unwrap(), "test-api-key");
        assert_eq!(
            request.headers.get("x-firebase-client").unwrap().to_str().unwrap(),
            firebase_client_header()
        );
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["authVersion"], "FIS_v2");
        assert_eq!(body["appId"], "1:1234567890:web:abc");
    }

    #[tokio::test]
    async fn test_fcm_register_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/registrations/v1/projects/test-project/registrations"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let installation = InstallationCredentials {
            token: "auth".into(),
            refresh_token: "refresh".into(),
            fid: "fid".into(),
            expires_at: None,
        };
        let keys = generate_keys().unwrap();
        let result = client
            .with_retry(RegistrationStage::FcmRegister, 3, || {
                client.fcm_register("gcm", &installation, &keys)
            })
            .await;
        assert!(matches!(result, Err(PushError::RegistrationRejected { .. })));
    }

    #[test]
    fn test_registration_body_omits_default_vapid_key() {
        let keys = WebPushKeys {
            public: "pub".into(),
            private: "priv".into(),
            secret: "sec".into(),
        };

        let mut fcm = test_fcm_settings();
        fcm.vapid_key = Some(DEFAULT_VAPID_KEY.to_string());
        let body = fcm_registration_body("https://e/x", &keys, fcm.effective_vapid_key());
        assert!(body["web"].get("applicationPubKey").is_none());
        assert_eq!(body["web"]["endpoint"], "https://e/x");
        assert_eq!(body["web"]["p256dh"], "pub");

        fcm.vapid_key = Some("BCustomKey".to_string());
        let body = fcm_registration_body("https://e/x", &keys, fcm.effective_vapid_key());
        assert_eq!(body["web"]["applicationPubKey"], "BCustomKey");
    }

    #[test]
    fn test_fid_format() {
        for _ in 0..32 {
            let fid = generate_fid();
            assert_eq!(fid.len(), 22);
            assert!(matches!(fid.chars().next(), Some('c' | 'd' | 'e' | 'f')), "{}", fid);
        }
    }

    #[test]
    fn test_status_classification() {
        let stage = RegistrationStage::FcmInstall;
        assert!(check_status(stage, StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(stage, StatusCode::UNAUTHORIZED),
            Err(PushError::RegistrationRejected { .. })
        ));
        assert!(check_status(stage, StatusCode::TOO_MANY_REQUESTS).unwrap_err().is_retryable());
        assert!(check_status(stage, StatusCode::BAD_GATEWAY).unwrap_err().is_retryable());
    }

    #[test]
    fn test_expiry_parsing() {
        let expires = expiry(Some("604800s")).unwrap();
        let days = (expires - Utc::now()).num_days();
        assert!((6..=7).contains(&days));
        assert!(expiry(Some("soon")).is_none());
        assert!(expiry(None).is_none());
    }
}
