//! # Credentials
//!
//! The per-tenant identity blob minted by check-in and registration.
//!
//! ## Shape (JSON, as persisted)
//! ```text
//! {
//!   "gcm":  { "android_id": "…", "security_token": "…", "app_id": "wp:…", "token": "…" },
//!   "fcm":  { "installation": { "token", "refresh_token", "fid", "expires_at" },
//!             "registration": { "token" } },
//!   "keys": { "public": "<b64url>", "private": "<b64url pkcs8>", "secret": "<b64url>" }
//! }
//! ```
//!
//! A snapshot is immutable: registration produces a new value and the
//! supervisor replaces the stored blob wholesale. `android_id` and
//! `security_token` are decimal strings so blobs written by other clients load
//! unchanged.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Installation tokens are refreshed this long before they actually expire.
const INSTALLATION_EXPIRY_MARGIN_SECS: i64 = 60;

// =============================================================================
// GCM
// =============================================================================

/// Device identity issued by GCM check-in, plus the GCM send token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcmCredentials {
    /// Android id (decimal).
    #[serde(default)]
    pub android_id: String,

    /// Security token paired with the android id (decimal).
    #[serde(default)]
    pub security_token: String,

    /// Per-install application id used as the GCM `X-subtype`.
    #[serde(default)]
    pub app_id: String,

    /// Token returned by GCM register, used as the web push endpoint suffix.
    #[serde(default)]
    pub token: Option<String>,
}

impl GcmCredentials {
    /// Returns the numeric android id.
    pub fn android_id(&self) -> CoreResult<u64> {
        parse_decimal("gcm.android_id", &self.android_id)
    }

    /// Returns the numeric security token.
    pub fn security_token(&self) -> CoreResult<u64> {
        parse_decimal("gcm.security_token", &self.security_token)
    }
}

fn parse_decimal(field: &'static str, value: &str) -> CoreResult<u64> {
    if value.is_empty() {
        return Err(CoreError::MissingCredential(field));
    }
    value.parse::<u64>().map_err(|e| CoreError::InvalidCredential {
        field,
        reason: e.to_string(),
    })
}

// =============================================================================
// FCM
// =============================================================================

/// Firebase installation: a FID plus its auth token pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationCredentials {
    /// Installation auth token (sent as `x-goog-firebase-installations-auth`).
    pub token: String,

    /// Long-lived refresh token for minting new auth tokens.
    pub refresh_token: String,

    /// Firebase installation id.
    pub fid: String,

    /// When `token` expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl InstallationCredentials {
    /// Returns true if the auth token is expired (or about to be) at `now`.
    ///
    /// A token without a recorded expiry is treated as valid.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(INSTALLATION_EXPIRY_MARGIN_SECS) >= expires_at,
            None => false,
        }
    }
}

/// FCM web push registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationCredentials {
    /// The push token servers address messages to.
    pub token: String,
}

/// FCM half of the credentials blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcmCredentials {
    #[serde(default)]
    pub installation: Option<InstallationCredentials>,
    #[serde(default)]
    pub registration: Option<RegistrationCredentials>,
}

// =============================================================================
// Web Push Keys
// =============================================================================

/// Key material of the web push subscription, base64url without padding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPushKeys {
    /// Uncompressed P-256 public point (65 bytes).
    pub public: String,
    /// PKCS#8 DER private key.
    pub private: String,
    /// 16-byte auth secret.
    pub secret: String,
}

impl WebPushKeys {
    /// Returns true if all three fields are populated.
    pub fn is_complete(&self) -> bool {
        !self.public.is_empty() && !self.private.is_empty() && !self.secret.is_empty()
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Complete identity of one tenant's push client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub gcm: GcmCredentials,
    #[serde(default)]
    pub fcm: FcmCredentials,
    #[serde(default)]
    pub keys: WebPushKeys,
}

impl Credentials {
    /// Returns true if the android id and security token needed for MCS
    /// login are present and numeric.
    pub fn has_gcm_identity(&self) -> bool {
        self.gcm.android_id().is_ok() && self.gcm.security_token().is_ok()
    }

    /// Returns true if the blob can be used to log in and decrypt pushes.
    pub fn is_usable(&self) -> bool {
        self.has_gcm_identity() && self.keys.is_complete() && self.fcm_token().is_some()
    }

    /// Returns the FCM push token, if registered.
    pub fn fcm_token(&self) -> Option<&str> {
        self.fcm
            .registration
            .as_ref()
            .map(|r| r.token.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Parses a credentials blob.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidCredential {
            field: "credentials",
            reason: e.to_string(),
        })
    }

    /// Serializes the blob for storage.
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::InvalidCredential {
            field: "credentials",
            reason: e.to_string(),
        })
    }
}
