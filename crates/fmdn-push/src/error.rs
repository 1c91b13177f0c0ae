//! # Push Error Types
//!
//! Error types for the push transport runtime.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Push Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  MCS Connection │  │     Registration        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  RegistrationFailed     │ │
//! │  │  InvalidUrl     │  │  Read / Timeout │  │   (retryable)           │ │
//! │  │  ConfigLoad     │  │  Login          │  │  RegistrationRejected   │ │
//! │  └─────────────────┘  └─────────────────┘  │   (never retried)       │ │
//! │                                            └─────────────────────────┘ │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Delivery     │  │     Storage     │  │       Internal          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  NotifyFailed   │  │  Storage        │  │  ChannelError           │ │
//! │  │  Decrypt        │  │                 │  │  ShuttingDown           │ │
//! │  │  Consumer       │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connection, read and login errors never leave their MCS connection: they
//! end it, and the supervisor only observes "connection ended". Registration
//! errors reach the supervisor, which backs off on retryable ones and reports
//! an auth failure on rejected ones.

use std::time::Duration;

use thiserror::Error;

use crate::mcs::ErrorCategory;

/// Result type alias for push operations.
pub type PushResult<T> = Result<T, PushError>;

// =============================================================================
// Registration Stage
// =============================================================================

/// Which HTTP call of the registration flow failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStage {
    Checkin,
    GcmRegister,
    FcmInstall,
    FcmTokenRefresh,
    FcmRegister,
}

impl std::fmt::Display for RegistrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationStage::Checkin => write!(f, "gcm check-in"),
            RegistrationStage::GcmRegister => write!(f, "gcm register"),
            RegistrationStage::FcmInstall => write!(f, "fcm installation"),
            RegistrationStage::FcmTokenRefresh => write!(f, "fcm token refresh"),
            RegistrationStage::FcmRegister => write!(f, "fcm registration"),
        }
    }
}

// =============================================================================
// Push Error
// =============================================================================

/// Push runtime error covering every failure of the subsystem.
#[derive(Debug, Error)]
pub enum PushError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid push configuration: {0}")]
    InvalidConfig(String),

    /// A configured URL did not parse.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save the config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // MCS Connection Errors
    // =========================================================================
    /// TCP connect or TLS handshake failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport error while receiving.
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// No frame arrived within the idle timeout.
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),

    /// The server rejected or never answered the login.
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// The stream violated the MCS framing.
    #[error("Protocol error: {0}")]
    Protocol(#[from] fmdn_core::CoreError),

    /// The connection is not (or no longer) able to send.
    #[error("Connection closed")]
    ConnectionClosed,

    // =========================================================================
    // Delivery Errors
    // =========================================================================
    /// The notification hand-off failed.
    #[error("Notification dispatch failed: {0}")]
    NotifyFailed(String),

    /// A web push or location payload could not be decrypted.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Key material is missing or malformed.
    #[error("Invalid key material: {0}")]
    KeyMaterial(String),

    /// A consumer hook reported a failure.
    #[error("Consumer error: {0}")]
    Consumer(String),

    // =========================================================================
    // Registration Errors
    // =========================================================================
    /// A registration call failed in a way that may succeed on retry.
    #[error("{stage} failed: {reason}")]
    RegistrationFailed { stage: RegistrationStage, reason: String },

    /// A registration call was rejected; retrying cannot help.
    #[error("{stage} rejected: {code}")]
    RegistrationRejected { stage: RegistrationStage, code: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored data did not (de)serialize.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The component is shutting down.
    #[error("Shutting down")]
    ShuttingDown,
}

impl PushError {
    /// Returns true if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PushError::RegistrationRejected { .. }
            | PushError::InvalidConfig(_)
            | PushError::InvalidUrl(_)
            | PushError::KeyMaterial(_)
            | PushError::ShuttingDown => false,
            PushError::Protocol(core) => !core.is_stream_fatal(),
            _ => true,
        }
    }

    /// Returns true if the error means the tenant's identity was refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PushError::RegistrationRejected { .. })
    }

    /// Maps a connection-local error onto its sequential-error category.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            PushError::ConnectionFailed(_) => Some(ErrorCategory::Connection),
            PushError::ReadFailed(_) | PushError::IdleTimeout(_) | PushError::Protocol(_) => {
                Some(ErrorCategory::Read)
            }
            PushError::LoginFailed(_) => Some(ErrorCategory::Login),
            PushError::NotifyFailed(_) | PushError::Decrypt(_) => Some(ErrorCategory::Notify),
            _ => None,
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fmdn_store::StoreError> for PushError {
    fn from(err: fmdn_store::StoreError) -> Self {
        PushError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PushError {
    fn from(err: serde_json::Error) -> Self {
        PushError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for PushError {
    fn from(err: url::ParseError) -> Self {
        PushError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for PushError {
    fn from(err: std::io::Error) -> Self {
        PushError::ReadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for PushError {
    fn from(err: toml::de::Error) -> Self {
        PushError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for PushError {
    fn from(err: toml::ser::Error) -> Self {
        PushError::ConfigSaveFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let rejected = PushError::RegistrationRejected {
            stage: RegistrationStage::GcmRegister,
            code: "INVALID_SENDER".into(),
        };
        assert!(!rejected.is_retryable());
        assert!(rejected.is_auth_failure());

        let failed = PushError::RegistrationFailed {
            stage: RegistrationStage::Checkin,
            reason: "503".into(),
        };
        assert!(failed.is_retryable());
        assert!(!failed.is_auth_failure());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            PushError::ConnectionFailed("refused".into()).category(),
            Some(ErrorCategory::Connection)
        );
        assert_eq!(
            PushError::IdleTimeout(Duration::from_secs(25)).category(),
            Some(ErrorCategory::Read)
        );
        assert_eq!(PushError::LoginFailed("x".into()).category(), Some(ErrorCategory::Login));
        assert_eq!(PushError::Decrypt("x".into()).category(), Some(ErrorCategory::Notify));
        assert_eq!(PushError::ShuttingDown.category(), None);
    }

    #[test]
    fn test_stage_display() {
        let err = PushError::RegistrationRejected {
            stage: RegistrationStage::GcmRegister,
            code: "PHONE_REGISTRATION_ERROR".into(),
        };
        assert_eq!(err.to_string(), "gcm register rejected: PHONE_REGISTRATION_ERROR");
    }
}
