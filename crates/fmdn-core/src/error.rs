//! # Core Error Types
//!
//! Errors raised while encoding or decoding the pure data model.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Core Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │      Wire       │  │   Credentials   │  │       Payload           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  VarintTooLong  │  │  Missing        │  │  MissingPayload         │ │
//! │  │  FrameTooLarge  │  │  Invalid        │  │  PayloadEncoding        │ │
//! │  │  MessageDecode  │  │                 │  │  PayloadDecode          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from the pure codec and model layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    // =========================================================================
    // Wire Errors
    // =========================================================================
    /// A varint32 ran past five bytes without terminating.
    #[error("Varint32 longer than 5 bytes")]
    VarintTooLong,

    /// A frame announced a payload larger than the allowed maximum.
    #[error("Frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    /// The peer spoke a protocol version we do not understand.
    #[error("Unsupported MCS version: {0}")]
    UnsupportedVersion(u8),

    /// A protobuf body did not decode as the message its tag announced.
    #[error("Failed to decode {kind}: {reason}")]
    MessageDecode { kind: String, reason: String },

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// A field required for login or registration is absent.
    #[error("Missing credential field: {0}")]
    MissingCredential(&'static str),

    /// A credential field is present but malformed.
    #[error("Invalid credential field {field}: {reason}")]
    InvalidCredential { field: &'static str, reason: String },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// The push data carried no FMDN payload field.
    #[error("Push data carries no FMDN payload")]
    MissingPayload,

    /// The payload field was not valid base64.
    #[error("Payload encoding error: {0}")]
    PayloadEncoding(String),

    /// The payload bytes did not decode far enough to find the device id.
    #[error("Payload decode error: {0}")]
    PayloadDecode(String),
}

impl CoreError {
    /// Returns true if the error means the stream itself is corrupt.
    ///
    /// Framing errors leave the byte stream out of sync, so the connection
    /// must be torn down; a single undecodable message body does not.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::VarintTooLong | CoreError::FrameTooLarge { .. } | CoreError::UnsupportedVersion(_)
        )
    }
}
