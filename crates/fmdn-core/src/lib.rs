//! # fmdn-core: Pure Types and Codecs for FMDN Push
//!
//! Everything the push transport needs to know about bytes on the wire, with
//! zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FMDN Push Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              fmdn-push (connections, HTTP, tasks)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fmdn-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   wire    │  │  message  │  │credentials│  │  payload  │  │   │
//! │  │   │  varint   │  │ McsMessage│  │ GCM / FCM │  │ device id │  │   │
//! │  │   │  frames   │  │  proto    │  │  web push │  │  routing  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO SOCKETS • NO TIMERS • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`wire`] - MCS tags, varint32 and frame encoding
//! - [`proto`] - Protobuf messages (MCS + GCM check-in)
//! - [`message`] - Typed MCS messages and request builders
//! - [`credentials`] - Credentials blob persisted per tenant
//! - [`gcm`] - GCM register reply parsing
//! - [`payload`] - Routing fields of the FMDN payload
//! - [`types`] - Tenant ids, push envelopes, location records
//! - [`error`] - Codec error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod credentials;
pub mod error;
pub mod gcm;
pub mod message;
pub mod payload;
pub mod proto;
pub mod types;
pub mod wire;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use credentials::{Credentials, FcmCredentials, GcmCredentials, InstallationCredentials, WebPushKeys};
pub use error::{CoreError, CoreResult};
pub use message::McsMessage;
pub use types::{InboundPush, LocationRecord, PushEnvelope, TenantId};
pub use wire::{McsTag, VarintDecoder};
