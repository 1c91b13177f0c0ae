//! # fmdn-push: Push Transport for Find My Device Network Location Updates
//!
//! Receives location pushes for many signed-in accounts (tenants) over
//! Google's MCS protocol and hands decoded updates to the consumers that
//! track the devices.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Push Transport Architecture                      │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SharedReceiver (host-facing façade)             │  │
//! │  │                                                                  │  │
//! │  │  register_consumer / register_for_location_updates               │  │
//! │  │  acquired and released through ReceiverLease                     │  │
//! │  └───────────────┬──────────────────────────────────┬───────────────┘  │
//! │                  │ one per tenant                    │                  │
//! │                  ▼                                   ▼                  │
//! │  ┌────────────────────────────┐        ┌──────────────────────────┐    │
//! │  │ TenantSupervisor           │        │ Router                   │    │
//! │  │                            │        │                          │    │
//! │  │ credentials + backoff loop │        │ token → tenant routing   │    │
//! │  │ RegistrationClient (HTTP)  │        │ 250ms debounce per device│    │
//! │  │ McsConnection (TLS)        │──mpsc─►│ manual-locate callbacks  │    │
//! │  └────────────────────────────┘        │ consumer fan-out         │    │
//! │                                        └──────────────────────────┘    │
//! │                                                                         │
//! │  Persistence: TenantStore over fmdn-store (credentials, push tokens)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Layered configuration (defaults, TOML file, environment)
//! - [`error`] - Error types and classification
//! - [`retry`] - Capped exponential pacing with jitter
//! - [`webpush`] - Web push keys and `aesgcm` decryption
//! - [`mcs`] - MCS connection state machine and frame transport
//! - [`registration`] - GCM check-in, GCM register, FCM install/register
//! - [`supervisor`] - Per-tenant supervision loop
//! - [`routing`] - Token table, route resolution, consumer registries
//! - [`router`] - Debounce and fan-out task
//! - [`receiver`] - Shared receiver and its lease
//! - [`store`] - Per-tenant persistence
//! - [`consumer`] - Collaborator traits implemented by hosts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fmdn_push::{PushConfig, ReceiverBuilder, ReceiverLease};
//!
//! let config = PushConfig::load(None)?;
//! let lease = ReceiverLease::new(ReceiverBuilder::new(config, store, decryptor));
//!
//! let receiver = lease.acquire().await?;
//! receiver.register_consumer(consumer).await?;
//!
//! let token = receiver
//!     .register_for_location_updates("device-id", Box::new(|device, record| {
//!         println!("{} is at {:?}", device, record.latitude);
//!     }))
//!     .await;
//!
//! lease.release().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod consumer;
pub mod error;
pub mod mcs;
pub mod receiver;
pub mod registration;
pub mod retry;
pub mod router;
pub mod routing;
pub mod store;
pub mod supervisor;
pub mod webpush;

#[cfg(test)]
mod testkit;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use config::{FcmSettings, McsSettings, PushConfig, RegistrationSettings, RouterSettings, SupervisorSettings};
pub use consumer::{Consumer, LocationDecryptor, ManualLocateCallback, OwnerIndex};
pub use error::{PushError, PushResult, RegistrationStage};
pub use mcs::{McsConnection, RunState, TlsDialer};
pub use receiver::{ReceiverBuilder, ReceiverLease, SharedReceiver};
pub use registration::RegistrationClient;
pub use router::Router;
pub use routing::{Route, RouteSource, TokenRoutingTable};
pub use store::TenantStore;
pub use supervisor::{TenantStatus, TenantSupervisor};
pub use webpush::{generate_keys, WebPushDecryptor};
