//! # Consumer Contracts
//!
//! The capability interfaces the runtime calls outward through.
//!
//! ```text
//! ┌───────────────────────┬───────────────────────────────────────────────┐
//! │ Trait                 │ Called by                                     │
//! ├───────────────────────┼───────────────────────────────────────────────┤
//! │ Consumer              │ router fan-out, receiver owner selection      │
//! │ LocationDecryptor     │ router, once per coalesced push and tenant    │
//! │ OwnerIndex            │ router, last-resort device → tenant lookup    │
//! │ ManualLocateCallback  │ router, once, for a request-correlated push   │
//! └───────────────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Every hook may run on a different task than the one that registered it.

use async_trait::async_trait;
use fmdn_core::{LocationRecord, TenantId};

use crate::error::PushResult;

/// A background consumer of location updates for one tenant.
pub trait Consumer: Send + Sync {
    /// Tenant this consumer belongs to.
    fn tenant_id(&self) -> &TenantId;

    /// Returns true if the consumer wants updates for `device_id`.
    fn is_tracked(&self, device_id: &str) -> bool;

    /// Returns true if the user excluded `device_id`.
    fn is_ignored(&self, _device_id: &str) -> bool {
        false
    }

    /// Returns true if the device is currently listed as present.
    fn device_present(&self, _device_id: &str) -> bool {
        false
    }

    /// Returns true if the consumer recognizes the device at all.
    fn knows_device(&self, _device_id: &str) -> bool {
        false
    }

    /// Stores a decoded location.
    fn update_cache(&self, device_id: &str, record: &LocationRecord) -> PushResult<()>;

    /// Asks the consumer to republish its state after a cache update.
    fn request_refresh(&self) {}
}

/// Decrypts the opaque location payload of a push.
#[async_trait]
pub trait LocationDecryptor: Send + Sync {
    async fn decrypt(&self, payload: &[u8], tenant: &TenantId) -> PushResult<LocationRecord>;
}

/// Global device → tenant index.
pub trait OwnerIndex: Send + Sync {
    fn owner_of(&self, device_id: &str) -> Option<TenantId>;
}

/// One-shot receiver of a request-correlated location.
pub type ManualLocateCallback = Box<dyn FnOnce(String, LocationRecord) + Send>;
