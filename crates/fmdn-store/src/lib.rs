//! # fmdn-store: Key-Value Storage for FMDN Push
//!
//! The storage collaborator the push runtime consumes: async `get`/`set` per
//! tenant namespace.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  TenantSupervisor (fmdn-push)                                          │
//! │       │  credentials / routing tokens                                  │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fmdn-store (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │ KeyValueStore │    │  SqliteStore  │    │  Migrations  │  │   │
//! │  │   │   (kv.rs)     │◄───│  (pool.rs)    │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ MemoryStore   │    │ SqlitePool    │    │ 001_kv_store │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fmdn_store::{KeyValueStore, SqliteStore, StoreConfig};
//!
//! let store = SqliteStore::new(StoreConfig::new("./fmdn.db")).await?;
//! store.set("alice@example.com", "fcm_credentials", "{...}").await?;
//! let blob = store.get("alice@example.com", "fcm_credentials").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod kv;
pub mod migrations;
pub mod pool;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use kv::{KeyValueStore, MemoryStore};
pub use pool::{SqliteStore, StoreConfig};
