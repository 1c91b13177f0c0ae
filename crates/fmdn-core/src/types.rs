//! # Domain Types
//!
//! Values that flow between the MCS connection, the router and consumers.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DataMessageStanza ──decrypt──► PushEnvelope                            │
//! │                                      │                                  │
//! │                     InboundPush { origin, envelope }                    │
//! │                                      │  (mpsc channel)                  │
//! │                                      ▼                                  │
//! │                              router task ──decrypt collaborator──►      │
//! │                                                   LocationRecord        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Tenant Identifier
// =============================================================================

/// Identifies one tenant (a signed-in account with its own push identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id.
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        TenantId(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        TenantId(id)
    }
}

// =============================================================================
// Push Envelope
// =============================================================================

/// A decrypted data message as delivered by one MCS connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    /// Server-assigned persistent id (used for acknowledgement and replay).
    pub persistent_id: String,

    /// Push token the message was addressed to, when the server supplied one.
    #[serde(default)]
    pub destination_token: Option<String>,

    /// Sender of the message.
    #[serde(default)]
    pub from: String,

    /// Message category (the web push application id).
    #[serde(default)]
    pub category: String,

    /// Server send time in milliseconds since the epoch.
    #[serde(default)]
    pub sent_at_ms: Option<i64>,

    /// Decrypted JSON body of the push.
    pub data: serde_json::Value,
}

/// Message handed from a connection's receive task to the routing task.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPush {
    /// Tenant whose MCS connection delivered the push. `None` for pushes
    /// injected by the host without a delivering connection.
    pub origin: Option<TenantId>,
    /// The decrypted envelope.
    pub envelope: PushEnvelope,
}

// =============================================================================
// Location Record
// =============================================================================

/// A decoded location report, as produced by the decrypt collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Canonic id of the device this record describes.
    pub device_id: String,

    /// Latitude in degrees.
    #[serde(default)]
    pub latitude: Option<f64>,

    /// Longitude in degrees.
    #[serde(default)]
    pub longitude: Option<f64>,

    /// Horizontal accuracy in meters.
    #[serde(default)]
    pub accuracy: Option<f64>,

    /// Altitude in meters.
    #[serde(default)]
    pub altitude: Option<f64>,

    /// Time the device was observed.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,

    /// Named place reported instead of coordinates (e.g. "Home").
    #[serde(default)]
    pub semantic_location: Option<String>,

    /// True if the report came from the owner's own phone.
    #[serde(default)]
    pub is_own_report: bool,
}

impl LocationRecord {
    /// Creates an empty record for a device.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        LocationRecord {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Returns true if the record carries coordinates.
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_display_and_order() {
        let a = TenantId::from("alice@example.com");
        let b = TenantId::new("bob@example.com");
        assert_eq!(a.to_string(), "alice@example.com");
        assert!(a < b);
    }

    #[test]
    fn test_tenant_id_serializes_as_string() {
        let id = TenantId::from("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");
    }

    #[test]
    fn test_location_record_coordinates() {
        let mut record = LocationRecord::for_device("dev-1");
        assert!(!record.has_coordinates());
        record.latitude = Some(52.5);
        record.longitude = Some(13.4);
        assert!(record.has_coordinates());
    }
}
