//! # FMDN Payload Routing Fields
//!
//! A location push carries a base64 protobuf `DeviceUpdate` under a single
//! data key. Routing only needs the device's canonic id, so this module
//! declares just the path down to it and leaves the rest of the message
//! (and its encrypted location reports) to the decrypt collaborator.
//!
//! ```text
//! DeviceUpdate
//!   └─ 3: DeviceMetadata
//!          └─ 1: IdentifierInformation
//!                 └─ 3: CanonicIds
//!                        └─ 1: repeated CanonicId
//!                                 └─ 1: id (string)
//! ```

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use prost::Message;

use crate::error::{CoreError, CoreResult};

/// Data key holding the base64 `DeviceUpdate`.
pub const FMDN_PAYLOAD_KEY: &str = "com.google.android.apps.adm.FCM_PAYLOAD";

#[derive(Clone, PartialEq, prost::Message)]
struct CanonicId {
    #[prost(string, optional, tag = "1")]
    id: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct CanonicIds {
    #[prost(message, repeated, tag = "1")]
    canonic_id: Vec<CanonicId>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct IdentifierInformation {
    #[prost(message, optional, tag = "3")]
    canonic_ids: Option<CanonicIds>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct DeviceMetadata {
    #[prost(message, optional, tag = "1")]
    identifier_information: Option<IdentifierInformation>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct DeviceUpdate {
    #[prost(message, optional, tag = "3")]
    device_metadata: Option<DeviceMetadata>,
}

/// Pulls the raw `DeviceUpdate` bytes out of a decrypted push body.
///
/// FCM nests custom data under `"data"`; bodies without that wrapper are
/// searched at the top level.
pub fn fmdn_payload(body: &serde_json::Value) -> CoreResult<Vec<u8>> {
    let encoded = body
        .get("data")
        .and_then(|data| data.get(FMDN_PAYLOAD_KEY))
        .or_else(|| body.get(FMDN_PAYLOAD_KEY))
        .and_then(|value| value.as_str())
        .ok_or(CoreError::MissingPayload)?;

    let trimmed = encoded.trim();
    STANDARD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .map_err(|e| CoreError::PayloadEncoding(e.to_string()))
}

/// Returns the canonic device id of a `DeviceUpdate`.
pub fn canonic_device_id(payload: &[u8]) -> CoreResult<String> {
    let update = DeviceUpdate::decode(payload).map_err(|e| CoreError::PayloadDecode(e.to_string()))?;
    update
        .device_metadata
        .and_then(|m| m.identifier_information)
        .and_then(|i| i.canonic_ids)
        .and_then(|ids| ids.canonic_id.into_iter().find_map(|c| c.id.filter(|id| !id.is_empty())))
        .ok_or_else(|| CoreError::PayloadDecode("no canonic device id".into()))
}

/// Encodes a minimal `DeviceUpdate` naming `device_id`.
///
/// Used by hosts and tests that need to fabricate a routable payload.
pub fn encode_device_update(device_id: &str) -> Vec<u8> {
    DeviceUpdate {
        device_metadata: Some(DeviceMetadata {
            identifier_information: Some(IdentifierInformation {
                canonic_ids: Some(CanonicIds {
                    canonic_id: vec![CanonicId {
                        id: Some(device_id.to_string()),
                    }],
                }),
            }),
        }),
    }
    .encode_to_vec()
}
