//! # Protobuf Messages
//!
//! Hand-declared `prost` messages for the MCS stream and the GCM check-in
//! endpoint. Field numbers follow the published `mcs.proto` and
//! `checkin.proto` schemas (proto2), so `required` fields are always emitted.
//!
//! Only the fields this client reads or writes are declared; unknown fields
//! are skipped by the decoder.

// =============================================================================
// MCS: Heartbeats
// =============================================================================

/// Tag 0: keepalive ping (either direction).
#[derive(Clone, PartialEq, prost::Message)]
pub struct HeartbeatPing {
    #[prost(int32, optional, tag = "1")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub last_stream_id_received: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub status: Option<i64>,
}

/// Tag 1: keepalive acknowledgement.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HeartbeatAck {
    #[prost(int32, optional, tag = "1")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub last_stream_id_received: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub status: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HeartbeatStat {
    #[prost(string, required, tag = "1")]
    pub ip: String,
    #[prost(bool, required, tag = "2")]
    pub timeout: bool,
    #[prost(int32, required, tag = "3")]
    pub interval_ms: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HeartbeatConfig {
    #[prost(bool, optional, tag = "1")]
    pub upload_stat: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub ip: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub interval_ms: Option<i32>,
}

// =============================================================================
// MCS: Login
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorInfo {
    #[prost(int32, required, tag = "1")]
    pub code: i32,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub r#type: Option<String>,
    #[prost(message, optional, tag = "4")]
    pub extension: Option<Extension>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Setting {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(string, required, tag = "2")]
    pub value: String,
}

/// `LoginRequest.auth_service` value for android-id authentication.
pub const AUTH_SERVICE_ANDROID_ID: i32 = 2;

/// Tag 2: first message of every session.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginRequest {
    #[prost(string, required, tag = "1")]
    pub id: String,
    #[prost(string, required, tag = "2")]
    pub domain: String,
    #[prost(string, required, tag = "3")]
    pub user: String,
    #[prost(string, required, tag = "4")]
    pub resource: String,
    #[prost(string, required, tag = "5")]
    pub auth_token: String,
    #[prost(string, optional, tag = "6")]
    pub device_id: Option<String>,
    #[prost(int64, optional, tag = "7")]
    pub last_rmq_id: Option<i64>,
    #[prost(message, repeated, tag = "8")]
    pub setting: Vec<Setting>,
    #[prost(string, repeated, tag = "10")]
    pub received_persistent_id: Vec<String>,
    #[prost(bool, optional, tag = "12")]
    pub adaptive_heartbeat: Option<bool>,
    #[prost(message, optional, tag = "13")]
    pub heartbeat_stat: Option<HeartbeatStat>,
    #[prost(bool, optional, tag = "14")]
    pub use_rmq2: Option<bool>,
    #[prost(int64, optional, tag = "15")]
    pub account_id: Option<i64>,
    #[prost(int32, optional, tag = "16")]
    pub auth_service: Option<i32>,
    #[prost(int32, optional, tag = "17")]
    pub network_type: Option<i32>,
    #[prost(int64, optional, tag = "18")]
    pub status: Option<i64>,
}

/// Tag 3: server verdict on the login request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginResponse {
    #[prost(string, required, tag = "1")]
    pub id: String,
    #[prost(string, optional, tag = "2")]
    pub jid: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<ErrorInfo>,
    #[prost(message, repeated, tag = "4")]
    pub setting: Vec<Setting>,
    #[prost(int32, optional, tag = "5")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub last_stream_id_received: Option<i32>,
    #[prost(message, optional, tag = "7")]
    pub heartbeat_config: Option<HeartbeatConfig>,
    #[prost(int64, optional, tag = "8")]
    pub server_timestamp: Option<i64>,
}

/// Tag 4: either side ends the session.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Close {}

/// Tag 10: server-side stream failure.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamErrorStanza {
    #[prost(string, required, tag = "1")]
    pub r#type: String,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
}

// =============================================================================
// MCS: IQ and Selective Ack
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct Extension {
    #[prost(int32, required, tag = "1")]
    pub id: i32,
    #[prost(bytes = "vec", required, tag = "2")]
    pub data: Vec<u8>,
}

/// `IqStanza.type` values.
pub mod iq_type {
    pub const GET: i32 = 0;
    pub const SET: i32 = 1;
    pub const RESULT: i32 = 2;
    pub const IQ_ERROR: i32 = 3;
}

/// Tag 7: info/query stanza; carries selective acks.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IqStanza {
    #[prost(int64, optional, tag = "1")]
    pub rmq_id: Option<i64>,
    #[prost(int32, required, tag = "2")]
    pub r#type: i32,
    #[prost(string, required, tag = "3")]
    pub id: String,
    #[prost(string, optional, tag = "4")]
    pub from: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub to: Option<String>,
    #[prost(message, optional, tag = "6")]
    pub error: Option<ErrorInfo>,
    #[prost(message, optional, tag = "7")]
    pub extension: Option<Extension>,
    #[prost(string, optional, tag = "8")]
    pub persistent_id: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "10")]
    pub last_stream_id_received: Option<i32>,
    #[prost(int64, optional, tag = "11")]
    pub account_id: Option<i64>,
    #[prost(int64, optional, tag = "12")]
    pub status: Option<i64>,
}

/// Body of the selective-ack IQ extension.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SelectiveAck {
    #[prost(string, repeated, tag = "1")]
    pub id: Vec<String>,
}

// =============================================================================
// MCS: Data Messages
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppData {
    #[prost(string, required, tag = "1")]
    pub key: String,
    #[prost(string, required, tag = "2")]
    pub value: String,
}

/// Tag 8: an actual push.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataMessageStanza {
    #[prost(string, optional, tag = "2")]
    pub id: Option<String>,
    #[prost(string, required, tag = "3")]
    pub from: String,
    #[prost(string, optional, tag = "4")]
    pub to: Option<String>,
    #[prost(string, required, tag = "5")]
    pub category: String,
    #[prost(string, optional, tag = "6")]
    pub token: Option<String>,
    #[prost(message, repeated, tag = "7")]
    pub app_data: Vec<AppData>,
    #[prost(bool, optional, tag = "8")]
    pub from_trusted_server: Option<bool>,
    #[prost(string, optional, tag = "9")]
    pub persistent_id: Option<String>,
    #[prost(int32, optional, tag = "10")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "11")]
    pub last_stream_id_received: Option<i32>,
    #[prost(string, optional, tag = "13")]
    pub reg_id: Option<String>,
    #[prost(int64, optional, tag = "16")]
    pub device_user_id: Option<i64>,
    #[prost(int32, optional, tag = "17")]
    pub ttl: Option<i32>,
    #[prost(int64, optional, tag = "18")]
    pub sent: Option<i64>,
    #[prost(int32, optional, tag = "19")]
    pub queued: Option<i32>,
    #[prost(int64, optional, tag = "20")]
    pub status: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "21")]
    pub raw_data: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "24")]
    pub immediate_ack: Option<bool>,
}

impl DataMessageStanza {
    /// Returns the value of an app-data entry.
    pub fn app_data_value(&self, key: &str) -> Option<&str> {
        self.app_data
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_str())
    }
}

// =============================================================================
// GCM Check-in
// =============================================================================

/// `AndroidCheckinProto.type` for a Chrome browser install.
pub const DEVICE_CHROME_BROWSER: i32 = 3;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChromeBuildProto {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub chrome_version: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub channel: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AndroidCheckinProto {
    #[prost(int64, optional, tag = "2")]
    pub last_checkin_msec: Option<i64>,
    #[prost(string, optional, tag = "6")]
    pub cell_operator: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub sim_operator: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub roaming: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub user_number: Option<i32>,
    #[prost(int32, optional, tag = "12")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "13")]
    pub chrome_build: Option<ChromeBuildProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AndroidCheckinRequest {
    #[prost(string, optional, tag = "1")]
    pub imei: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub id: Option<i64>,
    #[prost(string, optional, tag = "3")]
    pub digest: Option<String>,
    #[prost(message, optional, tag = "4")]
    pub checkin: Option<AndroidCheckinProto>,
    #[prost(string, optional, tag = "6")]
    pub locale: Option<String>,
    #[prost(string, optional, tag = "12")]
    pub time_zone: Option<String>,
    #[prost(fixed64, optional, tag = "13")]
    pub security_token: Option<u64>,
    #[prost(int32, optional, tag = "14")]
    pub version: Option<i32>,
    #[prost(int32, optional, tag = "20")]
    pub fragment: Option<i32>,
    #[prost(int32, optional, tag = "22")]
    pub user_serial_number: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AndroidCheckinResponse {
    #[prost(bool, required, tag = "1")]
    pub stats_ok: bool,
    #[prost(int64, optional, tag = "3")]
    pub time_msec: Option<i64>,
    #[prost(string, optional, tag = "4")]
    pub digest: Option<String>,
    #[prost(fixed64, optional, tag = "7")]
    pub android_id: Option<u64>,
    #[prost(fixed64, optional, tag = "8")]
    pub security_token: Option<u64>,
    #[prost(string, optional, tag = "11")]
    pub version_info: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_checkin_response_fixed64_fields() {
        let response = AndroidCheckinResponse {
            stats_ok: true,
            android_id: Some(0x1234_5678_9abc_def0),
            security_token: Some(42),
            ..Default::default()
        };
        let bytes = response.encode_to_vec();
        // field 7, wire type 1 (64-bit)
        assert!(bytes.contains(&((7 << 3) | 1)));
        let decoded = AndroidCheckinResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.android_id, Some(0x1234_5678_9abc_def0));
    }

    #[test]
    fn test_app_data_lookup() {
        let stanza = DataMessageStanza {
            app_data: vec![
                AppData { key: "crypto-key".into(), value: "dh=abc".into() },
                AppData { key: "encryption".into(), value: "salt=xyz".into() },
            ],
            ..Default::default()
        };
        assert_eq!(stanza.app_data_value("encryption"), Some("salt=xyz"));
        assert_eq!(stanza.app_data_value("missing"), None);
    }

    #[test]
    fn test_iq_required_fields_always_emitted() {
        let iq = IqStanza {
            r#type: iq_type::SET,
            id: String::new(),
            ..Default::default()
        };
        let bytes = iq.encode_to_vec();
        // type=1 (field 2, varint) followed by id="" (field 3, length 0)
        assert_eq!(bytes, vec![0x10, 0x01, 0x1a, 0x00]);
    }
}
