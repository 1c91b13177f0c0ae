//! # MCS Messages
//!
//! Typed view over frames: decode a `(tag, payload)` pair into a message,
//! encode a message back into its tag and body, and build the requests the
//! client originates (login, heartbeats, selective acks).

use prost::Message;

use crate::error::{CoreError, CoreResult};
use crate::proto::{
    iq_type, Close, DataMessageStanza, Extension, HeartbeatAck, HeartbeatPing, HeartbeatStat,
    IqStanza, LoginRequest, LoginResponse, SelectiveAck, Setting, StreamErrorStanza,
    AUTH_SERVICE_ANDROID_ID,
};
use crate::wire::{McsTag, RawFrame};

// =============================================================================
// Constants
// =============================================================================

/// Client id presented in the login request.
pub const LOGIN_CLIENT_ID: &str = "chrome-63.0.3234.0";

/// Login domain.
pub const LOGIN_DOMAIN: &str = "mcs.c2dm.gmail.com";

/// IQ extension id carrying a [`SelectiveAck`].
pub const SELECTIVE_ACK_EXTENSION_ID: i32 = 12;

/// `LoginRequest.network_type` for a wired/wifi connection.
const NETWORK_TYPE_WIFI: i32 = 1;

// =============================================================================
// McsMessage
// =============================================================================

/// One decoded MCS message.
#[derive(Debug, Clone, PartialEq)]
pub enum McsMessage {
    HeartbeatPing(HeartbeatPing),
    HeartbeatAck(HeartbeatAck),
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    Close,
    IqStanza(IqStanza),
    DataMessage(DataMessageStanza),
    StreamError(StreamErrorStanza),
    /// A frame whose tag we recognize but do not act on, or do not know.
    Unhandled { tag: u8, len: usize },
}

fn decode_as<M: Message + Default>(kind: &str, payload: &[u8]) -> CoreResult<M> {
    M::decode(payload).map_err(|e| CoreError::MessageDecode {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl McsMessage {
    /// Decodes a raw frame.
    pub fn decode(frame: &RawFrame) -> CoreResult<Self> {
        let payload = frame.payload.as_slice();
        let tag = match McsTag::try_from(frame.tag) {
            Ok(tag) => tag,
            Err(tag) => {
                return Ok(McsMessage::Unhandled {
                    tag,
                    len: payload.len(),
                })
            }
        };

        Ok(match tag {
            McsTag::HeartbeatPing => McsMessage::HeartbeatPing(decode_as("HeartbeatPing", payload)?),
            McsTag::HeartbeatAck => McsMessage::HeartbeatAck(decode_as("HeartbeatAck", payload)?),
            McsTag::LoginRequest => McsMessage::LoginRequest(decode_as("LoginRequest", payload)?),
            McsTag::LoginResponse => McsMessage::LoginResponse(decode_as("LoginResponse", payload)?),
            McsTag::Close => McsMessage::Close,
            McsTag::IqStanza => McsMessage::IqStanza(decode_as("IqStanza", payload)?),
            McsTag::DataMessageStanza => McsMessage::DataMessage(decode_as("DataMessageStanza", payload)?),
            McsTag::StreamErrorStanza => McsMessage::StreamError(decode_as("StreamErrorStanza", payload)?),
            other => McsMessage::Unhandled {
                tag: other.as_u8(),
                len: payload.len(),
            },
        })
    }

    /// Encodes the message body and returns it with its tag.
    ///
    /// Returns `None` for [`McsMessage::Unhandled`], which has no body to send.
    pub fn encode(&self) -> Option<(McsTag, Vec<u8>)> {
        Some(match self {
            McsMessage::HeartbeatPing(m) => (McsTag::HeartbeatPing, m.encode_to_vec()),
            McsMessage::HeartbeatAck(m) => (McsTag::HeartbeatAck, m.encode_to_vec()),
            McsMessage::LoginRequest(m) => (McsTag::LoginRequest, m.encode_to_vec()),
            McsMessage::LoginResponse(m) => (McsTag::LoginResponse, m.encode_to_vec()),
            McsMessage::Close => (McsTag::Close, Close {}.encode_to_vec()),
            McsMessage::IqStanza(m) => (McsTag::IqStanza, m.encode_to_vec()),
            McsMessage::DataMessage(m) => (McsTag::DataMessageStanza, m.encode_to_vec()),
            McsMessage::StreamError(m) => (McsTag::StreamErrorStanza, m.encode_to_vec()),
            McsMessage::Unhandled { .. } => return None,
        })
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            McsMessage::HeartbeatPing(_) => "HeartbeatPing",
            McsMessage::HeartbeatAck(_) => "HeartbeatAck",
            McsMessage::LoginRequest(_) => "LoginRequest",
            McsMessage::LoginResponse(_) => "LoginResponse",
            McsMessage::Close => "Close",
            McsMessage::IqStanza(_) => "IqStanza",
            McsMessage::DataMessage(_) => "DataMessageStanza",
            McsMessage::StreamError(_) => "StreamErrorStanza",
            McsMessage::Unhandled { .. } => "Unhandled",
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

/// Builds the login request for a session.
///
/// `persistent_ids` are the ids received since the last successful login, in
/// receipt order; the server skips re-delivering them. When
/// `server_heartbeat_ms` is set the server is asked to ping at that interval.
pub fn login_request(
    android_id: u64,
    security_token: u64,
    persistent_ids: &[String],
    server_heartbeat_ms: Option<u32>,
) -> McsMessage {
    let android_id_str = android_id.to_string();
    let mut setting = vec![Setting {
        name: "new_vc".into(),
        value: "1".into(),
    }];
    if let Some(interval_ms) = server_heartbeat_ms {
        setting.push(Setting {
            name: "hbping".into(),
            value: interval_ms.to_string(),
        });
    }
    McsMessage::LoginRequest(LoginRequest {
        id: LOGIN_CLIENT_ID.to_string(),
        domain: LOGIN_DOMAIN.to_string(),
        user: android_id_str.clone(),
        resource: android_id_str,
        auth_token: security_token.to_string(),
        device_id: Some(format!("android-{:x}", android_id)),
        setting,
        received_persistent_id: persistent_ids.to_vec(),
        adaptive_heartbeat: Some(false),
        heartbeat_stat: server_heartbeat_ms.map(|interval_ms| HeartbeatStat {
            ip: String::new(),
            timeout: true,
            interval_ms: interval_ms.min(i32::MAX as u32) as i32,
        }),
        use_rmq2: Some(true),
        auth_service: Some(AUTH_SERVICE_ANDROID_ID),
        network_type: Some(NETWORK_TYPE_WIFI),
        ..Default::default()
    })
}

/// Builds a client heartbeat ping.
pub fn heartbeat_ping(last_stream_id_received: i32) -> McsMessage {
    McsMessage::HeartbeatPing(HeartbeatPing {
        last_stream_id_received: Some(last_stream_id_received),
        ..Default::default()
    })
}

/// Builds the reply to a server heartbeat ping.
pub fn heartbeat_ack(last_stream_id_received: i32) -> McsMessage {
    McsMessage::HeartbeatAck(HeartbeatAck {
        last_stream_id_received: Some(last_stream_id_received),
        ..Default::default()
    })
}

/// Builds the IQ stanza acknowledging one persistent id.
pub fn selective_ack(persistent_id: &str) -> McsMessage {
    let ack = SelectiveAck {
        id: vec![persistent_id.to_string()],
    };
    McsMessage::IqStanza(IqStanza {
        r#type: iq_type::SET,
        id: String::new(),
        extension: Some(Extension {
            id: SELECTIVE_ACK_EXTENSION_ID,
            data: ack.encode_to_vec(),
        }),
        ..Default::default()
    })
}

/// Extracts the acknowledged ids from a selective-ack IQ stanza.
pub fn selective_ack_ids(iq: &IqStanza) -> Vec<String> {
    iq.extension
        .as_ref()
        .filter(|ext| ext.id == SELECTIVE_ACK_EXTENSION_ID)
        .and_then(|ext| SelectiveAck::decode(ext.data.as_slice()).ok())
        .map(|ack| ack.id)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: &McsMessage) -> RawFrame {
        let (tag, payload) = message.encode().unwrap();
        RawFrame {
            tag: tag.as_u8(),
            payload,
        }
    }

    #[test]
    fn test_login_request_contents() {
        let ids = vec!["0:1%abc".to_string(), "0:2%def".to_string()];
        let message = login_request(0x1f, 99, &ids, Some(10_000));
        let McsMessage::LoginRequest(req) = McsMessage::decode(&frame(&message)).unwrap() else {
            panic!("expected login request");
        };

        assert_eq!(req.id, LOGIN_CLIENT_ID);
        assert_eq!(req.domain, LOGIN_DOMAIN);
        assert_eq!(req.user, "31");
        assert_eq!(req.resource, "31");
        assert_eq!(req.auth_token, "99");
        assert_eq!(req.device_id.as_deref(), Some("android-1f"));
        assert_eq!(req.received_persistent_id, ids);
        assert_eq!(req.heartbeat_stat.unwrap().interval_ms, 10_000);
        assert_eq!(req.auth_service, Some(AUTH_SERVICE_ANDROID_ID));
        assert_eq!(req.setting[0].name, "new_vc");
    }

    #[test]
    fn test_login_without_server_heartbeat() {
        let McsMessage::LoginRequest(req) = login_request(1, 2, &[], None) else {
            panic!("expected login request");
        };
        assert!(req.heartbeat_stat.is_none());
        assert!(req.received_persistent_id.is_empty());
    }

    #[test]
    fn test_selective_ack_carries_id() {
        let McsMessage::IqStanza(iq) = selective_ack("0:42%xyz") else {
            panic!("expected iq stanza");
        };
        assert_eq!(iq.r#type, iq_type::SET);
        assert_eq!(selective_ack_ids(&iq), vec!["0:42%xyz".to_string()]);
    }

    #[test]
    fn test_unknown_tag_is_unhandled() {
        let raw = RawFrame {
            tag: 42,
            payload: vec![1, 2, 3],
        };
        assert_eq!(
            McsMessage::decode(&raw).unwrap(),
            McsMessage::Unhandled { tag: 42, len: 3 }
        );
    }

    #[test]
    fn test_close_and_presence_tags() {
        let close = RawFrame { tag: 4, payload: vec![] };
        assert_eq!(McsMessage::decode(&close).unwrap(), McsMessage::Close);

        let presence = RawFrame { tag: 6, payload: vec![] };
        assert_eq!(McsMessage::decode(&presence).unwrap().kind(), "Unhandled");
    }

    #[test]
    fn test_corrupt_body_reports_kind() {
        let raw = RawFrame {
            tag: McsTag::LoginResponse.as_u8(),
            payload: vec![0x0a, 0x05, b'a'],
        };
        match McsMessage::decode(&raw) {
            Err(CoreError::MessageDecode { kind, .. }) => assert_eq!(kind, "LoginResponse"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
