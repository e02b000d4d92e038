//! Typed session messages.
//!
//! The client drives events; the host replies or notifies. Field names on
//! the wire are CamelCase and must match the client exactly, so every
//! field carries an explicit rename.
//!
//! Inbound parsing is two-step: first a loose [`Envelope`] to read the
//! `Event` discriminator and `SessionID`, then the concrete struct once
//! the engine has decided the message is addressed to the live session.

use serde::{Deserialize, Serialize};

/// The only protocol revision this host speaks.
pub const PROTOCOL_VERSION: &str = "1";

pub type SessionId = String;
pub type ClientId = String;

/// Session lifecycle states as announced by the client. The host never
/// invents transitions; it only reacts to what arrives on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Waiting,
    Connecting,
    Connected,
    Paused,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "WAITING",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Disconnected => "DISCONNECTED",
        }
    }
}

/// Loose first-pass view of any inbound frame. Both fields are optional;
/// the engine ignores frames where either is missing.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Event")]
    pub event: Option<String>,
    #[serde(rename = "SessionID")]
    pub session_id: Option<String>,
}

impl Envelope {
    /// Parse the discriminator out of a frame payload. Returns `None`
    /// for anything that is not a JSON object.
    pub fn peek(payload: &str) -> Option<Envelope> {
        serde_json::from_str(payload).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConnection {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "StreamingProvider", default)]
    pub streaming_provider: Option<String>,
    #[serde(rename = "StreamingProviderVersion", default)]
    pub streaming_provider_version: Option<String>,
    #[serde(rename = "UserInterfaceIdiom", default)]
    pub user_interface_idiom: Option<String>,
    #[serde(rename = "SessionID")]
    pub session_id: SessionId,
    #[serde(rename = "ClientID")]
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBarcodePresentation {
    #[serde(rename = "SessionID")]
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusDidChange {
    #[serde(rename = "SessionID")]
    pub session_id: SessionId,
    #[serde(rename = "Status")]
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSessionDisconnect {
    #[serde(rename = "SessionID")]
    pub session_id: SessionId,
}

/// Host-to-client messages. `RequestSessionDisconnect` also flows in the
/// other direction; the inbound form is parsed as the struct above.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "Event")]
pub enum ServerMessage {
    AcknowledgeConnection {
        #[serde(rename = "SessionID")]
        session_id: SessionId,
        #[serde(rename = "ServerID")]
        server_id: String,
        // Omitted from the wire entirely when the host wants the client
        // to fall back to QR pairing; never serialized as null.
        #[serde(
            rename = "CertificateFingerprint",
            skip_serializing_if = "Option::is_none",
            default
        )]
        certificate_fingerprint: Option<String>,
    },
    AcknowledgeBarcodePresentation {
        #[serde(rename = "SessionID")]
        session_id: SessionId,
    },
    MediaStreamIsReady {
        #[serde(rename = "SessionID")]
        session_id: SessionId,
    },
    RequestSessionDisconnect {
        #[serde(rename = "SessionID")]
        session_id: SessionId,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_peeks_event_and_session() {
        let env = Envelope::peek(r#"{"Event":"SessionStatusDidChange","SessionID":"S1","Status":"WAITING"}"#)
            .expect("object");
        assert_eq!(env.event.as_deref(), Some("SessionStatusDidChange"));
        assert_eq!(env.session_id.as_deref(), Some("S1"));
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env = Envelope::peek(r#"{"Foo":1}"#).expect("object");
        assert!(env.event.is_none());
        assert!(env.session_id.is_none());
    }

    #[test]
    fn envelope_rejects_malformed_json() {
        assert!(Envelope::peek("not json").is_none());
        assert!(Envelope::peek("").is_none());
    }

    #[test]
    fn ack_serializes_fingerprint_when_present() {
        let msg = ServerMessage::AcknowledgeConnection {
            session_id: "S1".into(),
            server_id: "ab".repeat(16),
            certificate_fingerprint: Some("F1".into()),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["Event"], "AcknowledgeConnection");
        assert_eq!(json["SessionID"], "S1");
        assert_eq!(json["CertificateFingerprint"], "F1");
    }

    #[test]
    fn ack_omits_fingerprint_key_when_absent() {
        let msg = ServerMessage::AcknowledgeConnection {
            session_id: "S1".into(),
            server_id: "ab".repeat(16),
            certificate_fingerprint: None,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("CertificateFingerprint"));
    }

    #[test]
    fn status_tokens_are_uppercase() {
        for (status, token) in [
            (SessionStatus::Waiting, "\"WAITING\""),
            (SessionStatus::Connecting, "\"CONNECTING\""),
            (SessionStatus::Connected, "\"CONNECTED\""),
            (SessionStatus::Paused, "\"PAUSED\""),
            (SessionStatus::Disconnected, "\"DISCONNECTED\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), token);
        }
    }

    #[test]
    fn request_connection_parses_wire_shape() {
        let payload = r#"{
            "Event": "RequestConnection",
            "ProtocolVersion": "1",
            "StreamingProvider": "cloudxr",
            "StreamingProviderVersion": "6.0.0",
            "UserInterfaceIdiom": "headset",
            "SessionID": "S1",
            "ClientID": "C1"
        }"#;
        let req: RequestConnection = serde_json::from_str(payload).unwrap();
        assert_eq!(req.protocol_version, PROTOCOL_VERSION);
        assert_eq!(req.session_id, "S1");
        assert_eq!(req.client_id, "C1");
        assert_eq!(req.streaming_provider.as_deref(), Some("cloudxr"));
    }

    #[test]
    fn disconnect_event_tag_round_trips() {
        let msg = ServerMessage::RequestSessionDisconnect {
            session_id: "S2".into(),
        };
        let bytes = msg.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["Event"], "RequestSessionDisconnect");
        let parsed: RequestSessionDisconnect = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.session_id, "S2");
    }
}
