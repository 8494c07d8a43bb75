//! Wire messages exchanged between a client and the rendezvous server.
//!
//! Every inbound frame is a single JSON object carrying a `"type"` field;
//! every outbound frame is stamped with `server_tx` and, for messages caused
//! by an inbound frame, echoes that frame's `"id"`. See
//! [`crate::rendezvous::connection`] for how frames are dispatched.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

/// A message sent from the rendezvous server to the client.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// All server -> client messages have a `server_tx` timestamp (seconds since epoch, as a
    /// float), which records when the message left the server.
    pub server_tx: f64,
    /// Direct responses include a `server_rx` timestamp, to record when the client's command
    /// was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_rx: Option<f64>,
    #[serde(rename = "type")]
    #[serde(flatten)]
    pub ty: ServerMessageType,
}

/// A message sent from the client to the rendezvous server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Client -> server messages include a random id key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    #[serde(flatten)]
    pub ty: ClientMessageType,
}

/// An authentication method for access to the rendezvous server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMethod {
    /// No permission required, send a normal `bind`.
    None,
}

/// Welcome information sent from the rendezvous server to clients on connection.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct WelcomeInfo {
    /// This message is intended to inform users about performance problems, scheduled downtime,
    /// or to beg for donations to keep the server running. Clients should print it or otherwise
    /// display prominently to the user. The value should be a plain string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    /// The client should show this message to the user and then terminate. The value should be a
    /// plain string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A set of available authentication methods, proof of work challenges, etc. The client needs
    /// to "solve" one of them in order to get access to the service.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub permission_required: Vec<PermissionMethod>,
    /// Advertised server version, shown to clients on connect.
    pub current_cli_version: String,
}

/// Information about a nameplate, as listed by `list`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NameplateInfo {
    pub id: String,
}

/// Mood of the client. Reported to the server on `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    /// The PAKE key-establishment worked, and the client saw at least one valid encrypted message
    /// from its peer.
    Happy,
    /// The client gave up without hearing anything from its peer.
    Lonely,
    /// The client saw an invalid encrypted message from its peer, indicating that either the
    /// wormhole code was typed in wrong, or an attacker tried (and failed) to guess the code.
    Scary,
    /// The client encountered some other error: protocol problem or internal error.
    Errory,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Lonely => "lonely",
            Mood::Scary => "scary",
            Mood::Errory => "errory",
        }
    }
}

/// Phase tag on a message, opaque to the server but given special serialization
/// treatment for the two well-known handshake phases.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The initial PAKE message.
    Pake,
    /// An encrypted message with details of the peer's capabilities.
    Version,
    /// An encrypted application-specific message, numbered by the client.
    #[serde(untagged)]
    Message(#[serde_as(as = "DisplayFromStr")] usize),
}

impl Phase {
    pub fn as_string(&self) -> String {
        match self {
            Phase::Pake => "pake".to_string(),
            Phase::Version => "version".to_string(),
            Phase::Message(n) => n.to_string(),
        }
    }
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ServerMessageType {
    /// welcome {welcome: {current_cli_version:, motd?:, error?:, permission-required?:}}
    Welcome { welcome: WelcomeInfo },
    /// nameplates {nameplates: [{id: str},..]}
    Nameplates { nameplates: Vec<NameplateInfo> },
    /// allocated {nameplate:}
    Allocated {
        #[serde(rename = "nameplate")]
        nameplate: String,
    },
    /// claimed {mailbox:}
    Claimed {
        #[serde(rename = "mailbox")]
        mailbox_id: String,
    },
    /// released
    Released,
    /// message {side:, phase:, body:, id:}
    Message {
        side: String,
        phase: Phase,
        #[serde_as(as = "serde_with::hex::Hex")]
        body: Vec<u8>,
    },
    /// closed
    Closed,
    /// ack
    Ack,
    /// pong {pong: int}
    Pong { pong: u32 },
    /// error {error: str, orig:}
    Error {
        error: String,
        orig: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ClientMessageType {
    /// submit-permissions {..} (optional)
    SubmitPermissions,
    /// bind {appid:, side:}
    Bind {
        #[serde(rename = "appid")]
        app_id: String,
        side: String,
    },
    /// list {} -> nameplates
    List,
    /// allocate {} -> allocated
    Allocate,
    /// claim {nameplate:} -> claimed
    Claim {
        #[serde(rename = "nameplate")]
        nameplate: String,
    },
    /// release {nameplate:?} -> released
    Release {
        #[serde(rename = "nameplate")]
        nameplate: Option<String>,
    },
    /// open {mailbox:}
    Open {
        #[serde(rename = "mailbox")]
        mailbox_id: String,
    },
    /// add {phase: str, body: hex} -> message (to all connected clients, including self)
    Add {
        phase: Phase,
        #[serde_as(as = "serde_with::hex::Hex")]
        body: Vec<u8>,
    },
    /// close {mood:?} -> closed
    Close { mood: Option<Mood> },
    /// ping {ping: int} -> pong
    Ping { ping: u32 },
}

impl ServerMessage {
    /// Construct a message with the given `ty` information. The `server_tx` is automatically
    /// filled with the current timestamp.
    pub fn new(id: Option<String>, server_rx: Option<f64>, ty: ServerMessageType) -> Self {
        ServerMessage {
            id,
            server_tx: now(),
            server_rx,
            ty,
        }
    }

    /// Construct an Ack message for the given incoming message id (if it had one).
    pub fn ack(id: Option<String>) -> Self {
        ServerMessage::new(id, None, ServerMessageType::Ack)
    }

    /// Construct an Error message responding to a successfully-typed client message.
    pub fn error(client_msg: &ClientMessage, error: &str) -> Self {
        ServerMessage {
            id: client_msg.id.clone(),
            server_tx: now(),
            server_rx: None,
            ty: ServerMessageType::Error {
                error: error.to_owned(),
                orig: serde_json::to_value(client_msg).unwrap_or(serde_json::Value::Null),
            },
        }
    }

    /// Construct an Error message responding to a frame that failed to parse at all
    /// (missing or unknown `"type"`), echoing back the raw JSON value as received.
    pub fn error_raw(id: Option<String>, orig: serde_json::Value, error: &str) -> Self {
        ServerMessage {
            id,
            server_tx: now(),
            server_rx: None,
            ty: ServerMessageType::Error {
                error: error.to_owned(),
                orig,
            },
        }
    }
}

impl ClientMessage {
    /// Construct a message with the given `ty` information. A random message id is generated
    /// and added to the `id` field. Used by tests to build well-formed client frames.
    pub fn new(ty: ClientMessageType) -> Self {
        let id = {
            let mut rng = rand::thread_rng();
            let mut buffer = [0u8; 2];
            rng.fill_bytes(&mut buffer);
            hex::encode(buffer)
        };
        ClientMessage { id: Some(id), ty }
    }
}

pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

/// Id extracted from a raw inbound frame, used for the ack that precedes any
/// substantive reply. Lenient: a frame with no `"id"` (or a non-string one)
/// simply gets no id echoed, matching `server.rs`'s tolerance of malformed input.
pub fn extract_id(value: &serde_json::Value) -> Option<String> {
    value.get("id").and_then(|v| v.as_str()).map(str::to_owned)
}

/// Strictly parse a raw inbound JSON frame into a [`ClientMessage`], producing
/// the exact [`ProtocolError`] the wire protocol expects for missing/unknown
/// types and missing required fields. This does its own field-by-field
/// validation rather than leaning on `#[serde(tag = "type")]` so that the
/// error text matches the original rendezvous server precisely (see
/// `examples/original_source/.../test_server.py`'s `WebSocketAPI` tests).
pub fn parse_client_frame(value: &serde_json::Value) -> Result<ClientMessage, ProtocolError> {
    let id = extract_id(value);
    let ty_str = match value.get("type").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return Err(ProtocolError::MissingType),
    };

    let field_str = |name: &'static str| -> Option<String> {
        value.get(name).and_then(|v| v.as_str()).map(str::to_owned)
    };
    let field_u32 = |name: &'static str| -> Option<u32> {
        value.get(name).and_then(|v| v.as_u64()).map(|n| n as u32)
    };

    let ty = match ty_str {
        "submit-permissions" => ClientMessageType::SubmitPermissions,
        "bind" => {
            let app_id = field_str("appid").ok_or(ProtocolError::BindRequiresAppId)?;
            let side = field_str("side").ok_or(ProtocolError::BindRequiresSide)?;
            ClientMessageType::Bind { app_id, side }
        }
        "list" => ClientMessageType::List,
        "allocate" => ClientMessageType::Allocate,
        "claim" => {
            let nameplate = field_str("nameplate")
                .ok_or(ProtocolError::MissingField("claim", "nameplate"))?;
            ClientMessageType::Claim { nameplate }
        }
        "release" => ClientMessageType::Release {
            nameplate: field_str("nameplate"),
        },
        "open" => {
            let mailbox_id =
                field_str("mailbox").ok_or(ProtocolError::MissingField("open", "mailbox"))?;
            ClientMessageType::Open { mailbox_id }
        }
        "add" => {
            let phase_str =
                field_str("phase").ok_or(ProtocolError::MissingFieldBare("phase"))?;
            let phase = if let Ok(n) = phase_str.parse::<usize>() {
                Phase::Message(n)
            } else if phase_str == "pake" {
                Phase::Pake
            } else if phase_str == "version" {
                Phase::Version
            } else {
                return Err(ProtocolError::MissingFieldBare("phase"));
            };
            let body_hex = field_str("body").ok_or(ProtocolError::MissingFieldBare("body"))?;
            let body = hex::decode(body_hex).map_err(|_| ProtocolError::MissingFieldBare("body"))?;
            ClientMessageType::Add { phase, body }
        }
        "close" => {
            let mood = match value.get("mood").and_then(|v| v.as_str()) {
                Some("happy") => Some(Mood::Happy),
                Some("lonely") => Some(Mood::Lonely),
                Some("scary") => Some(Mood::Scary),
                Some("errory") => Some(Mood::Errory),
                _ => None,
            };
            ClientMessageType::Close { mood }
        }
        "ping" => {
            let ping = field_u32("ping").ok_or(ProtocolError::MissingField("ping", "ping"))?;
            ClientMessageType::Ping { ping }
        }
        _ => return Err(ProtocolError::UnknownType),
    };

    Ok(ClientMessage { id, ty })
}

#[cfg(test)]
mod tests {
    use super::{
        parse_client_frame, ClientMessage, ClientMessageType, Mood, Phase, ServerMessage,
        ServerMessageType, WelcomeInfo,
    };
    use crate::error::ProtocolError;

    #[test]
    fn serialization() {
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594898.0583792,
            server_rx: None,
            ty: ServerMessageType::Welcome {
                welcome: WelcomeInfo {
                    motd: None,
                    error: None,
                    permission_required: vec![],
                    current_cli_version: "0.1.0".into(),
                },
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains("\"current_cli_version\":\"0.1.0\""));

        let msg = ClientMessage {
            id: Some("5d67".into()),
            ty: ClientMessageType::Bind {
                app_id: "lothar.com/wormhole/text-or-file-xfer".into(),
                side: "6d89484e10".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"id\":\"5d67\",\"type\":\"bind\",\"appid\":\"lothar.com/wormhole/text-or-file-xfer\",\"side\":\"6d89484e10\"}");

        let msg = ServerMessage {
            id: Some("5d67".into()),
            server_tx: 1687594898.2351809,
            server_rx: None,
            ty: ServerMessageType::Ack,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"id\":\"5d67\",\"server_tx\":1687594898.2351809,\"type\":\"ack\"}"
        );

        let msg = ClientMessage {
            id: Some("d8c1".into()),
            ty: ClientMessageType::Add {
                phase: Phase::Message(0),
                body: vec![0xf9, 0x21],
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"id\":\"d8c1\",\"type\":\"add\",\"phase\":\"0\",\"body\":\"f921\"}"
        );

        let msg = ClientMessage {
            id: Some("00c2".into()),
            ty: ClientMessageType::Close {
                mood: Some(Mood::Happy),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"id\":\"00c2\",\"type\":\"close\",\"mood\":\"happy\"}");
    }

    #[test]
    fn parse_missing_type() {
        let v: serde_json::Value = serde_json::json!({"other": "misc"});
        assert_eq!(parse_client_frame(&v), Err(ProtocolError::MissingType));
    }

    #[test]
    fn parse_unknown_type() {
        let v: serde_json::Value = serde_json::json!({"type": "___unknown"});
        assert_eq!(parse_client_frame(&v), Err(ProtocolError::UnknownType));
    }

    #[test]
    fn parse_bind_missing_fields() {
        let v = serde_json::json!({"type": "bind", "appid": "appid"});
        assert_eq!(
            parse_client_frame(&v),
            Err(ProtocolError::BindRequiresSide)
        );

        let v = serde_json::json!({"type": "bind", "side": "side"});
        assert_eq!(
            parse_client_frame(&v),
            Err(ProtocolError::BindRequiresAppId)
        );

        let v = serde_json::json!({"type": "bind", "appid": "appid", "side": "side"});
        let msg = parse_client_frame(&v).unwrap();
        assert!(matches!(msg.ty, ClientMessageType::Bind { .. }));
    }

    #[test]
    fn parse_ping_missing_field() {
        let v = serde_json::json!({"type": "ping"});
        assert_eq!(
            parse_client_frame(&v),
            Err(ProtocolError::MissingField("ping", "ping"))
        );
    }

    #[test]
    fn parse_add_missing_fields() {
        let v = serde_json::json!({"type": "add", "body": "0a"});
        assert_eq!(
            parse_client_frame(&v),
            Err(ProtocolError::MissingFieldBare("phase"))
        );
        let v = serde_json::json!({"type": "add", "phase": "0"});
        assert_eq!(
            parse_client_frame(&v),
            Err(ProtocolError::MissingFieldBare("body"))
        );
    }

    #[test]
    fn parse_close_ignores_absent_mood() {
        let v = serde_json::json!({"type": "close"});
        let msg = parse_client_frame(&v).unwrap();
        assert!(matches!(
            msg.ty,
            ClientMessageType::Close { mood: None }
        ));
    }
}
