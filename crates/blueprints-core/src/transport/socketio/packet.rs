//! Engine.IO v4 and Socket.IO v5 text packet codec.
//!
//! Engine.IO frames each WebSocket text message with a one digit type.
//! Socket.IO packets ride inside Engine.IO `message` packets:
//!
//! ```text
//! 0{"sid":"…","pingInterval":25000,"pingTimeout":20000}   open
//! 2 / 3                                                   ping / pong
//! 40                                                      connect "/"
//! 42["draw-event",{"room":"…"}]                           event
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type `{0}`")]
    UnknownType(char),
    #[error("binary packets are not supported")]
    Binary,
    #[error("event packet without a name")]
    MissingEventName,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine.IO open packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

/// Engine.IO packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let data = chars.as_str();
        Ok(match kind {
            '0' => EnginePacket::Open(serde_json::from_str(data)?),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping(data.to_string()),
            '3' => EnginePacket::Pong(data.to_string()),
            '4' => EnginePacket::Message(data.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => return Err(PacketError::UnknownType(other)),
        })
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(handshake) => {
                // Serializing a plain struct of strings and integers cannot fail.
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

/// Socket.IO packet (text variants only).
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Value,
    },
}

pub const DEFAULT_NAMESPACE: &str = "/";

impl Packet {
    /// Connect request for the default namespace.
    pub fn connect() -> Self {
        Packet::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Event on the default namespace with a single argument.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Packet::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id: None,
            name: name.into(),
            args: vec![payload],
        }
    }

    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        if matches!(kind, '5' | '6') {
            return Err(PacketError::Binary);
        }
        let rest = chars.as_str();

        let (namespace, rest) = match rest.strip_prefix('/') {
            Some(_) => match rest.split_once(',') {
                Some((ns, tail)) => (ns.to_string(), tail),
                None => (rest.to_string(), ""),
            },
            None => (DEFAULT_NAMESPACE.to_string(), rest),
        };

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = rest[..digits].parse::<u64>().ok();
        let payload = &rest[digits..];
        let json = || -> Result<Option<Value>, PacketError> {
            if payload.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(serde_json::from_str(payload)?))
            }
        };

        Ok(match kind {
            '0' => Packet::Connect {
                namespace,
                data: json()?,
            },
            '1' => Packet::Disconnect { namespace },
            '2' => {
                let mut args = match json()? {
                    Some(Value::Array(items)) => items,
                    _ => return Err(PacketError::MissingEventName),
                };
                if args.is_empty() {
                    return Err(PacketError::MissingEventName);
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    _ => return Err(PacketError::MissingEventName),
                };
                Packet::Event {
                    namespace,
                    id,
                    name,
                    args,
                }
            }
            '3' => Packet::Ack {
                namespace,
                id: id.unwrap_or_default(),
                args: match json()? {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                },
            },
            '4' => Packet::ConnectError {
                namespace,
                data: json()?.unwrap_or(Value::Null),
            },
            other => return Err(PacketError::UnknownType(other)),
        })
    }

    pub fn encode(&self) -> String {
        fn prefix(kind: char, namespace: &str) -> String {
            if namespace == DEFAULT_NAMESPACE {
                kind.to_string()
            } else {
                format!("{kind}{namespace},")
            }
        }

        match self {
            Packet::Connect { namespace, data } => {
                let mut out = prefix('0', namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
                out
            }
            Packet::Disconnect { namespace } => prefix('1', namespace),
            Packet::Event {
                namespace,
                id,
                name,
                args,
            } => {
                let mut out = prefix('2', namespace);
                if let Some(id) = id {
                    out.push_str(&id.to_string());
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
                out
            }
            Packet::Ack {
                namespace,
                id,
                args,
            } => {
                let mut out = prefix('3', namespace);
                out.push_str(&id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
                out
            }
            Packet::ConnectError { namespace, data } => {
                let mut out = prefix('4', namespace);
                out.push_str(&data.to_string());
                out
            }
        }
    }

    /// The packet as a complete Engine.IO text message.
    pub fn to_message(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}
