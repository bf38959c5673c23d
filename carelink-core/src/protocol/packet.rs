//! Engine.IO v4 / Socket.IO v5 text packet codec.
//!
//! An Engine.IO frame is a single type digit followed by its data. Frames of
//! type `4` (message) carry a Socket.IO packet:
//!
//! ```text
//! <type>[<attachments>-][<namespace>,][<ack id>][<json>]
//! ```
//!
//! Binary attachments are not used by the chat backend; binary packet types
//! are decoded but their placeholders are passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};

/// Query string appended to the socket path for a direct WebSocket session.
pub const ENGINE_QUERY: &str = "EIO=4&transport=websocket";
pub const SOCKET_PATH: &str = "/socket.io/";
pub const DEFAULT_NAMESPACE: &str = "/";

/// Handshake data sent by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> ChatResult<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ChatError::MalformedPacket("empty engine frame".to_string()))?;
        let rest = chars.as_str();
        let data = || (!rest.is_empty()).then(|| rest.to_string());

        match kind {
            '0' => {
                let open = serde_json::from_str::<OpenPayload>(rest).map_err(|e| {
                    ChatError::MalformedPacket(format!("invalid open payload: {}", e))
                })?;
                Ok(EnginePacket::Open(open))
            }
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(data())),
            '3' => Ok(EnginePacket::Pong(data())),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(ChatError::MalformedPacket(format!(
                "unknown engine packet type '{}'",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(open) => {
                format!("0{}", serde_json::to_string(open).unwrap_or_default())
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data.as_deref().unwrap_or("")),
            EnginePacket::Pong(data) => format!("3{}", data.as_deref().unwrap_or("")),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    fn digit(self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::ConnectError => '4',
            PacketKind::BinaryEvent => '5',
            PacketKind::BinaryAck => '6',
        }
    }

    fn from_digit(digit: char) -> Option<Self> {
        Some(match digit {
            '0' => PacketKind::Connect,
            '1' => PacketKind::Disconnect,
            '2' => PacketKind::Event,
            '3' => PacketKind::Ack,
            '4' => PacketKind::ConnectError,
            '5' => PacketKind::BinaryEvent,
            '6' => PacketKind::BinaryAck,
            _ => return None,
        })
    }

    fn is_binary(self) -> bool {
        matches!(self, PacketKind::BinaryEvent | PacketKind::BinaryAck)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: PacketKind,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub attachments: u32,
    pub data: Option<Value>,
}

impl SocketPacket {
    fn new(kind: PacketKind, data: Option<Value>) -> Self {
        Self {
            kind,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            attachments: 0,
            data,
        }
    }

    pub fn connect(auth: Option<Value>) -> Self {
        Self::new(PacketKind::Connect, auth)
    }

    pub fn disconnect() -> Self {
        Self::new(PacketKind::Disconnect, None)
    }

    /// Event packet carrying `["name", payload]`.
    pub fn event(name: &str, payload: Value) -> Self {
        Self::new(
            PacketKind::Event,
            Some(Value::Array(vec![Value::String(name.to_string()), payload])),
        )
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ack_id(mut self, ack_id: u64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    /// Split an event packet into its name and payload.
    ///
    /// A single argument is returned as-is; several are returned as an array;
    /// none yields `null`.
    pub fn event_parts(&self) -> Option<(String, Value)> {
        if !matches!(self.kind, PacketKind::Event | PacketKind::BinaryEvent) {
            return None;
        }
        let args = self.data.as_ref()?.as_array()?;
        let (name, rest) = args.split_first()?;
        let name = name.as_str()?.to_string();
        let payload = match rest {
            [] => Value::Null,
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        };
        Some((name, payload))
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.kind.is_binary() {
            out.push_str(&format!("{}-", self.attachments));
        }
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(ack_id) = self.ack_id {
            out.push_str(&ack_id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    pub fn decode(input: &str) -> ChatResult<Self> {
        let mut chars = input.chars();
        let digit = chars
            .next()
            .ok_or_else(|| ChatError::MalformedPacket("empty socket packet".to_string()))?;
        let kind = PacketKind::from_digit(digit).ok_or_else(|| {
            ChatError::MalformedPacket(format!("unknown socket packet type '{}'", digit))
        })?;
        let mut rest = chars.as_str();

        let mut attachments = 0;
        if kind.is_binary() {
            let (count, tail) = rest.split_once('-').ok_or_else(|| {
                ChatError::MalformedPacket("binary packet without attachment count".to_string())
            })?;
            attachments = count.parse().map_err(|_| {
                ChatError::MalformedPacket(format!("invalid attachment count '{}'", count))
            })?;
            rest = tail;
        }

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            match rest.split_once(',') {
                Some((ns, tail)) => {
                    namespace = ns.to_string();
                    rest = tail;
                }
                None => {
                    namespace = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let (id, tail) = rest.split_at(digits);
            rest = tail;
            Some(id.parse().map_err(|_| {
                ChatError::MalformedPacket(format!("invalid ack id '{}'", id))
            })?)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest).map_err(|e| {
                ChatError::MalformedPacket(format!("invalid packet data: {}", e))
            })?)
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            attachments,
            data,
        })
    }
}
