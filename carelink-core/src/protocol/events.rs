//! Socket.IO event names used by the chat backend.
//!
//! The server announces a new chat message under several names depending on
//! which handler produced it. [`InboundEvent::from_socket`] folds them into
//! one variant so nothing downstream branches on spelling.

use serde_json::{json, Map, Value};

use crate::models::CONVERSATION_KEY_ALIASES;

/// Event names that all mean "a chat message arrived".
pub const MESSAGE_EVENT_ALIASES: [&str; 4] = [
    "newMessage",
    "newPharmacyChatMessage",
    "pharmacy-chat-message",
    "new-message",
];

/// Synthetic event emitted by the connection manager after a dropped socket
/// was re-established and re-authenticated.
pub const RECONNECTED_EVENT: &str = "reconnected";
/// Synthetic event emitted once reconnection attempts are used up.
pub const RECONNECT_FAILED_EVENT: &str = "reconnect_failed";

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    Disconnected { reason: String },
    Authenticated,
    /// A chat message, already unwrapped from its envelope
    Message(Value),
    RoomJoined(Value),
    ChatError(String),
    Reconnected,
    ReconnectFailed,
    Other { name: String, payload: Value },
}

impl InboundEvent {
    pub fn from_socket(name: &str, payload: Value) -> Self {
        if MESSAGE_EVENT_ALIASES.contains(&name) {
            return InboundEvent::Message(unwrap_message_payload(payload));
        }

        match name {
            "connect" => InboundEvent::Connected,
            "disconnect" => InboundEvent::Disconnected {
                reason: payload
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| "transport close".to_string()),
            },
            "authenticated" => InboundEvent::Authenticated,
            "pharmacy-chat-room-joined" => InboundEvent::RoomJoined(payload),
            "chat-error" => InboundEvent::ChatError(error_text(&payload)),
            RECONNECTED_EVENT => InboundEvent::Reconnected,
            RECONNECT_FAILED_EVENT => InboundEvent::ReconnectFailed,
            _ => InboundEvent::Other {
                name: name.to_string(),
                payload,
            },
        }
    }
}

/// Extract the message object from an event payload.
///
/// Some handlers wrap the message as `{message: {...}}` or `{data: {...}}`
/// and put the conversation key on the wrapper. The inner object is returned
/// with any wrapper-level conversation key copied in when it has none.
pub fn unwrap_message_payload(payload: Value) -> Value {
    let Value::Object(mut outer) = payload else {
        return payload;
    };

    let inner_key = ["message", "data"]
        .into_iter()
        .find(|key| matches!(outer.get(*key), Some(Value::Object(_))));

    let Some(inner_key) = inner_key else {
        return Value::Object(outer);
    };

    let Some(Value::Object(mut inner)) = outer.remove(inner_key) else {
        return Value::Object(outer);
    };

    if !has_conversation_key(&inner) {
        for alias in CONVERSATION_KEY_ALIASES {
            if let Some(value) = outer.get(alias) {
                inner.insert(alias.to_string(), value.clone());
            }
        }
    }
    Value::Object(inner)
}

fn has_conversation_key(obj: &Map<String, Value>) -> bool {
    CONVERSATION_KEY_ALIASES
        .iter()
        .any(|alias| obj.contains_key(*alias))
}

fn error_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .or_else(|| obj.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        Value::Null => "unknown chat error".to_string(),
        other => other.to_string(),
    }
}

/// Events this client emits.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Authenticate {
        user_id: String,
    },
    JoinPatientRoom {
        user_id: String,
    },
    JoinOrderChatRoom {
        order_id: String,
    },
    JoinPharmacyChatRoom {
        pharmacy_id: String,
        medical_request_id: Option<String>,
        patient_id: Option<String>,
        order_id: Option<String>,
    },
    PatientSendMessage {
        pharmacy_id: String,
        order_id: String,
        patient_id: String,
        sender: String,
        message: String,
        client_message_id: String,
    },
    PatientToPharmacyMessage {
        pharmacy_id: String,
        message: String,
        request_id: Option<String>,
        client_message_id: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Authenticate { .. } => "authenticate",
            OutboundEvent::JoinPatientRoom { .. } => "joinPatientRoom",
            OutboundEvent::JoinOrderChatRoom { .. } => "joinOrderChatRoom",
            OutboundEvent::JoinPharmacyChatRoom { .. } => "joinPharmacyChatRoom",
            OutboundEvent::PatientSendMessage { .. } => "patientSendMessage",
            OutboundEvent::PatientToPharmacyMessage { .. } => "patientToPharmacyMessage",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::Authenticate { user_id } | OutboundEvent::JoinPatientRoom { user_id } => {
                json!(user_id)
            }
            OutboundEvent::JoinOrderChatRoom { order_id } => json!(order_id),
            OutboundEvent::JoinPharmacyChatRoom {
                pharmacy_id,
                medical_request_id,
                patient_id,
                order_id,
            } => {
                let mut obj = Map::new();
                obj.insert("pharmacyId".into(), json!(pharmacy_id));
                insert_opt(&mut obj, "medicalRequestId", medical_request_id);
                insert_opt(&mut obj, "patientId", patient_id);
                insert_opt(&mut obj, "orderId", order_id);
                Value::Object(obj)
            }
            OutboundEvent::PatientSendMessage {
                pharmacy_id,
                order_id,
                patient_id,
                sender,
                message,
                client_message_id,
            } => json!({
                "pharmacyId": pharmacy_id,
                "medicalRequestId": order_id,
                "orderId": order_id,
                "patientId": patient_id,
                "sender": sender,
                "message": message,
                "clientMessageId": client_message_id,
            }),
            OutboundEvent::PatientToPharmacyMessage {
                pharmacy_id,
                message,
                request_id,
                client_message_id,
            } => {
                let mut obj = Map::new();
                obj.insert("pharmacyId".into(), json!(pharmacy_id));
                obj.insert("message".into(), json!(message));
                insert_opt(&mut obj, "requestId", request_id);
                obj.insert("clientMessageId".into(), json!(client_message_id));
                Value::Object(obj)
            }
        }
    }
}

fn insert_opt(obj: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        obj.insert(key.to_string(), json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_aliases_normalize() {
        for name in MESSAGE_EVENT_ALIASES {
            let event = InboundEvent::from_socket(name, json!({"_id": "m1"}));
            assert_eq!(event, InboundEvent::Message(json!({"_id": "m1"})), "{}", name);
        }
    }

    #[test]
    fn test_control_events() {
        assert_eq!(
            InboundEvent::from_socket("connect", Value::Null),
            InboundEvent::Connected
        );
        assert_eq!(
            InboundEvent::from_socket("authenticated", json!({"ok": true})),
            InboundEvent::Authenticated
        );
        assert_eq!(
            InboundEvent::from_socket("disconnect", json!("io server disconnect")),
            InboundEvent::Disconnected {
                reason: "io server disconnect".into()
            }
        );
        assert_eq!(
            InboundEvent::from_socket(RECONNECTED_EVENT, Value::Null),
            InboundEvent::Reconnected
        );
        assert!(matches!(
            InboundEvent::from_socket("typing", json!({})),
            InboundEvent::Other { ref name, .. } if name == "typing"
        ));
    }

    #[test]
    fn test_chat_error_text() {
        assert_eq!(
            InboundEvent::from_socket("chat-error", json!({"message": "Room closed"})),
            InboundEvent::ChatError("Room closed".into())
        );
        assert_eq!(
            InboundEvent::from_socket("chat-error", json!("nope")),
            InboundEvent::ChatError("nope".into())
        );
    }

    #[test]
    fn test_unwrap_wrapped_message_keeps_room_key() {
        let payload = json!({
            "medicalRequestId": "req-1",
            "message": {"_id": "m1", "senderId": "u1", "message": "hi"}
        });
        let unwrapped = unwrap_message_payload(payload);
        assert_eq!(unwrapped["_id"], "m1");
        assert_eq!(unwrapped["medicalRequestId"], "req-1");

        let payload = json!({
            "orderId": "outer",
            "data": {"_id": "m2", "orderId": "inner"}
        });
        assert_eq!(unwrap_message_payload(payload)["orderId"], "inner");
    }

    #[test]
    fn test_flat_message_is_untouched() {
        let payload = json!({"_id": "m1", "message": "plain text", "orderId": "o"});
        assert_eq!(unwrap_message_payload(payload.clone()), payload);
    }

    #[test]
    fn test_outbound_payloads() {
        let auth = OutboundEvent::Authenticate {
            user_id: "u1".into(),
        };
        assert_eq!(auth.name(), "authenticate");
        assert_eq!(auth.payload(), json!("u1"));

        let join = OutboundEvent::JoinPharmacyChatRoom {
            pharmacy_id: "ph".into(),
            medical_request_id: Some("req".into()),
            patient_id: Some("pat".into()),
            order_id: Some("req".into()),
        };
        assert_eq!(
            join.payload(),
            json!({"pharmacyId": "ph", "medicalRequestId": "req", "patientId": "pat", "orderId": "req"})
        );

        let send = OutboundEvent::PatientToPharmacyMessage {
            pharmacy_id: "ph".into(),
            message: "hello".into(),
            request_id: None,
            client_message_id: "c1".into(),
        };
        assert_eq!(send.name(), "patientToPharmacyMessage");
        assert_eq!(
            send.payload(),
            json!({"pharmacyId": "ph", "message": "hello", "clientMessageId": "c1"})
        );
    }
}
