use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChatError, ChatResult};

/// Prefix of client-assigned ids on optimistic entries.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Field names that all carry the conversation key, in priority order.
pub const CONVERSATION_KEY_ALIASES: [&str; 5] = [
    "orderId",
    "medicalRequestId",
    "requestId",
    "roomId",
    "conversationKey",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Shown locally, not yet acknowledged
    Pending,
    /// Carries a server-assigned id
    Confirmed,
    /// Transport refused it; the entry is no longer in the store
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Confirmed => write!(f, "confirmed"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_url: String,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Correlation id echoed back by the server for messages this client sent.
    pub client_message_id: Option<String>,
    /// Normalized conversation key (order/request/room id).
    pub conversation_key: Option<String>,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_role: Option<String>,
    pub receiver_id: Option<String>,
    pub pharmacy_id: Option<String>,
    pub patient_id: Option<String>,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub is_read: bool,
}

impl Message {
    /// Build the local placeholder for a message that is being sent.
    pub fn optimistic(
        sender_id: impl Into<String>,
        body: impl Into<String>,
        client_message_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let client_message_id = client_message_id.into();
        Self {
            id: format!(
                "{}{}_{}",
                TEMP_ID_PREFIX,
                now.timestamp_millis(),
                client_message_id
            ),
            client_message_id: Some(client_message_id),
            conversation_key: None,
            sender_id: sender_id.into(),
            sender_name: None,
            sender_role: None,
            receiver_id: None,
            pharmacy_id: None,
            patient_id: None,
            body: body.into(),
            attachment: None,
            timestamp: now,
            status: DeliveryStatus::Pending,
            is_read: true,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_own(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// Parse a server message object.
    ///
    /// Accepts every field spelling the backend has been seen to use.
    /// `fallback_time` is used when neither `createdAt` nor `timestamp` parse.
    pub fn from_wire(value: &Value, fallback_time: DateTime<Utc>) -> ChatResult<Self> {
        let obj = value.as_object().ok_or_else(|| {
            ChatError::UnexpectedPayload(format!("message is not an object: {}", value))
        })?;

        let id = id_field(obj, &["_id", "id", "messageId"])
            .ok_or_else(|| ChatError::UnexpectedPayload("message has no id".to_string()))?;

        let (sender_id, sender_name_from_object) = sender_fields(obj);
        let sender_id = sender_id
            .ok_or_else(|| ChatError::UnexpectedPayload(format!("message {} has no sender", id)))?;

        let body = string_field(obj, &["message", "text", "content", "body"]).unwrap_or_default();

        let attachment = string_field(obj, &["fileUrl"]).map(|file_url| Attachment {
            file_url,
            file_name: string_field(obj, &["fileName"]),
            file_type: string_field(obj, &["fileType"]),
        });

        if body.is_empty() && attachment.is_none() {
            return Err(ChatError::UnexpectedPayload(format!(
                "message {} has neither text nor attachment",
                id
            )));
        }

        let timestamp = ["createdAt", "timestamp"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(parse_timestamp))
            .unwrap_or(fallback_time);

        Ok(Self {
            id,
            client_message_id: string_field(obj, &["clientMessageId"]),
            conversation_key: normalize_conversation_key(value),
            sender_id,
            sender_name: string_field(obj, &["senderName"]).or(sender_name_from_object),
            sender_role: string_field(obj, &["senderRole", "senderModel"]),
            receiver_id: id_field(obj, &["receiverId", "receiver"]),
            pharmacy_id: id_field(obj, &["pharmacyId", "pharmacy"]),
            patient_id: id_field(obj, &["patientId", "patient"]),
            body,
            attachment,
            timestamp,
            status: DeliveryStatus::Confirmed,
            is_read: obj
                .get("isRead")
                .or_else(|| obj.get("read"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Resolve the canonical conversation key of a raw payload.
///
/// `orderId`, `medicalRequestId` and `requestId` are used interchangeably by
/// the backend; the first one present wins.
pub fn normalize_conversation_key(value: &Value) -> Option<String> {
    value
        .as_object()
        .and_then(|obj| id_field(obj, &CONVERSATION_KEY_ALIASES))
}

/// Interpret a JSON value as an identifier.
///
/// Strings and numbers are taken as-is; populated documents contribute
/// their `_id`/`id`.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => id_field(obj, &["_id", "id"]),
        _ => None,
    }
}

fn id_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| obj.get(*key).and_then(value_as_id))
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}

fn sender_fields(obj: &Map<String, Value>) -> (Option<String>, Option<String>) {
    if let Some(id) = id_field(obj, &["senderId"]) {
        return (Some(id), None);
    }
    match obj.get("sender") {
        Some(Value::Object(sender)) => (
            id_field(sender, &["_id", "id"]),
            string_field(sender, &["name", "fullName", "username"]),
        ),
        Some(other) => (value_as_id(other), None),
        None => (None, None),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn test_parse_flat_message() {
        let msg = Message::from_wire(
            &json!({
                "_id": "m1",
                "senderId": "u1",
                "senderName": "Dr. Ana",
                "message": "Take two a day",
                "medicalRequestId": "req-9",
                "createdAt": "2024-01-01T10:00:00Z",
                "isRead": true
            }),
            epoch(),
        )
        .unwrap();

        assert_eq!(msg.id, "m1");
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.sender_name.as_deref(), Some("Dr. Ana"));
        assert_eq!(msg.body, "Take two a day");
        assert_eq!(msg.conversation_key.as_deref(), Some("req-9"));
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-01-01T10:00:00+00:00");
        assert_eq!(msg.status, DeliveryStatus::Confirmed);
        assert!(msg.is_read);
    }

    #[test]
    fn test_sender_object_and_numeric_timestamp() {
        let msg = Message::from_wire(
            &json!({
                "id": 42,
                "sender": {"_id": "pharm-1", "name": "Central Pharmacy"},
                "text": "Ready for pickup",
                "timestamp": 1704103200000i64
            }),
            epoch(),
        )
        .unwrap();

        assert_eq!(msg.id, "42");
        assert_eq!(msg.sender_id, "pharm-1");
        assert_eq!(msg.sender_name.as_deref(), Some("Central Pharmacy"));
        assert_eq!(msg.timestamp.timestamp_millis(), 1704103200000);
    }

    #[test]
    fn test_created_at_wins_over_timestamp() {
        let msg = Message::from_wire(
            &json!({
                "_id": "m1",
                "senderId": "u1",
                "message": "hi",
                "timestamp": "2024-01-01T09:00:00Z",
                "createdAt": "2024-01-01T10:00:00Z"
            }),
            epoch(),
        )
        .unwrap();
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-01-01T10:00:00+00:00");
    }

    #[test]
    fn test_missing_timestamp_uses_fallback() {
        let arrival = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let msg = Message::from_wire(
            &json!({"_id": "m1", "senderId": "u1", "message": "hi", "createdAt": "not a date"}),
            arrival,
        )
        .unwrap();
        assert_eq!(msg.timestamp, arrival);
    }

    #[test]
    fn test_conversation_key_alias_priority() {
        assert_eq!(
            normalize_conversation_key(&json!({"requestId": "r", "orderId": "o"})).as_deref(),
            Some("o")
        );
        assert_eq!(
            normalize_conversation_key(&json!({"requestId": "r"})).as_deref(),
            Some("r")
        );
        assert_eq!(
            normalize_conversation_key(&json!({"medicalRequestId": {"_id": "mr"}})).as_deref(),
            Some("mr")
        );
        assert!(normalize_conversation_key(&json!({"orderId": ""})).is_none());
    }

    #[test]
    fn test_attachment_only_message() {
        let msg = Message::from_wire(
            &json!({
                "_id": "m2",
                "senderId": "u1",
                "fileUrl": "/uploads/rx.pdf",
                "fileName": "rx.pdf",
                "fileType": "application/pdf"
            }),
            epoch(),
        )
        .unwrap();

        let attachment = msg.attachment.unwrap();
        assert_eq!(attachment.file_url, "/uploads/rx.pdf");
        assert_eq!(attachment.file_name.as_deref(), Some("rx.pdf"));
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_rejects_unusable_payloads() {
        assert!(Message::from_wire(&json!("hello"), epoch()).is_err());
        assert!(Message::from_wire(&json!({"senderId": "u1", "message": "x"}), epoch()).is_err());
        assert!(Message::from_wire(&json!({"_id": "m", "message": "x"}), epoch()).is_err());
        assert!(Message::from_wire(&json!({"_id": "m", "senderId": "u1"}), epoch()).is_err());
    }

    #[test]
    fn test_optimistic_message() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let msg = Message::optimistic("u1", "Hello", "c-1", now);

        assert!(msg.is_temporary());
        assert!(msg.is_pending());
        assert!(msg.is_own("u1"));
        assert!(msg.id.starts_with(&format!("temp_{}", now.timestamp_millis())));
        assert_eq!(msg.client_message_id.as_deref(), Some("c-1"));
    }
}
