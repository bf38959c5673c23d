use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::CarelinkConfig;
use crate::error::{retry_async_with_config, ChatError, ChatResult, RetryConfig};
use crate::models::{Message, RoomKey};

/// Body of `POST /chats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub receiver_id: String,
    pub receiver_model: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pharmacy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// The chat endpoints of the REST backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// History of `room` as seen by `viewer_id`, in server order.
    async fn fetch_history(&self, room: &RoomKey, viewer_id: &str) -> ChatResult<Vec<Message>>;

    /// Persist a message; returns the stored copy with its server id.
    async fn send_message(&self, request: &SendRequest) -> ChatResult<Message>;
}

/// `{success, data | messages, message}` envelope used by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    messages: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
}

fn default_success() -> bool {
    true
}

impl Envelope {
    fn into_payload(self) -> ChatResult<Value> {
        if !self.success {
            let reason = self
                .message
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("request was not successful")
                .to_string();
            return Err(ChatError::ServerRejected(reason));
        }
        Ok(self.data.or(self.messages).unwrap_or(Value::Null))
    }
}

pub struct RestChatApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
}

impl RestChatApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> ChatResult<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::InvalidEndpoint(format!(
                "API base URL cannot have paths: {}",
                base_url
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
            timeout,
            retry: RetryConfig::for_api(),
        })
    }

    pub fn from_config(config: &CarelinkConfig, token: Option<String>) -> ChatResult<Self> {
        let mut retry = RetryConfig::for_api();
        retry.max_attempts = config.api.max_retries.max(1);
        Ok(Self::new(
            &config.api.base_url,
            token,
            Duration::from_secs(config.api.request_timeout_secs),
        )?
        .with_retry(retry))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> ChatResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn history_url(&self, room: &RoomKey, viewer_id: &str) -> ChatResult<Url> {
        match room {
            RoomKey::Order(order_id) => self.endpoint(&["chats", "history", order_id.as_str()]),
            RoomKey::Direct { counterpart_id, .. } => self.endpoint(&["chats", counterpart_id.as_str()]),
            RoomKey::PharmacyPatient {
                pharmacy_id,
                patient_id,
            } => {
                let counterpart = if viewer_id == patient_id.as_str() {
                    pharmacy_id
                } else {
                    patient_id
                };
                self.endpoint(&["chats", counterpart.as_str()])
            }
        }
    }

    async fn request_once(&self, method: Method, url: &Url, body: Option<&Value>) -> ChatResult<Value> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%method, url = %url, "REST request");
        let timeout_secs = self.timeout.as_secs();
        let response = request
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(e, timeout_secs))?;
        parse_response(response, timeout_secs).await
    }

    async fn request(&self, method: Method, url: Url, body: Option<Value>) -> ChatResult<Value> {
        retry_async_with_config(
            || self.request_once(method.clone(), &url, body.as_ref()),
            self.retry.clone(),
        )
        .await
    }
}

async fn parse_response(response: Response, timeout_secs: u64) -> ChatResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(text);
        return Err(ChatError::from_status(status.as_u16(), message, retry_after));
    }

    let envelope: Envelope = response
        .json()
        .await
        .map_err(|e| ChatError::from_reqwest(e, timeout_secs))?;
    envelope.into_payload()
}

/// Parse a history payload. Entries that cannot be used are logged and
/// skipped so one bad record never hides the rest of the conversation.
pub fn parse_history(payload: &Value, fallback_time: DateTime<Utc>) -> Vec<Message> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("messages").or_else(|| obj.get("data")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    items
        .iter()
        .filter_map(|item| match Message::from_wire(item, fallback_time) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Skipping unusable history entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ChatApi for RestChatApi {
    async fn fetch_history(&self, room: &RoomKey, viewer_id: &str) -> ChatResult<Vec<Message>> {
        let url = self.history_url(room, viewer_id)?;
        let payload = self.request(Method::GET, url, None).await?;
        let mut messages = parse_history(&payload, DateTime::<Utc>::UNIX_EPOCH);

        if let RoomKey::Order(order_id) = room {
            for message in &mut messages {
                message.conversation_key.get_or_insert_with(|| order_id.clone());
            }
        }
        debug!(room = %room, count = messages.len(), "Fetched history");
        Ok(messages)
    }

    async fn send_message(&self, request: &SendRequest) -> ChatResult<Message> {
        let url = self.endpoint(&["chats"])?;
        let body = serde_json::to_value(request)?;
        let payload = self.request(Method::POST, url, Some(body)).await?;

        let mut message = Message::from_wire(&payload, Utc::now())?;
        if message.client_message_id.is_none() {
            message.client_message_id = request.client_message_id.clone();
        }
        if message.conversation_key.is_none() {
            message.conversation_key = request.medical_request_id.clone();
        }
        Ok(message)
    }
}
