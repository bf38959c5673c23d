//! In-memory [`ChatApi`] used by the chat tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ChatApi, SendRequest};
use crate::error::{ChatError, ChatResult};
use crate::models::{DeliveryStatus, Message, RoomKey};

pub struct MockChatApi {
    sender_id: String,
    pub history: Mutex<Vec<Message>>,
    pub fail_history: AtomicBool,
    pub fail_sends: AtomicBool,
    pub sent: Mutex<Vec<SendRequest>>,
    history_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockChatApi {
    /// `sender_id` is stamped on every message the mock accepts.
    pub fn new(sender_id: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            history: Mutex::new(Vec::new()),
            fail_history: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            history_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn with_history(self, history: Vec<Message>) -> Self {
        *self.history.lock().unwrap() = history;
        self
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn fetch_history(&self, _room: &RoomKey, _viewer_id: &str) -> ChatResult<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::ServiceUnavailable("mock history down".into()));
        }
        Ok(self.history.lock().unwrap().clone())
    }

    async fn send_message(&self, request: &SendRequest) -> ChatResult<Message> {
        self.sent.lock().unwrap().push(request.clone());
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::ServerRejected("mock rejected message".into()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut message = Message::optimistic(
            self.sender_id.as_str(),
            request.message.as_str(),
            request.client_message_id.clone().unwrap_or_default(),
            Utc::now(),
        );
        message.id = format!("srv-{}", n);
        message.client_message_id = request.client_message_id.clone();
        message.conversation_key = request.medical_request_id.clone();
        message.receiver_id = Some(request.receiver_id.clone());
        message.status = DeliveryStatus::Confirmed;
        Ok(message)
    }
}
