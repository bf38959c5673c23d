use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::event::{Notice, SessionEvent};
use super::store::{OptimisticHandle, SharedStore};
use crate::client::{ChatApi, SendRequest};
use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationContext, Message, Participant, RoomKey, Role};
use crate::protocol::OutboundEvent;

/// Text waiting in the message input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    draft: String,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.draft
    }

    pub fn set(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.draft)
    }

    /// Put the text of a failed send back. Anything typed since goes after it.
    pub fn restore(&mut self, text: &str) {
        if self.draft.trim().is_empty() {
            self.draft = text.to_string();
        } else if self.draft != text {
            self.draft = format!("{}\n{}", text, self.draft);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Persisted over REST; the placeholder now carries the server id
    Delivered(Message),
    /// Emitted on the socket; the placeholder waits for the server echo
    Emitted(OptimisticHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    Socket,
    Rest,
}

/// Who a message from `me` in `room` is addressed to.
pub fn resolve_recipient(
    me: &Participant,
    context: &ConversationContext,
    room: &RoomKey,
) -> Option<(String, Role)> {
    let default_role = match me.role {
        Role::Patient => Role::Doctor,
        _ => Role::Patient,
    };
    if let Some(counterpart) = context.counterpart() {
        return Some((
            counterpart.to_string(),
            context.counterpart_role.unwrap_or(default_role),
        ));
    }

    match room {
        RoomKey::Order(_) => match me.role {
            Role::Patient => context
                .pharmacy()
                .map(|id| (id.to_string(), Role::Pharmacy)),
            _ => context.patient().map(|id| (id.to_string(), Role::Patient)),
        },
        RoomKey::PharmacyPatient {
            pharmacy_id,
            patient_id,
        } => {
            if me.id == *patient_id {
                Some((pharmacy_id.clone(), Role::Pharmacy))
            } else {
                Some((patient_id.clone(), Role::Patient))
            }
        }
        RoomKey::Direct { counterpart_id, .. } => Some((counterpart_id.clone(), default_role)),
    }
}

/// The socket event that carries a message, if this room has one.
pub fn socket_send_event(
    me: &Participant,
    context: &ConversationContext,
    room: &RoomKey,
    body: &str,
    client_message_id: &str,
) -> Option<OutboundEvent> {
    if me.role != Role::Patient {
        return None;
    }
    match room {
        RoomKey::Order(order_id) => {
            let pharmacy_id = context.pharmacy()?;
            Some(OutboundEvent::PatientSendMessage {
                pharmacy_id: pharmacy_id.to_string(),
                order_id: order_id.clone(),
                patient_id: me.id.clone(),
                sender: me.id.clone(),
                message: body.to_string(),
                client_message_id: client_message_id.to_string(),
            })
        }
        RoomKey::PharmacyPatient { pharmacy_id, .. } => Some(OutboundEvent::PatientToPharmacyMessage {
            pharmacy_id: pharmacy_id.clone(),
            message: body.to_string(),
            request_id: None,
            client_message_id: client_message_id.to_string(),
        }),
        RoomKey::Direct { .. } => None,
    }
}

/// Sends messages for one session with optimistic display.
///
/// Each call owns its own placeholder, so sends can overlap freely.
pub struct MessageSender {
    me: Participant,
    context: ConversationContext,
    room: RoomKey,
    store: SharedStore,
    api: Arc<dyn ChatApi>,
    connection: Option<ConnectionHandle>,
    events: broadcast::Sender<SessionEvent>,
    optimistic_window: Duration,
    expiries: Mutex<JoinSet<()>>,
}

impl MessageSender {
    pub fn new(
        me: Participant,
        context: ConversationContext,
        room: RoomKey,
        store: SharedStore,
        api: Arc<dyn ChatApi>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            me,
            context,
            room,
            store,
            api,
            connection: None,
            events,
            optimistic_window: Duration::from_secs(1),
            expiries: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionHandle) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_optimistic_window(mut self, window: Duration) -> Self {
        self.optimistic_window = window;
        self
    }

    /// The path the next send would take.
    pub fn path(&self) -> SendPath {
        let socket_ready = self
            .connection
            .as_ref()
            .map_or(false, ConnectionHandle::is_authenticated);
        let has_event = socket_send_event(&self.me, &self.context, &self.room, "", "").is_some();
        if socket_ready && has_event {
            SendPath::Socket
        } else {
            SendPath::Rest
        }
    }

    pub async fn send(&self, text: &str) -> ChatResult<SendOutcome> {
        let body = text.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let (receiver_id, receiver_role) =
            resolve_recipient(&self.me, &self.context, &self.room).ok_or(ChatError::NoRecipient)?;

        let client_message_id = Uuid::new_v4().to_string();
        let draft = self.draft(body, &client_message_id, &receiver_id);
        let handle = self.store.with(|store| store.insert_optimistic(draft));
        self.notify_changed();

        if self.path() == SendPath::Socket {
            if let Some(event) =
                socket_send_event(&self.me, &self.context, &self.room, body, &client_message_id)
            {
                match self.emit(&event).await {
                    Ok(()) => {
                        debug!(client_message_id = %client_message_id, "Message emitted on socket");
                        self.schedule_expiry(handle.clone());
                        return Ok(SendOutcome::Emitted(handle));
                    }
                    Err(e) => warn!(error = %e, "Socket send failed, falling back to REST"),
                }
            }
        }

        let request = SendRequest {
            receiver_id,
            receiver_model: receiver_role.receiver_model().to_string(),
            message: body.to_string(),
            sender_name: self.me.name.clone(),
            sender_role: Some(self.me.role.to_string()),
            medical_request_id: self.context.order_key().map(str::to_string),
            pharmacy_id: self.pharmacy_id(),
            patient_id: self.patient_id(),
            client_message_id: Some(client_message_id),
        };

        match self.api.send_message(&request).await {
            Ok(message) => {
                info!(id = %message.id, "Message delivered over REST");
                self.store
                    .with(|store| store.confirm_optimistic(&handle, message.clone()));
                self.notify_changed();
                Ok(SendOutcome::Delivered(message))
            }
            Err(e) => {
                e.log();
                self.store.with(|store| store.rollback_optimistic(&handle));
                self.notify_changed();
                Err(e)
            }
        }
    }

    async fn emit(&self, event: &OutboundEvent) -> ChatResult<()> {
        match &self.connection {
            Some(connection) => connection.emit(event).await,
            None => Err(ChatError::NotConnected),
        }
    }

    fn draft(&self, body: &str, client_message_id: &str, receiver_id: &str) -> Message {
        let mut draft = Message::optimistic(self.me.id.as_str(), body, client_message_id, Utc::now());
        draft.sender_name = self.me.name.clone();
        draft.sender_role = Some(self.me.role.to_string());
        draft.receiver_id = Some(receiver_id.to_string());
        draft.pharmacy_id = self.pharmacy_id();
        draft.patient_id = self.patient_id();
        if let RoomKey::Order(order_id) = &self.room {
            draft.conversation_key = Some(order_id.clone());
        }
        draft
    }

    fn pharmacy_id(&self) -> Option<String> {
        match &self.room {
            RoomKey::PharmacyPatient { pharmacy_id, .. } => Some(pharmacy_id.clone()),
            _ => self.context.pharmacy().map(str::to_string),
        }
    }

    fn patient_id(&self) -> Option<String> {
        match &self.room {
            RoomKey::PharmacyPatient { patient_id, .. } => Some(patient_id.clone()),
            _ if self.me.role == Role::Patient => Some(self.me.id.clone()),
            _ => self.context.patient().map(str::to_string),
        }
    }

    fn notify_changed(&self) {
        let count = self.store.len();
        let _ = self.events.send(SessionEvent::MessagesChanged { count });
    }

    fn schedule_expiry(&self, handle: OptimisticHandle) {
        let store = self.store.clone();
        let events = self.events.clone();
        let window = self.optimistic_window;

        let mut expiries = self
            .expiries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while expiries.try_join_next().is_some() {}
        expiries.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(expired) = store.with(|s| s.expire_optimistic(&handle)) {
                let _ = events.send(SessionEvent::Notice(Notice::warning(format!(
                    "Message \"{}\" was not confirmed by the server",
                    expired.body
                ))));
                let _ = events.send(SessionEvent::MessagesChanged { count: store.len() });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::testing::*;
    use super::super::connection::{ConnectionManager, ConnectionSettings};
    use super::*;
    use crate::client::testing::MockChatApi;
    use std::sync::atomic::Ordering;

    fn patient() -> Participant {
        Participant::new("pat-1", Role::Patient).with_name("Pat")
    }

    fn order_context() -> ConversationContext {
        ConversationContext::new()
            .with_medical_request("req-1")
            .with_pharmacy("ph-1")
    }

    fn sender_for(api: Arc<MockChatApi>, store: SharedStore) -> MessageSender {
        let (events, _) = broadcast::channel(64);
        let context = order_context();
        let room = context.room_key(&patient()).unwrap();
        store.with(|s| s.set_room(room.clone()));
        MessageSender::new(patient(), context, room, store, api, events)
    }

    fn count_body(store: &SharedStore, body: &str) -> usize {
        store.messages().iter().filter(|m| m.body == body).count()
    }

    #[test]
    fn test_composer_restore() {
        let mut composer = Composer::new();
        composer.restore("Test");
        assert_eq!(composer.text(), "Test");

        composer.set("new text");
        composer.restore("Test");
        assert_eq!(composer.text(), "Test\nnew text");
        assert_eq!(composer.take(), "Test\nnew text");
        assert_eq!(composer.text(), "");
    }

    #[test]
    fn test_recipient_resolution() {
        let room = RoomKey::Order("req-1".into());
        assert_eq!(
            resolve_recipient(&patient(), &order_context(), &room),
            Some(("ph-1".into(), Role::Pharmacy))
        );

        let pharmacist = Participant::new("ph-1", Role::Pharmacy);
        let ctx = order_context().with_patient("pat-1");
        assert_eq!(
            resolve_recipient(&pharmacist, &ctx, &room),
            Some(("pat-1".into(), Role::Patient))
        );
        assert_eq!(resolve_recipient(&pharmacist, &order_context(), &room), None);

        let ctx = ConversationContext::new().with_counterpart("doc-1", Role::Doctor);
        let direct = ctx.room_key(&patient()).unwrap();
        assert_eq!(
            resolve_recipient(&patient(), &ctx, &direct),
            Some(("doc-1".into(), Role::Doctor))
        );
    }

    #[test]
    fn test_socket_event_selection() {
        let order = RoomKey::Order("req-1".into());
        let event = socket_send_event(&patient(), &order_context(), &order, "hi", "c1").unwrap();
        assert_eq!(event.name(), "patientSendMessage");

        let pair = RoomKey::PharmacyPatient {
            pharmacy_id: "ph-1".into(),
            patient_id: "pat-1".into(),
        };
        let event = socket_send_event(&patient(), &ConversationContext::new(), &pair, "hi", "c1").unwrap();
        assert_eq!(event.name(), "patientToPharmacyMessage");

        let doctor = Participant::new("doc-1", Role::Doctor);
        assert!(socket_send_event(&doctor, &order_context(), &order, "hi", "c1").is_none());
    }

    #[tokio::test]
    async fn test_validation_rejects_before_network() {
        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api.clone(), store.clone());

        assert!(matches!(sender.send("   ").await, Err(ChatError::EmptyMessage)));
        assert!(api.sent_bodies().is_empty());
        assert!(store.is_empty());

        let pharmacist = Participant::new("ph-1", Role::Pharmacy);
        let (events, _) = broadcast::channel(8);
        let lonely = MessageSender::new(
            pharmacist,
            order_context(),
            RoomKey::Order("req-1".into()),
            store.clone(),
            api.clone(),
            events,
        );
        assert!(matches!(lonely.send("hello").await, Err(ChatError::NoRecipient)));
        assert!(api.sent_bodies().is_empty());
    }

    #[tokio::test]
    async fn test_rest_send_confirms_in_place() {
        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api.clone(), store.clone());

        assert_eq!(sender.path(), SendPath::Rest);
        let outcome = sender.send("Hello").await.unwrap();

        let SendOutcome::Delivered(message) = outcome else {
            panic!("expected REST delivery");
        };
        assert_eq!(message.id, "srv-1");
        assert_eq!(count_body(&store, "Hello"), 1);
        assert_eq!(store.messages()[0].id, "srv-1");

        let request = api.sent.lock().unwrap()[0].clone();
        assert_eq!(request.receiver_id, "ph-1");
        assert_eq!(request.receiver_model, "Pharmacy");
        assert_eq!(request.medical_request_id.as_deref(), Some("req-1"));
        assert_eq!(request.sender_role.as_deref(), Some("patient"));
        assert!(request.client_message_id.is_some());
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back() {
        let api = Arc::new(MockChatApi::new("pat-1"));
        api.fail_sends.store(true, Ordering::SeqCst);
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api.clone(), store.clone());

        let err = sender.send("Test").await.unwrap_err();
        assert!(err.is_application_error());
        assert_eq!(count_body(&store, "Test"), 0);
    }

    #[tokio::test]
    async fn test_socket_send_stays_pending_until_echo() {
        let connector = Arc::new(MockConnector::healthy());
        let mut manager = ConnectionManager::new(connector.clone(), ConnectionSettings::default());
        let _events = manager.connect(&endpoint()).await.unwrap();
        manager.authenticate("pat-1").await.unwrap();

        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api.clone(), store.clone())
            .with_connection(manager.handle())
            .with_optimistic_window(Duration::from_secs(30));

        assert_eq!(sender.path(), SendPath::Socket);
        let outcome = sender.send("Hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Emitted(_)));
        assert!(api.sent_bodies().is_empty());

        let pending = store.messages();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_pending());

        let emitted = connector.emitter(0).emitted.lock().unwrap().clone();
        let (name, payload) = emitted.last().unwrap();
        assert_eq!(name, "patientSendMessage");
        assert_eq!(payload["message"], "Hello");
        assert_eq!(payload["pharmacyId"], "ph-1");
    }

    #[tokio::test]
    async fn test_socket_emit_failure_falls_back_to_rest() {
        let connector = Arc::new(MockConnector::healthy());
        let mut manager = ConnectionManager::new(connector.clone(), ConnectionSettings::default());
        let _events = manager.connect(&endpoint()).await.unwrap();
        manager.authenticate("pat-1").await.unwrap();
        connector.emitter(0).fail_emits.store(true, Ordering::SeqCst);

        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api.clone(), store.clone()).with_connection(manager.handle());

        let outcome = sender.send("fallback").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered(_)));
        assert_eq!(api.sent_bodies(), vec!["fallback"]);
        assert_eq!(count_body(&store, "fallback"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_socket_send_expires() {
        let connector = Arc::new(MockConnector::healthy());
        let mut manager = ConnectionManager::new(connector.clone(), ConnectionSettings::default());
        let _events = manager.connect(&endpoint()).await.unwrap();
        manager.authenticate("pat-1").await.unwrap();

        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let (events, mut notices) = broadcast::channel(16);
        let context = order_context();
        let room = context.room_key(&patient()).unwrap();
        store.with(|s| s.set_room(room.clone()));
        let sender = MessageSender::new(patient(), context, room, store.clone(), api, events)
            .with_connection(manager.handle());

        sender.send("lost").await.unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.is_empty());

        let mut saw_notice = false;
        while let Ok(event) = notices.try_recv() {
            if let SessionEvent::Notice(notice) = event {
                saw_notice = notice.text.contains("lost");
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_still_scheduled_after_lock_poisoning() {
        let connector = Arc::new(MockConnector::healthy());
        let mut manager = ConnectionManager::new(connector.clone(), ConnectionSettings::default());
        let _events = manager.connect(&endpoint()).await.unwrap();
        manager.authenticate("pat-1").await.unwrap();

        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api, store.clone()).with_connection(manager.handle());

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = sender.expiries.lock().unwrap();
            panic!("poison the expiry set");
        }));
        assert!(poisoned.is_err());
        assert!(sender.expiries.is_poisoned());

        sender.send("stranded").await.unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_independent() {
        let api = Arc::new(MockChatApi::new("pat-1"));
        let store = SharedStore::new("pat-1");
        let sender = sender_for(api.clone(), store.clone());

        let (a, b) = tokio::join!(sender.send("one"), sender.send("two"));
        a.unwrap();
        b.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.with(|s| s.pending_count()), 0);
    }
}
