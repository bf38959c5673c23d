//! One open conversation: history, live delivery, sending and fallbacks.
//!
//! Opening a session loads the room history, connects and authenticates the
//! socket, and joins the room. When the socket cannot be brought up the
//! session keeps working over REST and polls history instead. Everything the
//! view needs to redraw is published as [`SessionEvent`]s.

use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::call::{self, CallHandle};
use super::connection::{ConnectionHandle, ConnectionManager, ConnectionSettings};
use super::event::{Notice, SessionEvent};
use super::poller::{HistoryPoller, PollTarget, PollerSettings};
use super::rooms::RoomJoiner;
use super::sender::{Composer, MessageSender, SendOutcome, SendPath};
use super::store::SharedStore;
use crate::client::ChatApi;
use crate::config::CarelinkConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{ConnectionState, ConversationContext, Message, Participant, RoomKey};
use crate::protocol::InboundEvent;
use crate::transport::{EndpointResolver, SocketConnector, SocketEvent};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connection: ConnectionSettings,
    pub poller: PollerSettings,
    pub optimistic_window: Duration,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            poller: PollerSettings::default(),
            optimistic_window: Duration::from_secs(1),
            event_buffer: 256,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &CarelinkConfig) -> Self {
        Self {
            connection: ConnectionSettings::from_config(&config.socket, config.chat.event_buffer),
            poller: PollerSettings::from_config(&config.chat),
            optimistic_window: config.chat.optimistic_window(),
            event_buffer: config.chat.event_buffer,
        }
    }
}

/// State shared between the session and its event pump.
struct SessionShared {
    me: Participant,
    context: ConversationContext,
    room: RoomKey,
    store: SharedStore,
    api: Arc<dyn ChatApi>,
    rooms: RoomJoiner,
    events: broadcast::Sender<SessionEvent>,
    poller: Mutex<Option<HistoryPoller>>,
    poller_settings: PollerSettings,
    visible: watch::Sender<bool>,
}

impl SessionShared {
    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, error: &ChatError) {
        error.log();
        self.notify(SessionEvent::Notice(Notice::from_error(error)));
    }

    fn messages_changed(&self) {
        self.notify(SessionEvent::MessagesChanged {
            count: self.store.len(),
        });
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<HistoryPoller>> {
        self.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_polling(&self) -> bool {
        self.lock_poller()
            .as_ref()
            .map_or(false, HistoryPoller::is_running)
    }

    fn start_poller(&self) {
        let mut slot = self.lock_poller();
        if slot.as_ref().map_or(false, HistoryPoller::is_running) {
            return;
        }
        let target = PollTarget {
            api: self.api.clone(),
            store: self.store.clone(),
            room: self.room.clone(),
            viewer_id: self.me.id.clone(),
            events: self.events.clone(),
        };
        *slot = Some(HistoryPoller::start(
            target,
            self.poller_settings.clone(),
            self.visible.subscribe(),
        ));
    }

    fn stop_poller(&self) {
        let poller = self.lock_poller().take();
        if poller.is_some() {
            info!(room = %self.room, "Live delivery restored, history polling stopped");
        }
    }

    fn apply_inbound(&self, payload: &Value) {
        let message = match Message::from_wire(payload, Utc::now()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed inbound message");
                return;
            }
        };
        let outcome = self.store.with(|store| store.apply_inbound(message));
        debug!(?outcome, "Inbound message applied");
        if outcome.changed() {
            self.messages_changed();
        }
    }

    async fn on_reconnected(&self, connection: &ConnectionHandle) {
        self.rooms.clear();
        match self.rooms.join_room(connection, &self.me, &self.context).await {
            Ok(_) => self.stop_poller(),
            Err(e) => self.report(&e),
        }

        match self.store.refresh(self.api.as_ref(), &self.room, &self.me.id).await {
            Ok(changed) if changed > 0 => self.messages_changed(),
            Ok(_) => {}
            Err(e) => self.report(&e),
        }
        self.notify(SessionEvent::Notice(Notice::info("Reconnected")));
    }
}

async fn run_session_pump(
    shared: Arc<SessionShared>,
    connection: ConnectionHandle,
    mut events: mpsc::Receiver<SocketEvent>,
) {
    let mut state = connection.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_socket_event(&shared, &connection, event).await;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                shared.notify(SessionEvent::ConnectionChanged(current));
            }
        }
    }
    debug!("Session event pump finished");
}

async fn handle_socket_event(
    shared: &SessionShared,
    connection: &ConnectionHandle,
    event: SocketEvent,
) {
    match InboundEvent::from_socket(&event.name, event.payload) {
        InboundEvent::Message(payload) => shared.apply_inbound(&payload),
        InboundEvent::Disconnected { reason } => {
            info!(reason = %reason, "Chat socket disconnected");
            shared.rooms.clear();
        }
        InboundEvent::Reconnected => shared.on_reconnected(connection).await,
        InboundEvent::ReconnectFailed => {
            shared.rooms.clear();
            shared.notify(SessionEvent::Notice(Notice::warning(
                "Live updates unavailable, refreshing periodically",
            )));
            shared.start_poller();
        }
        InboundEvent::ChatError(text) => shared.report(&ChatError::ChatEvent(text)),
        InboundEvent::RoomJoined(payload) => debug!(%payload, "Room join acknowledged"),
        InboundEvent::Connected | InboundEvent::Authenticated => {}
        InboundEvent::Other { name, .. } => debug!(event = %name, "Ignoring socket event"),
    }
}

pub struct ChatSessionBuilder {
    me: Participant,
    context: ConversationContext,
    api: Arc<dyn ChatApi>,
    connector: Option<Arc<dyn SocketConnector>>,
    resolver: Option<Arc<dyn EndpointResolver>>,
    settings: SessionSettings,
}

impl ChatSessionBuilder {
    /// Use a socket for live delivery. Without one the session polls.
    pub fn with_socket(
        mut self,
        connector: Arc<dyn SocketConnector>,
        resolver: Arc<dyn EndpointResolver>,
    ) -> Self {
        self.connector = Some(connector);
        self.resolver = Some(resolver);
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn open(self) -> ChatResult<ChatSession> {
        let room = self.context.room_key(&self.me)?;
        let (events, _) = broadcast::channel(self.settings.event_buffer.max(1));
        let (visible, _) = watch::channel(true);

        let store = SharedStore::new(self.me.id.clone());
        store.with(|s| s.set_room(room.clone()));

        let shared = Arc::new(SessionShared {
            me: self.me.clone(),
            context: self.context.clone(),
            room: room.clone(),
            store: store.clone(),
            api: self.api.clone(),
            rooms: RoomJoiner::new(),
            events: events.clone(),
            poller: Mutex::new(None),
            poller_settings: self.settings.poller.clone(),
            visible,
        });

        info!(room = %room, user = %self.me.id, "Opening chat session");
        match store.load_history(self.api.as_ref(), &room, &self.me.id).await {
            Ok(count) => {
                debug!(count, "History loaded");
                shared.messages_changed();
            }
            Err(e) => shared.report(&e),
        }

        let mut connection = None;
        let mut pump = None;
        let mut live = false;

        if let (Some(connector), Some(resolver)) = (self.connector, self.resolver) {
            let mut manager = ConnectionManager::new(connector, self.settings.connection.clone());
            match manager.connect(resolver.as_ref()).await {
                Ok(socket_events) => {
                    let handle = manager.handle();
                    pump = Some(tokio::spawn(run_session_pump(
                        shared.clone(),
                        handle.clone(),
                        socket_events,
                    )));
                    match manager.authenticate(&self.me.id).await {
                        Ok(()) => match shared.rooms.join_room(&handle, &self.me, &self.context).await {
                            Ok(_) => live = true,
                            Err(e) => shared.report(&e),
                        },
                        Err(e) => shared.report(&e),
                    }
                    connection = Some(manager);
                }
                Err(e) => shared.report(&e),
            }
        }

        if !live {
            warn!(room = %room, "No live delivery, falling back to history polling");
            shared.start_poller();
        }

        let mut sender = MessageSender::new(
            self.me,
            self.context,
            room,
            store,
            self.api,
            events,
        )
        .with_optimistic_window(self.settings.optimistic_window);
        if let Some(manager) = &connection {
            sender = sender.with_connection(manager.handle());
        }

        Ok(ChatSession {
            shared,
            connection,
            sender,
            composer: Mutex::new(Composer::new()),
            pump,
            call: Mutex::new(None),
        })
    }
}

/// An open conversation. Drop or [`close`](Self::close) it to tear down the
/// socket, the poller and any running call.
pub struct ChatSession {
    shared: Arc<SessionShared>,
    connection: Option<ConnectionManager>,
    sender: MessageSender,
    composer: Mutex<Composer>,
    pump: Option<JoinHandle<()>>,
    call: Mutex<Option<CallHandle>>,
}

impl ChatSession {
    pub fn builder(
        me: Participant,
        context: ConversationContext,
        api: Arc<dyn ChatApi>,
    ) -> ChatSessionBuilder {
        ChatSessionBuilder {
            me,
            context,
            api,
            connector: None,
            resolver: None,
            settings: SessionSettings::default(),
        }
    }

    pub fn room(&self) -> &RoomKey {
        &self.shared.room
    }

    pub fn participant(&self) -> &Participant {
        &self.shared.me
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.store.messages()
    }

    pub fn last_error(&self) -> Option<ChatError> {
        self.shared.store.with(|s| s.last_error().cloned())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, ConnectionManager::state)
    }

    pub fn joined_rooms(&self) -> Vec<RoomKey> {
        self.shared.rooms.joined()
    }

    pub fn send_path(&self) -> SendPath {
        self.sender.path()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.is_polling()
    }

    /// Send `text`. On failure the text goes back into the composer.
    pub async fn send(&self, text: &str) -> ChatResult<SendOutcome> {
        match self.sender.send(text).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if !text.trim().is_empty() {
                    let restored = {
                        let mut composer = self.composer();
                        composer.restore(text);
                        composer.text().to_string()
                    };
                    self.shared.notify(SessionEvent::ComposerRestored(restored));
                }
                self.shared.report(&e);
                Err(e)
            }
        }
    }

    /// Send whatever is in the composer and clear it.
    pub async fn submit(&self) -> ChatResult<SendOutcome> {
        let text = self.composer().take();
        self.send(&text).await
    }

    fn composer(&self) -> MutexGuard<'_, Composer> {
        self.composer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_composer(&self, text: impl Into<String>) {
        self.composer().set(text);
    }

    pub fn composer_text(&self) -> String {
        self.composer().text().to_string()
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.shared.store.with(|s| s.mark_read(id))
    }

    /// Polling is skipped while the view is hidden.
    pub fn set_visible(&self, visible: bool) {
        self.shared.visible.send_replace(visible);
    }

    /// Merge the server's history into the list now.
    pub async fn refresh(&self) -> ChatResult<usize> {
        let changed = self
            .shared
            .store
            .refresh(self.shared.api.as_ref(), &self.shared.room, &self.shared.me.id)
            .await?;
        if changed > 0 {
            self.shared.messages_changed();
        }
        Ok(changed)
    }

    /// Start the call timer, or return the running one's ticks.
    pub fn start_call(&self) -> watch::Receiver<u64> {
        let mut slot = self.call.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.get_or_insert_with(call::start_call).subscribe()
    }

    pub fn end_call(&self) -> Option<Duration> {
        let handle = self
            .call
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        handle.map(call::end_call)
    }

    pub async fn close(mut self) {
        info!(room = %self.shared.room, "Closing chat session");
        self.teardown();
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect().await;
        }
    }

    fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.end_call();
        self.shared.stop_poller();
        self.shared.rooms.clear();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
