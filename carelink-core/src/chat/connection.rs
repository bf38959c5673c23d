use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SocketConfig;
use crate::error::{ChatError, ChatResult, RetryConfig};
use crate::models::ConnectionState;
use crate::protocol::{OutboundEvent, RECONNECTED_EVENT, RECONNECT_FAILED_EVENT};
use crate::transport::{EndpointResolver, SocketConnector, SocketEmitter, SocketEvent, SocketLink};

const AUTHENTICATED_EVENT: &str = "authenticated";

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Connect attempts before giving up, including the first
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
    pub auth_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnection_attempts: 5,
            reconnection_delay: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

impl ConnectionSettings {
    pub fn from_config(config: &SocketConfig, event_buffer: usize) -> Self {
        Self {
            reconnection_attempts: config.reconnection_attempts,
            reconnection_delay: config.reconnection_delay(),
            auth_timeout: config.auth_timeout(),
            event_buffer,
        }
    }

    fn retry_policy(&self) -> RetryConfig {
        RetryConfig::for_socket_reconnection(
            self.reconnection_attempts.max(1),
            self.reconnection_delay,
        )
    }
}

struct ConnectionShared {
    state: watch::Sender<ConnectionState>,
    emitter: RwLock<Option<Arc<dyn SocketEmitter>>>,
    user_id: RwLock<Option<String>>,
    closing: AtomicBool,
}

impl ConnectionShared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn emitter(&self) -> Option<Arc<dyn SocketEmitter>> {
        self.emitter.read().ok().and_then(|e| e.clone())
    }

    fn set_emitter(&self, emitter: Option<Arc<dyn SocketEmitter>>) -> Option<Arc<dyn SocketEmitter>> {
        match self.emitter.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, emitter),
            Err(_) => None,
        }
    }

    fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Cheap, cloneable view of a connection used by senders and room joiners.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub async fn emit(&self, event: &OutboundEvent) -> ChatResult<()> {
        self.emit_raw(event.name(), event.payload()).await
    }

    pub async fn emit_raw(&self, name: &str, payload: Value) -> ChatResult<()> {
        let emitter = self.shared.emitter().ok_or(ChatError::NotConnected)?;
        debug!(event = name, "Emitting socket event");
        emitter.emit(name, payload).await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the one socket of a chat surface.
///
/// Inbound events are forwarded to the receiver returned by
/// [`ConnectionManager::connect`]. A dropped socket is re-established with
/// the same policy as the first connect; after a successful reconnect the
/// remembered user is re-authenticated and a `reconnected` event is
/// forwarded. When attempts run out a `reconnect_failed` event is forwarded
/// and the state stays `Disconnected`.
pub struct ConnectionManager {
    connector: Arc<dyn SocketConnector>,
    settings: ConnectionSettings,
    shared: Arc<ConnectionShared>,
    pump: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn SocketConnector>, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            settings,
            shared: Arc::new(ConnectionShared {
                state,
                emitter: RwLock::new(None),
                user_id: RwLock::new(None),
                closing: AtomicBool::new(false),
            }),
            pump: None,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub async fn connect(
        &mut self,
        resolver: &dyn EndpointResolver,
    ) -> ChatResult<mpsc::Receiver<SocketEvent>> {
        let endpoint = resolver.resolve()?;
        self.shutdown_pump();
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        info!(endpoint = %endpoint, "Connecting chat socket");

        let policy = self.settings.retry_policy();
        let link = match establish(self.connector.as_ref(), &endpoint, &policy).await {
            Ok(link) => link,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.shared.set_emitter(Some(link.emitter));
        self.shared.set_state(ConnectionState::Connected);

        let (tx, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        self.pump = Some(tokio::spawn(run_pump(
            self.shared.clone(),
            self.connector.clone(),
            endpoint,
            policy,
            link.events,
            tx,
        )));
        Ok(rx)
    }

    /// Identify the user on the open socket and wait for the server's
    /// `authenticated` acknowledgement.
    pub async fn authenticate(&self, user_id: &str) -> ChatResult<()> {
        if user_id.trim().is_empty() {
            return Err(ChatError::MissingIdentifier("userId".to_string()));
        }
        if !self.state().is_live() {
            return Err(ChatError::NotConnected);
        }
        *self
            .shared
            .user_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(user_id.to_string());
        if self.state() == ConnectionState::Authenticated {
            return Ok(());
        }

        let mut state = self.shared.state.subscribe();
        self.handle()
            .emit(&OutboundEvent::Authenticate {
                user_id: user_id.to_string(),
            })
            .await?;

        let timeout = self.settings.auth_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Authenticated || !s.is_live()),
        )
        .await
        .map(|waited| waited.map(|s| *s == ConnectionState::Authenticated));

        match outcome {
            Ok(Ok(true)) => {
                info!(user_id, "Socket authenticated");
                Ok(())
            }
            Ok(_) => Err(ChatError::ConnectionClosed(
                "socket closed before authentication".to_string(),
            )),
            Err(_) => Err(ChatError::AuthenticationTimeout(timeout.as_secs())),
        }
    }

    /// Close the socket and stop reconnecting. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shutdown_pump();
        if let Some(emitter) = self.shared.set_emitter(None) {
            emitter.close().await;
            info!("Chat socket disconnected");
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn shutdown_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shutdown_pump();
        if let Some(emitter) = self.shared.set_emitter(None) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { emitter.close().await });
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

async fn establish(
    connector: &dyn SocketConnector,
    endpoint: &Url,
    policy: &RetryConfig,
) -> ChatResult<SocketLink> {
    for attempt in 0..policy.max_attempts {
        match connector.connect(endpoint).await {
            Ok(link) => {
                if attempt > 0 {
                    info!(attempt = attempt + 1, "Socket connected after retrying");
                }
                return Ok(link);
            }
            Err(e) => {
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error_code = e.error_code(),
                    "Socket connect failed: {}",
                    e
                );
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
    Err(ChatError::ReconnectExhausted {
        attempts: policy.max_attempts,
    })
}

async fn run_pump(
    shared: Arc<ConnectionShared>,
    connector: Arc<dyn SocketConnector>,
    endpoint: Url,
    policy: RetryConfig,
    mut events: mpsc::Receiver<SocketEvent>,
    out: mpsc::Sender<SocketEvent>,
) {
    let mut reauthenticating = false;

    loop {
        while let Some(event) = events.recv().await {
            let authenticated = event.name == AUTHENTICATED_EVENT;
            if authenticated {
                shared.set_state(ConnectionState::Authenticated);
            }
            if out.send(event).await.is_err() {
                debug!("Event receiver dropped, stopping pump");
                return;
            }
            if authenticated && reauthenticating {
                reauthenticating = false;
                if out
                    .send(SocketEvent::new(RECONNECTED_EVENT, Value::Null))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        shared.set_emitter(None);
        if shared.closing.load(Ordering::SeqCst) {
            shared.set_state(ConnectionState::Disconnected);
            return;
        }

        warn!("Chat socket dropped, reconnecting");
        shared.set_state(ConnectionState::Connecting);

        let link = match establish(connector.as_ref(), &endpoint, &policy).await {
            Ok(link) => link,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                e.log();
                let _ = out
                    .send(SocketEvent::new(
                        RECONNECT_FAILED_EVENT,
                        json!({ "attempts": policy.max_attempts }),
                    ))
                    .await;
                return;
            }
        };

        if shared.closing.load(Ordering::SeqCst) {
            link.emitter.close().await;
            shared.set_state(ConnectionState::Disconnected);
            return;
        }

        let emitter = link.emitter.clone();
        shared.set_emitter(Some(link.emitter));
        shared.set_state(ConnectionState::Connected);
        events = link.events;

        match shared.user_id() {
            Some(user_id) => {
                let auth = OutboundEvent::Authenticate { user_id };
                if let Err(e) = emitter.emit(auth.name(), auth.payload()).await {
                    warn!(error = %e, "Re-authentication emit failed");
                }
                reauthenticating = true;
            }
            None => {
                if out
                    .send(SocketEvent::new(RECONNECTED_EVENT, Value::Null))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory socket used by the chat tests.

    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockEmitter {
        pub emitted: Mutex<Vec<(String, Value)>>,
        pub fail_emits: AtomicBool,
        closed: AtomicBool,
    }

    impl MockEmitter {
        pub fn emitted_names(&self) -> Vec<String> {
            self.emitted
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SocketEmitter for MockEmitter {
        async fn emit(&self, event: &str, payload: Value) -> ChatResult<()> {
            if self.fail_emits.load(Ordering::SeqCst) {
                return Err(ChatError::ConnectionClosed("mock emit failure".into()));
            }
            self.emitted
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            !self.is_closed()
        }
    }

    /// Server side of one mock connection.
    pub struct MockServer {
        pub emitter: Arc<MockEmitter>,
        pub events: mpsc::Sender<SocketEvent>,
    }

    /// Connector that fails a scripted number of times, then hands out
    /// connections whose server halves are collected in `servers`.
    pub struct MockConnector {
        failures: Mutex<VecDeque<bool>>,
        fail_by_default: bool,
        pub attempts: Mutex<u32>,
        pub servers: Mutex<Vec<MockServer>>,
        /// Reply `authenticated` as soon as `authenticate` is emitted.
        pub auto_authenticate: bool,
    }

    impl MockConnector {
        pub fn healthy() -> Self {
            Self {
                failures: Mutex::new(VecDeque::new()),
                fail_by_default: false,
                attempts: Mutex::new(0),
                servers: Mutex::new(Vec::new()),
                auto_authenticate: true,
            }
        }

        pub fn always_failing() -> Self {
            Self {
                fail_by_default: true,
                ..Self::healthy()
            }
        }

        /// `script[i]` is whether attempt `i` fails.
        pub fn scripted(script: &[bool]) -> Self {
            Self {
                failures: Mutex::new(script.iter().copied().collect()),
                ..Self::healthy()
            }
        }

        pub fn without_auto_auth(mut self) -> Self {
            self.auto_authenticate = false;
            self
        }

        pub fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }

        pub fn connections(&self) -> usize {
            self.servers.lock().unwrap().len()
        }

        pub fn emitter(&self, index: usize) -> Arc<MockEmitter> {
            self.servers.lock().unwrap()[index].emitter.clone()
        }

        pub fn server_events(&self, index: usize) -> mpsc::Sender<SocketEvent> {
            self.servers.lock().unwrap()[index].events.clone()
        }

        /// Simulate the server dropping connection `index`.
        pub fn drop_connection(&self, index: usize) {
            let mut servers = self.servers.lock().unwrap();
            let (tx, _rx) = mpsc::channel(1);
            servers[index].events = tx;
        }
    }

    #[async_trait]
    impl SocketConnector for MockConnector {
        async fn connect(&self, _endpoint: &Url) -> ChatResult<SocketLink> {
            *self.attempts.lock().unwrap() += 1;
            let fail = self
                .failures
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fail_by_default);
            if fail {
                return Err(ChatError::ConnectionFailed {
                    endpoint: "mock".into(),
                    message: "connection refused".into(),
                });
            }

            let (tx, rx) = mpsc::channel(64);
            let emitter = Arc::new(MockEmitter::default());
            let link_emitter: Arc<dyn SocketEmitter> = if self.auto_authenticate {
                Arc::new(AutoAuthEmitter {
                    inner: emitter.clone(),
                    events: tx.downgrade(),
                })
            } else {
                emitter.clone()
            };
            tx.send(SocketEvent::new("connect", Value::Null)).await.unwrap();
            self.servers.lock().unwrap().push(MockServer {
                emitter,
                events: tx,
            });
            Ok(SocketLink {
                emitter: link_emitter,
                events: rx,
            })
        }
    }

    /// Holds only a weak sender so dropping the server half closes the link.
    struct AutoAuthEmitter {
        inner: Arc<MockEmitter>,
        events: mpsc::WeakSender<SocketEvent>,
    }

    #[async_trait]
    impl SocketEmitter for AutoAuthEmitter {
        async fn emit(&self, event: &str, payload: Value) -> ChatResult<()> {
            self.inner.emit(event, payload).await?;
            if event == "authenticate" {
                if let Some(events) = self.events.upgrade() {
                    let _ = events
                        .send(SocketEvent::new("authenticated", json!({"success": true})))
                        .await;
                }
            }
            Ok(())
        }

        async fn close(&self) {
            self.inner.close().await;
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    pub fn endpoint() -> Url {
        Url::parse("http://localhost:5000").unwrap()
    }
}
