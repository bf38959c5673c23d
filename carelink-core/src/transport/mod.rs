//! Socket transport abstraction.
//!
//! The connection manager only ever talks to a [`SocketConnector`]; the
//! WebSocket implementation lives in [`websocket`] and tests plug in
//! in-memory connectors.

pub mod endpoint;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::error::ChatResult;

pub use endpoint::{socket_url, DeploymentResolver, EndpointResolver};
pub use websocket::WebSocketConnector;

/// A named event received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub name: String,
    pub payload: Value,
}

impl SocketEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketEmitter: Send + Sync {
    async fn emit(&self, event: &str, payload: Value) -> ChatResult<()>;

    /// Close the socket. Safe to call more than once.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// An established socket: the emitter plus the stream of inbound events.
///
/// The event channel closing means the connection is gone.
pub struct SocketLink {
    pub emitter: Arc<dyn SocketEmitter>,
    pub events: mpsc::Receiver<SocketEvent>,
}

impl std::fmt::Debug for SocketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLink")
            .field("open", &self.emitter.is_open())
            .finish()
    }
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a connection. Resolves once the server accepted the session.
    async fn connect(&self, endpoint: &Url) -> ChatResult<SocketLink>;
}
