#![allow(clippy::manual_range_contains, clippy::len_zero)]

pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod transport;

pub use chat::{
    ChatSession, ChatSessionBuilder, Composer, ConnectionManager, ConnectionSettings,
    HistoryPoller, MessageSender, MessageStore, Notice, NoticeLevel, RoomJoiner, ScrollController,
    SendOutcome, SendPath, SessionEvent, SessionSettings, SharedStore,
};
pub use client::{resolve_token, ChatApi, RestChatApi, SendRequest, TokenStore};
pub use config::{
    default_token_path, get_config_dir, get_data_dir, ApiConfig, AuthConfig, CarelinkConfig,
    ChatConfig, LoggingConfig, ScrollConfig, SocketConfig,
};
pub use error::{
    retry_async, retry_async_with_config, ChatError, ChatResult, CliErrorDisplay, RetryConfig,
};
pub use models::{
    ConnectionState, ConversationContext, DeliveryStatus, Message, Participant, Role, RoomKey,
};
pub use transport::{DeploymentResolver, EndpointResolver, SocketConnector, WebSocketConnector};
