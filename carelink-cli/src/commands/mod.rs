pub mod chat;
pub mod config;
pub mod history;
pub mod send;

pub use chat::{handle_chat_command, ChatArgs};
pub use config::{handle_config_command, ConfigCommand};
pub use history::{handle_history_command, HistoryArgs};
pub use send::{handle_send_command, SendArgs};
