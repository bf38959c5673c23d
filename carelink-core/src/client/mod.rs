pub mod auth;
pub mod rest;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{resolve_token, TokenStore};
pub use rest::{parse_history, ChatApi, RestChatApi, SendRequest};
