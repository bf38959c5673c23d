//! Error types for the CareLink core library.
//!
//! Every failure the messaging layer can produce maps onto one [`ChatError`]
//! variant with a stable code. Callers catch errors at the boundary of the
//! operation that issued the network or socket call and turn them into
//! notices; nothing here is expected to reach a render path as a panic.
//!
//! # Error Codes Reference
//!
//! | Code Range | Category | Description |
//! |------------|----------|-------------|
//! | E1001-E1099 | Transport | Connection refused, timeouts, dropped sockets, exhausted retries |
//! | E2001-E2099 | Config | Environment, config file, and endpoint errors |
//! | E3001-E3099 | Protocol | Malformed packets, unexpected payload shapes |
//! | E4001-E4099 | Application | Server rejections, `chat-error` events, auth and HTTP status errors |
//! | E5001-E5099 | Validation | Requests rejected before any network call |
//! | E9001-E9099 | General | Internal, IO, and serialization errors |

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Default request timeout applied to REST calls, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Retry policy for REST calls: capped exponential backoff.
    pub fn for_api() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Socket reconnection policy: fixed delay, bounded attempts.
    pub fn for_socket_reconnection(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Up to 25% extra
            capped_delay * (1.0 + jitter_fraction() * 0.25)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Cheap jitter source based on the current timestamp.
/// Returns a value between 0.0 and 1.0.
pub(crate) fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// The main error type for the CareLink core library.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    // ========================================================================
    // Transport Errors (E1001-E1099)
    // ========================================================================
    /// Opening the socket failed
    #[error("[E1001] Failed to connect to {endpoint}: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    /// The live socket went away
    #[error("[E1002] Connection closed: {0}")]
    ConnectionClosed(String),

    /// The reconnection budget is spent
    #[error("[E1003] Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A REST request exceeded its timeout
    #[error("[E1004] Request timed out after {0} seconds")]
    RequestTimeout(u64),

    /// Backend unreachable or answering 5xx
    #[error("[E1005] Chat service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A socket operation was attempted without a live connection
    #[error("[E1006] Socket is not connected")]
    NotConnected,

    /// The server never acknowledged `authenticate`
    #[error("[E1007] Socket authentication not acknowledged within {0} seconds")]
    AuthenticationTimeout(u64),

    // ========================================================================
    // Configuration Errors (E2001-E2099)
    // ========================================================================
    /// Required environment variable is missing
    #[error("[E2001] Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Configuration file parse error
    #[error("[E2002] Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// Invalid configuration value
    #[error("[E2003] Invalid configuration value for '{key}': {message}")]
    InvalidConfigValue { key: String, message: String },

    /// Endpoint could not be resolved or parsed
    #[error("[E2004] Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    // ========================================================================
    // Protocol Errors (E3001-E3099)
    // ========================================================================
    /// A wire packet could not be decoded
    #[error("[E3001] Malformed packet: {0}")]
    MalformedPacket(String),

    /// JSON was valid but not the expected shape
    #[error("[E3002] Unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// Engine.IO / Socket.IO handshake did not complete
    #[error("[E3003] Handshake failed: {0}")]
    HandshakeFailed(String),

    // ========================================================================
    // Application Errors (E4001-E4099)
    // ========================================================================
    /// Server answered with `success: false`
    #[error("[E4001] Server rejected the request: {0}")]
    ServerRejected(String),

    /// Server pushed a `chat-error` event
    #[error("[E4002] Chat server reported an error: {0}")]
    ChatEvent(String),

    /// Bearer token missing or refused
    #[error("[E4003] Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// HTTP 429
    #[error("[E4004] Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// Any other non-success HTTP status
    #[error("[E4005] Request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },

    // ========================================================================
    // Validation Errors (E5001-E5099)
    // ========================================================================
    /// Message text is empty after trimming
    #[error("[E5001] Message text is empty")]
    EmptyMessage,

    /// A conversation identifier required for this operation is unknown
    #[error("[E5002] Missing conversation identifier: {0}")]
    MissingIdentifier(String),

    /// No receiver could be derived from the conversation
    #[error("[E5003] No recipient could be resolved for this conversation")]
    NoRecipient,

    // ========================================================================
    // General Errors (E9001-E9099)
    // ========================================================================
    /// Internal error (catch-all for unexpected conditions)
    #[error("[E9001] Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("[E9002] IO error: {0}")]
    IoError(String),

    /// Serialization/deserialization error
    #[error("[E9003] Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for CareLink operations.
pub type ChatResult<T> = Result<T, ChatError>;

// ============================================================================
// From trait implementations for seamless error propagation
// ============================================================================

impl ChatError {
    /// Classify an HTTP client error; `timeout_secs` is the limit the
    /// request ran with.
    pub fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ChatError::RequestTimeout(timeout_secs)
        } else {
            ChatError::from(err)
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::RequestTimeout(DEFAULT_REQUEST_TIMEOUT_SECS)
        } else if err.is_connect() {
            ChatError::ServiceUnavailable(err.to_string())
        } else if err.is_status() {
            match err.status() {
                Some(status) => ChatError::from_status(status.as_u16(), err.to_string(), None),
                None => ChatError::ServiceUnavailable(err.to_string()),
            }
        } else if err.is_decode() {
            ChatError::UnexpectedPayload(err.to_string())
        } else if err.is_request() {
            ChatError::ServiceUnavailable(err.to_string())
        } else {
            ChatError::Internal(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        let message = err.to_string();
        match err {
            WsError::Url(_) => ChatError::InvalidEndpoint(message),
            WsError::Http(response) => ChatError::HandshakeFailed(format!(
                "server answered HTTP {}",
                response.status().as_u16()
            )),
            WsError::Io(_) => ChatError::ConnectionFailed {
                endpoint: "socket".to_string(),
                message,
            },
            _ => ChatError::ConnectionClosed(message),
        }
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::InvalidEndpoint(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::IoError(err.to_string())
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => ChatError::InvalidConfigValue {
                key,
                message: "Key not found".to_string(),
            },
            config::ConfigError::FileParse { uri, cause } => ChatError::ConfigParseError(
                format!("Failed to parse {}: {}", uri.unwrap_or_default(), cause),
            ),
            config::ConfigError::Type {
                origin,
                unexpected,
                expected,
                key,
            } => ChatError::InvalidConfigValue {
                key: key.unwrap_or_else(|| origin.map(|o| o.to_string()).unwrap_or_default()),
                message: format!("Expected {}, got {}", expected, unexpected),
            },
            _ => ChatError::ConfigParseError(err.to_string()),
        }
    }
}

// ============================================================================
// Error categorization helpers
// ============================================================================

impl ChatError {
    /// Map an HTTP status (and optional `Retry-After`) to an error.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<u64>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ChatError::AuthenticationFailed(message),
            429 => ChatError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(60),
            },
            500..=599 => ChatError::ServiceUnavailable(format!("HTTP {}: {}", status, message)),
            _ => ChatError::RequestFailed { status, message },
        }
    }

    /// Returns true if this error comes from the transport layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            ChatError::ConnectionFailed { .. }
                | ChatError::ConnectionClosed(_)
                | ChatError::ReconnectExhausted { .. }
                | ChatError::RequestTimeout(_)
                | ChatError::ServiceUnavailable(_)
                | ChatError::NotConnected
                | ChatError::AuthenticationTimeout(_)
        )
    }

    /// Returns true if this error is related to configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ChatError::MissingEnvVar(_)
                | ChatError::ConfigParseError(_)
                | ChatError::InvalidConfigValue { .. }
                | ChatError::InvalidEndpoint(_)
        )
    }

    /// Returns true if the payload or packet shape was wrong.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ChatError::MalformedPacket(_)
                | ChatError::UnexpectedPayload(_)
                | ChatError::HandshakeFailed(_)
                | ChatError::SerializationError(_)
        )
    }

    /// Returns true if the server understood the request and refused it.
    pub fn is_application_error(&self) -> bool {
        matches!(
            self,
            ChatError::ServerRejected(_)
                | ChatError::ChatEvent(_)
                | ChatError::AuthenticationFailed(_)
                | ChatError::RateLimited { .. }
                | ChatError::RequestFailed { .. }
        )
    }

    /// Returns true if the request was rejected before touching the network.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            ChatError::EmptyMessage | ChatError::MissingIdentifier(_) | ChatError::NoRecipient
        )
    }

    /// Returns true if this error is transient and the operation might succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::ConnectionFailed { .. }
                | ChatError::ConnectionClosed(_)
                | ChatError::RequestTimeout(_)
                | ChatError::ServiceUnavailable(_)
                | ChatError::RateLimited { .. }
        )
    }

    /// Returns a suggested retry delay in seconds if the error is transient.
    pub fn suggested_retry_delay(&self) -> Option<u64> {
        match self {
            ChatError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            ChatError::ConnectionFailed { .. } | ChatError::ConnectionClosed(_) => Some(1),
            ChatError::ServiceUnavailable(_) => Some(5),
            ChatError::RequestTimeout(_) => Some(10),
            _ => None,
        }
    }

    /// Returns an error code suitable for logging or external reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            ChatError::ConnectionFailed { .. } => "E1001",
            ChatError::ConnectionClosed(_) => "E1002",
            ChatError::ReconnectExhausted { .. } => "E1003",
            ChatError::RequestTimeout(_) => "E1004",
            ChatError::ServiceUnavailable(_) => "E1005",
            ChatError::NotConnected => "E1006",
            ChatError::AuthenticationTimeout(_) => "E1007",
            ChatError::MissingEnvVar(_) => "E2001",
            ChatError::ConfigParseError(_) => "E2002",
            ChatError::InvalidConfigValue { .. } => "E2003",
            ChatError::InvalidEndpoint(_) => "E2004",
            ChatError::MalformedPacket(_) => "E3001",
            ChatError::UnexpectedPayload(_) => "E3002",
            ChatError::HandshakeFailed(_) => "E3003",
            ChatError::ServerRejected(_) => "E4001",
            ChatError::ChatEvent(_) => "E4002",
            ChatError::AuthenticationFailed(_) => "E4003",
            ChatError::RateLimited { .. } => "E4004",
            ChatError::RequestFailed { .. } => "E4005",
            ChatError::EmptyMessage => "E5001",
            ChatError::MissingIdentifier(_) => "E5002",
            ChatError::NoRecipient => "E5003",
            ChatError::Internal(_) => "E9001",
            ChatError::IoError(_) => "E9002",
            ChatError::SerializationError(_) => "E9003",
        }
    }

    /// Returns a user-friendly suggestion for how to resolve this error.
    pub fn user_suggestion(&self) -> Option<&'static str> {
        match self {
            ChatError::ReconnectExhausted { .. } => {
                Some("Live updates are paused; messages are still sent and refreshed over HTTP")
            }
            ChatError::AuthenticationFailed(_) => {
                Some("Sign in again or set CARELINK_AUTH_TOKEN to a valid token")
            }
            ChatError::RateLimited { .. } => Some("Wait a moment before sending more messages"),
            ChatError::MissingIdentifier(_) | ChatError::NoRecipient => {
                Some("Open the conversation from an order, appointment, or contact")
            }
            ChatError::InvalidEndpoint(_) => Some("Check api.base_url and socket settings"),
            ChatError::ServiceUnavailable(_) => Some("The chat service may be down. Try again shortly"),
            _ => None,
        }
    }

    /// Log this error with appropriate severity level.
    pub fn log(&self) {
        let code = self.error_code();
        let suggestion = self.user_suggestion();

        if self.is_transient() || self.is_validation_error() {
            warn!(
                error_code = %code,
                suggestion = suggestion,
                "Recoverable chat error: {}",
                self
            );
        } else {
            error!(
                error_code = %code,
                suggestion = suggestion,
                "Chat error: {}",
                self
            );
        }
    }
}

// ============================================================================
// Retry utilities
// ============================================================================

/// Execute an async operation with the default retry configuration.
pub async fn retry_async<F, Fut, T>(operation: F) -> ChatResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ChatResult<T>>,
{
    retry_async_with_config(operation, RetryConfig::default()).await
}

/// Execute an async operation with custom retry configuration.
///
/// Only transient errors are retried; anything else returns immediately.
pub async fn retry_async_with_config<F, Fut, T>(
    operation: F,
    config: RetryConfig,
) -> ChatResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ChatResult<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        "Operation succeeded on attempt {} after {} retries",
                        attempt + 1,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_transient() || attempt + 1 >= config.max_attempts {
                    e.log();
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ChatError::Internal("Retry loop ran zero attempts".to_string())))
}

// ============================================================================
// User-friendly error formatting for CLI
// ============================================================================

/// Format an error for terminal display with suggestions.
pub struct CliErrorDisplay<'a> {
    error: &'a ChatError,
    show_suggestion: bool,
}

impl<'a> CliErrorDisplay<'a> {
    pub fn new(error: &'a ChatError) -> Self {
        Self {
            error,
            show_suggestion: true,
        }
    }

    pub fn without_suggestion(mut self) -> Self {
        self.show_suggestion = false;
        self
    }
}

impl<'a> fmt::Display for CliErrorDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.error)?;

        if self.show_suggestion {
            if let Some(suggestion) = self.error.user_suggestion() {
                writeln!(f)?;
                writeln!(f, "  Suggestion: {}", suggestion)?;
            }
        }

        if let Some(delay) = self.error.suggested_retry_delay() {
            writeln!(f)?;
            writeln!(
                f,
                "  This error may be temporary. Try again in {} seconds.",
                delay
            )?;
        }

        Ok(())
    }
}
