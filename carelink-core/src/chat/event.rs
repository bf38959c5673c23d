use serde::Serialize;

use crate::error::ChatError;
use crate::models::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A transient, user-facing status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub code: Option<&'static str>,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            code: None,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            code: None,
            text: text.into(),
        }
    }

    pub fn from_error(error: &ChatError) -> Self {
        let level = if error.is_transient() || error.is_validation_error() {
            NoticeLevel::Warning
        } else {
            NoticeLevel::Error
        };
        let text = match error.user_suggestion() {
            Some(suggestion) => format!("{} ({})", error, suggestion),
            None => error.to_string(),
        };
        Self {
            level,
            code: Some(error.error_code()),
            text,
        }
    }
}

/// What a chat session reports to the surface rendering it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The message list changed; `count` is its new length
    MessagesChanged { count: usize },
    ConnectionChanged(ConnectionState),
    Notice(Notice),
    /// A failed send put its text back into the composer
    ComposerRestored(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_from_error() {
        let notice = Notice::from_error(&ChatError::EmptyMessage);
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert_eq!(notice.code, Some("E5001"));

        let notice = Notice::from_error(&ChatError::ServerRejected("nope".into()));
        assert_eq!(notice.level, NoticeLevel::Error);
        assert!(notice.text.contains("nope"));
    }
}
