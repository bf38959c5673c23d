use carelink_core::{ConnectionState, DeliveryStatus, Message, Notice, NoticeLevel};
use chrono::Local;
use colored::Colorize;

pub fn message_line(message: &Message, me: &str) -> String {
    let time = message
        .timestamp
        .with_timezone(&Local)
        .format("%H:%M")
        .to_string();
    let author = if message.is_own(me) {
        "you".green().bold()
    } else {
        message
            .sender_name
            .as_deref()
            .unwrap_or(&message.sender_id)
            .cyan()
            .bold()
    };

    let mut body = message.body.clone();
    if let Some(attachment) = &message.attachment {
        let name = attachment.file_name.as_deref().unwrap_or(&attachment.file_url);
        body = if body.is_empty() {
            format!("[file] {}", name)
        } else {
            format!("{} [file] {}", body, name)
        };
    }

    let status = match message.status {
        DeliveryStatus::Pending => format!(" {}", "(sending)".dimmed()),
        DeliveryStatus::Failed => format!(" {}", "(failed)".red()),
        DeliveryStatus::Confirmed => String::new(),
    };

    format!("{} {}: {}{}", time.dimmed(), author, body, status)
}

pub fn notice_line(notice: &Notice) -> String {
    match notice.level {
        NoticeLevel::Info => format!("{} {}", "·".blue(), notice.text),
        NoticeLevel::Warning => format!("{} {}", "!".yellow().bold(), notice.text.yellow()),
        NoticeLevel::Error => format!("{} {}", "✗".red().bold(), notice.text.red()),
    }
}

pub fn connection_line(state: ConnectionState) -> String {
    let label = state.to_string();
    match state {
        ConnectionState::Authenticated => format!("{} {}", "●".green(), label.green()),
        ConnectionState::Connected | ConnectionState::Connecting => {
            format!("{} {}", "●".yellow(), label.yellow())
        }
        ConnectionState::Disconnected => format!("{} {}", "●".red(), label.red()),
    }
}
