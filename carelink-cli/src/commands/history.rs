use anyhow::Result;
use carelink_core::{CarelinkConfig, ChatApi, MessageStore};
use chrono::Local;
use clap::Args;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use crate::config::{rest_api, ConversationArgs};

#[derive(Args)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub conversation: ConversationArgs,

    #[arg(short, long, help = "Show only the newest N messages")]
    pub limit: Option<usize>,

    #[arg(
        short,
        long,
        default_value = "text",
        help = "Output format (text, json)"
    )]
    pub format: String,
}

pub async fn handle_history_command(args: HistoryArgs, config: &CarelinkConfig) -> Result<()> {
    let me = args.conversation.participant();
    let room = args.conversation.context().room_key(&me)?;
    let api = rest_api(config)?;

    let mut store = MessageStore::new(me.id.clone());
    store.set_room(room.clone());
    store.replace_history(api.fetch_history(&room, &me.id).await?);

    let messages = store.messages();
    let skip = args
        .limit
        .map_or(0, |limit| messages.len().saturating_sub(limit));
    let shown = &messages[skip..];

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(shown)?);
        return Ok(());
    }

    if shown.is_empty() {
        println!("{}", "No messages in this conversation yet.".yellow());
        return Ok(());
    }

    println!("{} {}", "Conversation".cyan().bold(), room.to_string().yellow());
    println!("{}", "═".repeat(80).dimmed());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Time").fg(comfy_table::Color::Cyan),
            Cell::new("From").fg(comfy_table::Color::Cyan),
            Cell::new("Message").fg(comfy_table::Color::Cyan),
            Cell::new("Read").fg(comfy_table::Color::Cyan),
        ]);

    for message in shown {
        let from = if message.is_own(&me.id) {
            "you".to_string()
        } else {
            message
                .sender_name
                .clone()
                .unwrap_or_else(|| message.sender_id.clone())
        };
        let mut body = message.body.clone();
        if let Some(attachment) = &message.attachment {
            body.push_str(&format!(" [file: {}]", attachment.file_url));
        }

        table.add_row(vec![
            Cell::new(
                message
                    .timestamp
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string(),
            ),
            Cell::new(from),
            Cell::new(body.trim()),
            Cell::new(if message.is_read { "✓" } else { "" }),
        ]);
    }

    println!("{}", table);
    println!();
    if skip > 0 {
        println!("  Showing {} of {} messages", shown.len(), messages.len());
    } else {
        println!("  Total: {} messages", messages.len());
    }
    Ok(())
}
