use anyhow::Result;
use carelink_core::chat::format_elapsed;
use carelink_core::{CarelinkConfig, ChatSession, SessionEvent};
use clap::Args;
use colored::Colorize;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{session_builder, ConversationArgs};
use crate::display::{connection_line, message_line, notice_line};

#[derive(Args)]
pub struct ChatArgs {
    #[command(flatten)]
    pub conversation: ConversationArgs,

    #[arg(long, help = "Skip the socket and poll over REST only")]
    pub rest: bool,
}

const HELP: &str = "/refresh  reload history\n/call     start the call timer\n/hangup   stop the call timer\n/quit     leave";

pub async fn handle_chat_command(args: ChatArgs, config: &CarelinkConfig) -> Result<()> {
    println!("{}", "Opening conversation...".cyan().bold());
    let session = session_builder(&args.conversation, config, !args.rest)?
        .open()
        .await?;
    let mut events = session.subscribe();

    println!(
        "{} {}  {}",
        "Conversation".cyan().bold(),
        session.room().to_string().yellow(),
        connection_line(session.connection_state())
    );
    println!("{}", "Type a message and press Enter. /help lists commands.".dimmed());
    println!("{}", "═".repeat(60).dimmed());

    let mut printer = Printer::new(session.participant().id.clone());
    printer.flush(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" | "/exit" => break,
                    "/help" => println!("{}", HELP.dimmed()),
                    "/refresh" => {
                        if let Err(e) = session.refresh().await {
                            println!("{} {}", "✗".red().bold(), e);
                        }
                        printer.flush(&session);
                    }
                    "/call" => {
                        session.start_call();
                        println!("{} Call started", "·".blue());
                    }
                    "/hangup" => match session.end_call() {
                        Some(duration) => println!(
                            "{} Call ended after {}",
                            "·".blue(),
                            format_elapsed(duration.as_secs())
                        ),
                        None => println!("{}", "No call is running.".dimmed()),
                    },
                    text => {
                        // Failures are reported through the session's notices.
                        let _ = session.send(text).await;
                        printer.flush(&session);
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::MessagesChanged { .. }) => printer.flush(&session),
                Ok(SessionEvent::ConnectionChanged(state)) => println!("{}", connection_line(state)),
                Ok(SessionEvent::Notice(notice)) => println!("{}", notice_line(&notice)),
                Ok(SessionEvent::ComposerRestored(text)) => {
                    println!("{} {}", "Not sent:".yellow(), text);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Session events lagged");
                    printer.flush(&session);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(duration) = session.end_call() {
        println!("{} Call ended after {}", "·".blue(), format_elapsed(duration.as_secs()));
    }
    session.close().await;
    println!("{}", "Conversation closed.".dimmed());
    Ok(())
}

/// Prints each message once, and again when its status changes.
struct Printer {
    me: String,
    seen: HashMap<String, String>,
}

impl Printer {
    fn new(me: String) -> Self {
        Self {
            me,
            seen: HashMap::new(),
        }
    }

    fn flush(&mut self, session: &ChatSession) {
        for message in session.messages() {
            let key = message
                .client_message_id
                .clone()
                .unwrap_or_else(|| message.id.clone());
            let status = message.status.to_string();
            if self.seen.get(&key) == Some(&status) {
                continue;
            }
            // Confirmation of a message already shown as sending is silent.
            let was_pending = self.seen.insert(key, status).is_some();
            if was_pending && !message.is_pending() {
                continue;
            }
            println!("{}", message_line(&message, &self.me));
        }
    }
}
