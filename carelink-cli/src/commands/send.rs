use anyhow::Result;
use carelink_core::{CarelinkConfig, SendOutcome, SessionEvent};
use clap::Args;
use colored::Colorize;
use std::time::Duration;

use crate::config::{session_builder, ConversationArgs};

#[derive(Args)]
pub struct SendArgs {
    #[command(flatten)]
    pub conversation: ConversationArgs,

    #[arg(help = "Message text")]
    pub text: String,

    #[arg(long, help = "Skip the socket and send over REST only")]
    pub rest: bool,
}

pub async fn handle_send_command(args: SendArgs, config: &CarelinkConfig) -> Result<()> {
    let session = session_builder(&args.conversation, config, !args.rest)?
        .open()
        .await?;
    let mut events = session.subscribe();

    let outcome = session.send(&args.text).await;
    let result = match outcome {
        Ok(SendOutcome::Delivered(message)) => {
            println!("{} Sent ({})", "✓".green().bold(), message.id.dimmed());
            Ok(())
        }
        Ok(SendOutcome::Emitted(handle)) => {
            let window = config.chat.optimistic_window() + Duration::from_secs(1);
            let confirmed = tokio::time::timeout(window, async {
                loop {
                    let pending = session
                        .messages()
                        .iter()
                        .any(|m| m.id == handle.temp_id());
                    if !pending {
                        return;
                    }
                    match events.recv().await {
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => return,
                    }
                }
            })
            .await
            .is_ok();

            let me = session.participant().id.clone();
            let delivered = session.messages().iter().any(|m| {
                !m.is_temporary()
                    && (m.client_message_id.as_deref() == Some(handle.client_message_id())
                        || (m.is_own(&me) && m.body == args.text.trim()))
            });
            if confirmed && delivered {
                println!("{} Sent", "✓".green().bold());
            } else {
                println!(
                    "{} Sent on the live channel, the server has not confirmed it yet",
                    "!".yellow().bold()
                );
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    };

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Notice(notice) = event {
            tracing::debug!(text = %notice.text, "Session notice");
        }
    }
    session.close().await;
    result
}
