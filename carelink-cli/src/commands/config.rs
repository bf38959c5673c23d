use anyhow::{Context, Result};
use carelink_core::{get_config_dir, CarelinkConfig, TokenStore};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Print the effective configuration")]
    Show {
        #[arg(
            short,
            long,
            default_value = "text",
            help = "Output format (text, json)"
        )]
        format: String,
    },

    #[command(about = "Print where configuration and the token are read from")]
    Path,

    #[command(about = "Store the bearer token used for API and socket requests")]
    SetToken {
        #[arg(help = "Bearer token")]
        token: String,
    },

    #[command(about = "Delete the stored bearer token")]
    ClearToken,
}

pub fn handle_config_command(action: Option<ConfigCommand>, config: &CarelinkConfig) -> Result<()> {
    match action {
        Some(ConfigCommand::Show { format }) => cmd_config_show(config, &format),
        Some(ConfigCommand::Path) => cmd_config_path(config),
        Some(ConfigCommand::SetToken { token }) => cmd_set_token(config, &token),
        Some(ConfigCommand::ClearToken) => cmd_clear_token(config),
        None => cmd_config_show(config, "text"),
    }
}

fn token_store(config: &CarelinkConfig) -> Result<TokenStore> {
    match &config.auth.token_file {
        Some(path) => Ok(TokenStore::new(path.clone())),
        None => TokenStore::default_location().context("Cannot locate the token file"),
    }
}

fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{}{}", visible, "*".repeat(8))
}

fn cmd_config_show(config: &CarelinkConfig, format: &str) -> Result<()> {
    let mut shown = config.clone();
    shown.auth.token = shown.auth.token.as_deref().map(mask_token);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    println!("{}", "CareLink Configuration".cyan().bold());
    println!("{}", "═".repeat(50).dimmed());
    println!();

    println!("{}", "API".yellow().bold());
    println!("  Base URL:         {}", shown.api.base_url);
    println!("  Timeout:          {}s", shown.api.request_timeout_secs);
    println!("  Max retries:      {}", shown.api.max_retries);
    println!();

    println!("{}", "Socket".yellow().bold());
    println!("  Origin:           {}", shown.socket.origin);
    println!("  Local port:       {}", shown.socket.local_port);
    println!("  Production host:  {}", shown.socket.production_host);
    println!(
        "  Reconnection:     {} attempts, {}ms apart",
        shown.socket.reconnection_attempts, shown.socket.reconnection_delay_ms
    );
    println!();

    println!("{}", "Chat".yellow().bold());
    println!("  Optimistic window: {}ms", shown.chat.optimistic_window_ms);
    println!(
        "  Poll interval:     {}ms (+{}ms jitter)",
        shown.chat.poll_interval_ms, shown.chat.poll_jitter_ms
    );
    println!();

    println!("{}", "Auth".yellow().bold());
    let token_source = match (&shown.auth.token, token_store(config)?.load()?) {
        (Some(masked), _) => format!("{} (from configuration)", masked),
        (None, Some(stored)) => format!("{} (stored)", mask_token(&stored)),
        (None, None) => "not set".dimmed().to_string(),
    };
    println!("  Token:            {}", token_source);
    println!();

    println!("{}", "Logging".yellow().bold());
    println!("  Level:            {}", shown.logging.level);
    println!("  JSON:             {}", shown.logging.json_format);
    Ok(())
}

fn cmd_config_path(config: &CarelinkConfig) -> Result<()> {
    let config_file = get_config_dir()
        .map(|dir| dir.join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("carelink.toml"));
    println!("  {} Config file: {}", "→".blue(), config_file.display());
    println!(
        "  {} Token file:  {}",
        "→".blue(),
        token_store(config)?.path().display()
    );
    Ok(())
}

fn cmd_set_token(config: &CarelinkConfig, token: &str) -> Result<()> {
    let store = token_store(config)?;
    store.save(token)?;
    println!(
        "{} Token saved to {}",
        "✓".green().bold(),
        store.path().display()
    );
    Ok(())
}

fn cmd_clear_token(config: &CarelinkConfig) -> Result<()> {
    let store = token_store(config)?;
    if store.clear()? {
        println!("{} Token removed", "✓".green().bold());
    } else {
        println!("{}", "No stored token.".yellow());
    }
    Ok(())
}
