use carelink_core::{CarelinkConfig, CliErrorDisplay, LoggingConfig};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod display;

use commands::{
    handle_chat_command, handle_config_command, handle_history_command, handle_send_command,
    ChatArgs, ConfigCommand, HistoryArgs, SendArgs,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "carelink")]
#[command(version = VERSION)]
#[command(about = "CareLink - realtime chat with your pharmacy and care team")]
#[command(long_about = r#"
CareLink chat client for patients, doctors and pharmacies.

Messages are delivered live over the CareLink socket when it is reachable
and over the REST API otherwise. Store a token once with
'carelink config set-token', then open a conversation with 'carelink chat'.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Print the message history of a conversation")]
    History(HistoryArgs),

    #[command(about = "Send a single message")]
    Send(SendArgs),

    #[command(about = "Open an interactive conversation")]
    Chat(ChatArgs),

    #[command(about = "Show configuration and manage the stored token")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommand>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = CarelinkConfig::load();
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(cli.verbose, &logging);

    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => {
            eprint!("{}: {}", "Error".red().bold(), CliErrorDisplay::new(&e));
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<carelink_core::ChatError>() {
                Some(chat_error) => {
                    eprint!("{}: {}", "Error".red().bold(), CliErrorDisplay::new(chat_error))
                }
                None => eprintln!("{}: {}", "Error".red().bold(), e),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // Logs go to stderr so chat output on stdout stays clean.
    let json = logging.json_format.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text = (!logging.json_format).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

async fn run(cli: Cli, config: CarelinkConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::History(args) => handle_history_command(args, &config).await,
        Commands::Send(args) => handle_send_command(args, &config).await,
        Commands::Chat(args) => handle_chat_command(args, &config).await,
        Commands::Config { action } => handle_config_command(action, &config),
    }
}
