//! Gemlink command-line interface.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use gemlink_client::GeminiClient;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gemlink", version, about = "Gemini API connector")]
struct Cli {
    /// Path to a TOML config file (default: ~/.gemlink/config.toml).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot text generation from a prompt.
    Generate {
        prompt: String,
        /// Print chunks as they arrive instead of waiting for the full response.
        #[arg(long)]
        stream: bool,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Interactive multi-turn chat.
    Chat,
    /// Check that the configured credential and model can serve a request.
    Validate,
    /// Print metadata for the configured model.
    ModelInfo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = config::GemlinkConfig::load(cli.config).await?;
    init_tracing(cfg.general.log_filter.as_deref(), cfg.general.log_file.as_deref())?;
    install_panic_hook();

    let client = GeminiClient::new(cfg.into_client_config()?)?;

    // Ctrl-C cancels the in-flight call, including any pending backoff.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Generate {
            prompt,
            stream,
            temperature,
            max_tokens,
        } => commands::generate(&client, &prompt, stream, temperature, max_tokens, cancel).await,
        Command::Chat => commands::chat(&client, cancel).await,
        Command::Validate => commands::validate(&client).await,
        Command::ModelInfo => commands::model_info(&client).await,
    }
}

fn init_tracing(config_filter: Option<&str>, log_file: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            config_filter.unwrap_or("warn,gemlink=info,gemlink_client=info"),
        ),
    };
    let log_format = std::env::var("GEMLINK_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    // Logs always go to stderr; a configured log file receives a copy.
    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("open log file {path}: {e}"))?;
            BoxMakeWriter::new(std::io::stderr.and(std::sync::Mutex::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_target(true)
                .json()
                .flatten_event(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_target(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_target(false)
                .with_ansi(log_file.is_none())
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported GEMLINK_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(panic_location = %location, "panic captured");
        default_hook(panic_info);
    }));
}
