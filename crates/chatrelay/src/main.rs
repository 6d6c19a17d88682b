//! chatrelay daemon - WebSocket relay for streamed chat completions

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::RelayError;
use chatrelay::config::Config;
use chatrelay::error::Result;
use chatrelay::relay::{OpenAiGateway, RelayOrchestrator};
use chatrelay::server::RelayServer;

/// chatrelay - Stream chat completions to WebSocket clients
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "A WebSocket relay that streams chat completions from an OpenAI-compatible provider")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
    /// Print the effective configuration and exit
    #[command(name = "config")]
    Config,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Config) => print_config(&config),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatrelay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file, apply environment overrides and validate
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            Config::from_toml_file(&path)?
        }
        None => {
            let default_paths = [
                dirs::home_dir().map(|h| h.join(".chatrelay").join("config.toml")),
                dirs::config_dir().map(|c| c.join("chatrelay").join("config.toml")),
                Some(PathBuf::from("config.toml")),
            ];

            match default_paths.iter().flatten().find(|p| p.exists()) {
                Some(path) => {
                    tracing::info!("Loading config from: {}", path.display());
                    Config::from_toml_file(path)?
                }
                None => {
                    tracing::info!("No config file found, using defaults");
                    Config::default()
                }
            }
        }
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn print_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| RelayError::Config(format!("Failed to render config: {e}")))?;
    println!("{rendered}");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting chatrelay");
    tracing::debug!(
        "Config loaded: server={:?} relay={:?} model={} base_url={}",
        config.server,
        config.relay,
        config.provider.model,
        config.provider.base_url
    );

    let gateway = OpenAiGateway::new(&config.provider)
        .map_err(|e| RelayError::Provider(format!("Failed to create provider client: {e}")))?;
    let orchestrator = Arc::new(RelayOrchestrator::new(
        Arc::new(gateway),
        config.relay.clone(),
    ));
    tracing::info!(
        "Concurrency cap: {}, retry delay: {}ms, apology: {}",
        config.relay.concurrency_cap,
        config.relay.retry_delay_ms,
        config.relay.apology_enabled
    );

    let server = RelayServer::new(config.server.clone(), orchestrator);
    server.serve().await?;

    tracing::info!("chatrelay stopped");
    Ok(())
}
