use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use zeroize::Zeroize;

use scrollwork_lib::auth::{CredentialKey, CredentialStore};
use scrollwork_lib::config::{AgentConfig, ConfigFile};
use scrollwork_lib::security::SecureString;
use scrollwork_lib::{Agent, RiskThresholds};

#[derive(Parser)]
#[command(name = "scrollwork", version)]
#[command(about = "Tracks LLM API token usage and reports prompt cost risk over a local socket")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Model to track; repeat for several models
    #[arg(short, long = "model", value_name = "MODEL")]
    models: Vec<String>,

    /// Anthropic API key, used for token counting
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    /// Anthropic admin key, used for usage reports
    #[arg(long, env = "ANTHROPIC_ADMIN_KEY", hide_env_values = true)]
    anthropic_admin_key: Option<String>,

    /// OpenAI admin key, used for usage reports
    #[arg(long, env = "OPENAI_ADMIN_KEY", hide_env_values = true)]
    openai_admin_key: Option<String>,

    /// Usage refresh interval in minutes
    #[arg(
        long,
        env = "SCROLLWORK_REFRESH_RATE",
        value_name = "MINUTES",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    refresh_rate: Option<u64>,

    /// Low risk threshold in tokens
    #[arg(long)]
    low: Option<f64>,

    /// Medium risk threshold in tokens
    #[arg(long)]
    medium: Option<f64>,

    /// High risk threshold in tokens
    #[arg(long)]
    high: Option<f64>,

    /// Socket path to listen on
    #[arg(long, env = "SCROLLWORK_SOCKET", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long, env = "SCROLLWORK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Manage provider keys in the system keyring
    #[command(subcommand)]
    Keys(KeysCommand),
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Store a key, read from stdin
    Set {
        /// anthropic-api-key, anthropic-admin-key or openai-admin-key
        name: CredentialKey,
    },
    /// Remove a stored key
    Delete { name: CredentialKey },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    scrollwork_lib::init_tracing(cli.log_json);

    if let Some(Command::Keys(command)) = cli.command.take() {
        return manage_keys(command);
    }

    let config = build_config(cli)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        models = ?config.models,
        socket = %config.socket_path.display(),
        refresh_interval = ?config.refresh_interval,
        "Starting scrollwork"
    );

    let agent = Agent::new(config);
    agent.start().await.context("Failed to start agent")?;
    agent.run().await.context("Failed to start listener")?;

    wait_for_shutdown().await?;
    tracing::info!("Shutting down");

    agent.stop().await.context("Failed to stop agent")?;
    Ok(())
}

/// Layers defaults, config file, flags and environment, then the keyring
fn build_config(cli: Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::default();

    if let Some(ref path) = cli.config {
        ConfigFile::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
            .apply(&mut config);
    }

    if !cli.models.is_empty() {
        config.models = cli.models;
    }
    if let Some(minutes) = cli.refresh_rate {
        config.refresh_interval = Duration::from_secs(minutes * 60);
    }
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    match (cli.low, cli.medium, cli.high) {
        (Some(low), Some(medium), Some(high)) => {
            config.thresholds = RiskThresholds::new(low, medium, high);
        }
        (None, None, None) => {}
        _ => bail!("--low, --medium and --high must be given together"),
    }

    let keys = [
        (CredentialKey::AnthropicApiKey, cli.anthropic_api_key),
        (CredentialKey::AnthropicAdminKey, cli.anthropic_admin_key),
        (CredentialKey::OpenAIAdminKey, cli.openai_admin_key),
    ];
    for (key, value) in keys {
        if let Some(value) = value {
            config.credentials.set(key, SecureString::new(value));
        }
    }
    config.credentials.fill_from(&CredentialStore::new());

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn manage_keys(command: KeysCommand) -> Result<()> {
    let store = CredentialStore::new();

    match command {
        KeysCommand::Set { name } => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read key from stdin")?;
            let value = SecureString::from(input.trim());
            input.zeroize();

            if value.is_blank() {
                bail!("No key given on stdin");
            }
            store
                .set(name, &value)
                .with_context(|| format!("Failed to store {name}"))?;
            println!("Stored {name} in the system keyring");
        }
        KeysCommand::Delete { name } => {
            let removed = store
                .delete(name)
                .with_context(|| format!("Failed to delete {name}"))?;
            if removed {
                println!("Removed {name} from the system keyring");
            } else {
                println!("{name} was not stored");
            }
        }
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => tracing::info!("Received SIGTERM"),
    }

    Ok(())
}
