use std::sync::Arc;
use std::time::Duration;

use agentlink::config::AgentConfig;
use agentlink::connection::ConnectionStatus;
use agentlink::discovery::{Discoverer, HttpDiscovery};
use agentlink::dispatcher::HandlerTable;
use agentlink::identity::Identity;
use agentlink::store::{JsonFileStore, KeyValueStore};
use agentlink::{AgentClientBuilder, CommandError};
use clap::{Args, Parser, Subcommand};
use envelopes::CommandType;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] agentlink::config::ConfigError),
    #[error("client setup failed: {0}")]
    Client(#[from] agentlink::ClientError),
    #[error("endpoint discovery failed: {0}")]
    Discovery(#[from] agentlink::discovery::DiscoveryError),
    #[error("command failed: {0}")]
    Command(#[from] CommandError),
    #[error("timed out waiting for connection")]
    ConnectTimeout,
    #[error("connection parked before it was established")]
    Parked,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "agentlink-cli", about = "Discover relay endpoints and send agent commands")]
struct Cli {
    /// Explicit endpoint; skips discovery.
    #[arg(long, env = "AGENTLINK_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "AGENTLINK_STORE_PATH")]
    store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the endpoint the agent would connect to.
    Discover(DiscoverArgs),
    /// Send one command and print the correlated response.
    Send(SendArgs),
    /// Print the stored agent identity, creating it if missing.
    Identity,
}

#[derive(Args, Debug)]
struct DiscoverArgs {
    /// Ignore the endpoint cache and run every strategy.
    #[arg(long, default_value_t = false)]
    fresh: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Command type, e.g. `get_telemetry`.
    kind: String,

    /// Command parameters as a JSON object.
    #[arg(long)]
    params: Option<String>,

    #[arg(long, default_value_t = 15_000)]
    timeout_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env()?;
    if let Some(endpoint) = cli.endpoint {
        config.discovery.endpoint_override = Some(endpoint);
    }
    if let Some(path) = cli.store {
        config.store_path = path.into();
    }
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(config.store_path.clone()));

    match cli.command {
        Command::Discover(args) => run_discover(config, store, args).await,
        Command::Send(args) => run_send(config, store, args).await,
        Command::Identity => run_identity(store.as_ref()).await,
    }
}

async fn run_discover(config: AgentConfig, store: Arc<dyn KeyValueStore>, args: DiscoverArgs) -> Result<(), CliError> {
    let http = HttpDiscovery::new(config.discovery.request_timeout)?;
    let discoverer = Discoverer::new(config.discovery, store, Arc::new(http));
    let endpoint = if args.fresh { discoverer.discover().await? } else { discoverer.resolve().await? };
    print_json(&serde_json::to_value(&endpoint)?)
}

async fn run_send(mut config: AgentConfig, store: Arc<dyn KeyValueStore>, args: SendArgs) -> Result<(), CliError> {
    let params = args.params.as_deref().map(serde_json::from_str::<Value>).transpose()?;
    config.command_timeout = Duration::from_millis(args.timeout_ms);
    // One-shot: fail instead of cycling through reconnects, and never take
    // commands meant for a running agent with the same operator id.
    config.connection.max_reconnect_attempts = 0;
    config.connection.subscribe = false;

    let client = AgentClientBuilder::new(config).store(store).handlers(HandlerTable::new()).build().await?;
    client.connect();

    let mut status = client.status();
    let reached = tokio::time::timeout(
        Duration::from_millis(args.connect_timeout_ms),
        status.wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Parked)),
    )
    .await
    .map(|reached| reached.map(|s| *s));
    match reached {
        Ok(Ok(ConnectionStatus::Connected)) => {}
        Ok(_) => {
            client.dispose();
            return Err(CliError::Parked);
        }
        Err(_) => {
            client.dispose();
            return Err(CliError::ConnectTimeout);
        }
    }

    let result = client.send_command(CommandType::from(args.kind.as_str()), params).await;
    client.dispose();
    print_json(&result?.to_value())
}

async fn run_identity(store: &dyn KeyValueStore) -> Result<(), CliError> {
    let identity = Identity::load_or_create(store).await;
    print_json(&json!({
        "agentId": identity.agent_id,
        "operatorId": identity.operator_id,
    }))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
