//! mcp-orch entry point.
//!
//! Runs the orchestrating proxy with an in-memory configuration store
//! seeded from a JSON file. Production deployments embed [`ProxyServer`]
//! with a persistent store instead.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_orch::store::{ConfigStore, MemoryStore, ProjectConfig, UpstreamDef};
use mcp_orch::{ProxyServer, Settings};

#[derive(Parser, Debug)]
#[command(name = "mcp-orch")]
#[command(about = "Orchestrating proxy for MCP tool servers")]
#[command(version)]
struct Cli {
    /// HTTP port to listen on
    #[arg(long, default_value = "8000", env = "PORT")]
    port: u16,

    /// Path to a JSON file of projects and upstream definitions
    #[arg(long, env = "MCP_ORCH_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Accept unsigned (alg=none) JWTs; development only
    #[arg(long)]
    dev_unsafe_jwt: bool,

    /// Expose the test-only echo tool on per-server endpoints
    #[arg(long)]
    enable_test_tools: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

/// Shape of the seed-config file: projects plus upstream definitions.
#[derive(Debug, serde::Deserialize)]
struct SeedConfig {
    #[serde(default)]
    projects: Vec<ProjectConfig>,
    #[serde(default)]
    servers: Vec<UpstreamDef>,
}

fn load_store(path: Option<&std::path::Path>) -> anyhow::Result<Arc<dyn ConfigStore>> {
    let store = MemoryStore::new();

    if let Some(path) = path {
        let raw = std::fs::read_to_string(path)?;
        let seed: SeedConfig = serde_json::from_str(&raw)?;
        tracing::info!(
            projects = seed.projects.len(),
            servers = seed.servers.len(),
            "loaded configuration from {}",
            path.display()
        );
        for project in seed.projects {
            store.add_project(project);
        }
        for server in seed.servers {
            store.add_upstream(server);
        }
    } else {
        tracing::warn!("no --config given; starting with an empty configuration store");
    }

    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.port,
        "starting mcp-orch proxy"
    );

    let mut settings = Settings::from_env();
    settings.dev_unsafe_jwt = cli.dev_unsafe_jwt;
    settings.enable_test_tools = cli.enable_test_tools;

    let store = load_store(cli.config.as_deref())?;
    let server = ProxyServer::new(settings, store);

    server.run(cli.port).await
}
