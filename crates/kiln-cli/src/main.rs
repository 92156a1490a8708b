#![warn(missing_docs)]

//! Kiln — multi-tenant code-execution broker for LLM agents.
//!
//! Serves the five Kiln tools over MCP stdio. Logging goes to stderr; stdout
//! belongs to the protocol.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_config::KilnConfig;
use kiln_engine::Broker;
use kiln_server::KilnServer;
use rmcp::ServiceExt;
use tracing_subscriber::EnvFilter;

/// Locate the config file.
///
/// Search order:
/// 1. `KILN_CONFIG` environment variable
/// 2. `./kiln.toml` in the current directory
/// 3. None (environment variables and defaults only — not an error)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KILN_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("kiln.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Spawn the periodic maintenance tasks: expired-session cleanup, stale
/// workspace sweeps, cache eviction.
fn spawn_sweepers(broker: Arc<Broker>) {
    let cleanup_interval = broker.config().sessions.cleanup_interval();

    let expiry_broker = broker.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            expiry_broker.cleanup_expired().await;
            expiry_broker.sweep_stale_workspaces().await;
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            broker.background_tick();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version / -V before anything else
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load config: file (when present) with env overrides, else env alone.
    let config = match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            KilnConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
                .with_env()?
        }
        None => {
            tracing::info!("no config file found, using environment and defaults");
            KilnConfig::from_env()?
        }
    };

    // Durable tier is optional: without Redis the broker runs on its
    // in-memory fallback.
    let redis = match &config.redis {
        Some(redis_config) => {
            tracing::info!(host = %redis_config.host, port = redis_config.port, "durable tier: redis");
            Some(Arc::new(
                kiln_store::redis_tier::tier_from_config(redis_config)
                    .context("invalid redis configuration")?,
            ))
        }
        None => {
            tracing::info!("durable tier not configured, sessions are process-local");
            None
        }
    };

    let broker = Broker::new(config, redis);
    broker.startup().await;

    tracing::info!("provisioning language base workspaces");
    broker.provision_languages().await;

    spawn_sweepers(broker.clone());

    let server = KilnServer::new(broker);
    tracing::info!("kiln broker serving on stdio");

    // Serve over stdio (standard MCP transport)
    let service = server
        .serve(rmcp::transport::io::stdio())
        .await
        .context("failed to start MCP stdio server")?;

    // Wait for either normal shutdown or ctrl-c
    tokio::select! {
        result = service.waiting() => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, stopping gracefully");
        }
    }

    Ok(())
}
