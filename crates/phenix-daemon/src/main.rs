//! phenix daemon - experiment orchestration service
//!
//! The daemon provides:
//! - REST API for experiment, VM, cluster and user management
//! - Guarded lifecycle operations with live progress
//! - WebSocket notifications filtered by the caller's role

use clap::Parser;
use phenix_daemon::{DaemonConfig, Server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// phenix daemon CLI
#[derive(Parser)]
#[command(name = "phenixd")]
#[command(about = "phenix daemon - experiment orchestration service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PHENIX_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "PHENIX_LISTEN_ADDR")]
    listen: Option<String>,

    /// Seed file with roles, users, topologies and experiments
    #[arg(short, long, env = "PHENIX_SEED")]
    seed: Option<PathBuf>,

    /// Require bearer tokens on every request
    #[arg(long, env = "PHENIX_REQUIRE_AUTH")]
    auth: bool,

    /// Log level
    #[arg(long, env = "PHENIX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "PHENIX_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", listen, e))?;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    if cli.auth {
        config.auth.enabled = true;
    }

    println!(
        r#"
        _                _
  _ __ | |__   ___ _ __ (_)_  __
 | '_ \| '_ \ / _ \ '_ \| \ \/ /
 | |_) | | | |  __/ | | | |>  <
 | .__/|_| |_|\___|_| |_|_/_/\_\
 |_|

  Version: {}
  Listening: {}
  Auth: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.listen_addr,
        if config.auth.enabled { "enabled" } else { "disabled" }
    );

    // Create and run server
    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
