//! rowgated: the rowgate daemon.
//!
//! Starts an entity server over the in-memory backend and serves the
//! session and admin API over HTTP.
//!
//! # Usage
//!
//! ```text
//! rowgated serve --config /etc/rowgate/rowgate.toml --port 2223
//! rowgated config --config /etc/rowgate/rowgate.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rowgate_core::ServerConfig;
use rowgate_core::memory::MemoryDatabase;
use rowgate_server::{EntityServer, LogLevelHandle};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

#[derive(Parser)]
#[command(name = "rowgated", about = "rowgate remote connection server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Serve {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on, overriding the configuration.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::from_file(path),
        None => Ok(ServerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reloadable so admins can change the level at runtime.
    let (filter, log_level) = reload::Layer::new(
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,rowgate=debug,rowgated=debug".into()),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.port = port;
            }
            serve(config, LogLevelHandle::new(log_level)).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig, log_level: LogLevelHandle) -> anyhow::Result<()> {
    info!(server = %config.server_name, "rowgate daemon starting");

    let database = MemoryDatabase::new();
    let port = config.port;
    let server = EntityServer::start(config, Arc::new(database.factory())).await?;
    server.attach_log_level(log_level);

    let router = rowgate_api::build_router(Arc::clone(&server));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Stop on Ctrl-C or when an admin shuts the server down.
    let mut stopped = server.subscribe_shutdown();
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = ctrl_c => {}
                _ = stopped.wait_for(|stopped| *stopped) => info!("server shut down by admin"),
            }
        })
        .await?;

    server.shutdown().await;
    info!("rowgate daemon stopped");
    Ok(())
}
