//! DOR Server - serve a digital object repository over REST

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dor_core::BackendConfig;
use dor_server::{Config, RestHandler};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// DOR Server Configuration
#[derive(Parser, Debug)]
#[command(name = "dor-server")]
#[command(author = "DOR Contributors")]
#[command(version = "0.1.0")]
#[command(about = "REST server for digital object repositories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Backend configuration file (JSON); an in-memory backend when omitted
        #[arg(short, long)]
        backend: Option<PathBuf>,

        /// Require basic auth with this user
        #[arg(long, requires = "password")]
        username: Option<String>,

        /// Password for --username
        #[arg(long)]
        password: Option<String>,

        /// Maximum request body size in bytes
        #[arg(long, default_value_t = 100 * 1024 * 1024)]
        max_body_size: usize,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a filesystem backend configuration
    Init {
        /// Configuration file to write
        config: PathBuf,

        /// Repository root directory
        #[arg(short, long, default_value = "./data/repo")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            backend,
            username,
            password,
            max_body_size,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let backend_config = match &backend {
                Some(path) => BackendConfig::load(path)
                    .with_context(|| format!("Failed to read backend config {}", path.display()))?,
                None => BackendConfig::Memory,
            };
            info!("Starting DOR server on {} ({} backend)", addr, backend_config.kind());

            // The REST backend builds a blocking HTTP client, which must not happen on a runtime thread
            let repo = tokio::task::spawn_blocking(move || backend_config.open())
                .await?
                .context("Failed to open backend")?;

            let config = Config {
                credentials: username.map(|u| (u, password.unwrap_or_default())),
                max_body_size,
            };
            if config.credentials.is_some() {
                info!("Basic authentication enabled");
            }
            let handler = Arc::new(RestHandler::with_config(repo.clone(), config));

            let addr: SocketAddr = addr.parse().context("Invalid listen address")?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Server listening on {}", addr);

            tokio::select! {
                result = dor_server::serve(listener, handler) => {
                    if let Err(e) = result {
                        error!("Accept loop failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                }
            }

            tokio::task::spawn_blocking(move || {
                let closed = repo.close();
                drop(repo);
                closed
            })
            .await?
            .context("Failed to close backend")?;
        }

        Commands::Init { config, root } => {
            let backend = BackendConfig::Filesystem { root: root.clone() };
            backend
                .save(&config)
                .with_context(|| format!("Failed to write {}", config.display()))?;
            println!("Wrote filesystem backend config to {}", config.display());
            println!("Start the server with:");
            println!("  dor-server start --backend {}", config.display());
        }
    }

    Ok(())
}
