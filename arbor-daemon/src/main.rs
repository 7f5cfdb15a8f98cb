//! arbord - Arbor operations daemon

use anyhow::{Context, Result};
use arbor_core::Repository;
use arbor_daemon::{ApiServer, Daemon, DaemonConfig, RepoAdmin};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "arbord")]
#[command(author = "Arbor Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Arbor repository operations daemon", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (e.g., 127.0.0.1:7468)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Repository path
    #[arg(short, long)]
    repo: Option<PathBuf>,

    /// Helper executable for deploy, pull-deploy, diff and update-kernel
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(repo) = self.repo {
            config.repo = repo;
        }
        if let Some(helper) = self.helper {
            config.helper = helper;
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = cli.into_config()?;
    let repo = Repository::open(&config.repo)
        .with_context(|| format!("Failed to open repository {}", config.repo.display()))?;
    info!("Serving {} repository at {}", repo.mode(), repo.root().display());

    let mode = repo.mode();
    let runner = Arc::new(RepoAdmin::new(repo, config.helper.clone()));
    let (daemon, handle) = Daemon::new(runner);
    let shutdown = handle.shutdown_token();
    let daemon_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = daemon.run().await;
            // stop the listener if the loop died on its own
            shutdown.cancel();
            result
        })
    };
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    handle.shutdown();
                }
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
        });
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let server = Arc::new(ApiServer::new(
        handle,
        config.repo.clone(),
        mode,
        config.max_body_size,
    ));
    arbor_daemon::serve(listener, server, shutdown).await?;

    daemon_task.await??;
    Ok(())
}
