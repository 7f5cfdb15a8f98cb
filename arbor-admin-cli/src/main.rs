//! Arbor Administration CLI

mod fsck_cmd;
mod remote;

use anyhow::{anyhow, Context, Result};
use arbor_core::{ObjectType, RepoMode, Repository};
use arbor_daemon::http::StartBody;
use arbor_daemon::{AdminOp, OperationId, OperationOutcome};
use clap::{Parser, Subcommand};
use remote::DaemonClient;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "arbor-admin")]
#[command(author = "Arbor Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Arbor repository administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init {
        path: PathBuf,
        /// Storage mode for content objects
        #[arg(long, default_value = "archive")]
        mode: RepoMode,
    },

    /// Check every object in a repository
    Fsck {
        #[arg(short, long)]
        repo: PathBuf,
        /// Don't print the object total
        #[arg(short, long)]
        quiet: bool,
    },

    /// Store filesystem nodes as content objects
    Stage {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Store a meta object read from a file ("-" for stdin)
    WriteMeta {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short = 't', long = "type")]
        objtype: ObjectType,
        file: String,
    },

    /// Talk to a running arbord
    Remote {
        /// Daemon URL
        #[arg(long, default_value = "http://127.0.0.1:7468")]
        url: String,
        /// Identity presented to the daemon (default: $USER)
        #[arg(long)]
        requestor: Option<String>,
        #[command(subcommand)]
        action: RemoteAction,
    },
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Start an operation
    Start {
        /// init, deploy, pull-deploy, diff, update-kernel or fsck
        operation: String,
        target: PathBuf,
        /// Arguments passed to the operation
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Cancel the operation after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Block until the operation finishes
        #[arg(long)]
        wait: bool,
    },
    /// Cancel an operation started with the same requestor
    Cancel { id: OperationId },
    /// Wait for an operation to finish
    Wait { id: OperationId },
    /// List in-flight operations
    List,
    /// Show the repository served by the daemon
    Repo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { path, mode } => {
            Repository::create(&path, mode)
                .with_context(|| format!("Failed to initialize repository at {}", path.display()))?;
            println!("Initialized {} repository at {}", mode, path.display());
        }

        Commands::Fsck { repo, quiet } => {
            let mut err = std::io::stderr();
            fsck_cmd::fsck_repository(&repo, quiet, &mut err)?;
        }

        Commands::Stage { repo, paths } => {
            let repository = Repository::open(&repo)?;
            for path in paths {
                let checksum = repository
                    .stage_path(&path)
                    .with_context(|| format!("Failed to stage {}", path.display()))?;
                println!("{}  {}", checksum, path.display());
            }
        }

        Commands::WriteMeta { repo, objtype, file } => {
            let repository = Repository::open(&repo)?;
            let data = if file == "-" {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            } else {
                std::fs::read(&file).with_context(|| format!("Failed to read {}", file))?
            };
            let checksum = repository.write_meta(objtype, &data)?;
            println!("{}", checksum);
        }

        Commands::Remote {
            url,
            requestor,
            action,
        } => {
            let requestor = requestor.unwrap_or_else(remote::default_requestor);
            let client = DaemonClient::new(&url, &requestor)?;
            run_remote(&client, action).await?;
        }
    }

    Ok(())
}

async fn run_remote(client: &DaemonClient, action: RemoteAction) -> Result<()> {
    match action {
        RemoteAction::Start {
            operation,
            target,
            args,
            timeout,
            wait,
        } => {
            // reject typos before they reach the daemon
            operation.parse::<AdminOp>()?;
            let id = client
                .start(&StartBody {
                    operation,
                    target,
                    args,
                    timeout_secs: timeout,
                })
                .await?;
            println!("Started operation {}", id);
            if wait {
                report_outcome(id, client.wait(id).await?.outcome)?;
            }
        }

        RemoteAction::Cancel { id } => {
            client.cancel(id).await?;
            println!("Cancellation requested for operation {}", id);
        }

        RemoteAction::Wait { id } => {
            report_outcome(id, client.wait(id).await?.outcome)?;
        }

        RemoteAction::List => {
            let ops = client.list().await?;
            if ops.is_empty() {
                println!("No operations in flight");
            }
            for op in ops {
                println!(
                    "{:>6}  {:<14} {:<24} {}",
                    op.id,
                    op.operation.name(),
                    op.requestor,
                    op.started_at.to_rfc3339()
                );
            }
        }

        RemoteAction::Repo => {
            let repo = client.repo().await?;
            println!("{} ({})", repo.path.display(), repo.mode);
        }
    }
    Ok(())
}

fn report_outcome(id: OperationId, outcome: OperationOutcome) -> Result<()> {
    match outcome {
        OperationOutcome::Succeeded => {
            println!("Operation {} succeeded", id);
            Ok(())
        }
        OperationOutcome::Cancelled => Err(anyhow!("Operation {} was cancelled", id)),
        OperationOutcome::Failed { message } => Err(anyhow!("Operation {} failed: {}", id, message)),
    }
}
