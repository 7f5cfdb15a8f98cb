//! Administrative operations run on behalf of daemon callers
//!
//! `init` and `fsck` are executed in-process. `deploy`, `pull-deploy`, `diff`
//! and `update-kernel` are delegated to an external helper executable,
//! invoked as `helper <operation> <target> <args...>`; the child process is
//! killed as soon as the operation's token fires.

use crate::error::{AdminError, DaemonError};
use arbor_core::{check_with, FsckOptions, RepoMode, Repository};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Operations a daemon caller may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminOp {
    Init,
    Deploy,
    PullDeploy,
    Diff,
    UpdateKernel,
    Fsck,
}

impl AdminOp {
    pub const ALL: [AdminOp; 6] = [
        AdminOp::Init,
        AdminOp::Deploy,
        AdminOp::PullDeploy,
        AdminOp::Diff,
        AdminOp::UpdateKernel,
        AdminOp::Fsck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AdminOp::Init => "init",
            AdminOp::Deploy => "deploy",
            AdminOp::PullDeploy => "pull-deploy",
            AdminOp::Diff => "diff",
            AdminOp::UpdateKernel => "update-kernel",
            AdminOp::Fsck => "fsck",
        }
    }

    /// Whether the operation runs inside the daemon process
    pub fn is_builtin(self) -> bool {
        matches!(self, AdminOp::Init | AdminOp::Fsck)
    }
}

impl fmt::Display for AdminOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AdminOp {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AdminOp::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| DaemonError::UnknownOperation(s.to_string()))
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub op: AdminOp,
    pub target: PathBuf,
    pub args: Vec<String>,
}

/// How an operation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Succeeded,
    Failed { message: String },
    Cancelled,
}

impl From<Result<(), AdminError>> for OperationOutcome {
    fn from(result: Result<(), AdminError>) -> Self {
        match result {
            Ok(()) => OperationOutcome::Succeeded,
            Err(AdminError::Cancelled) => OperationOutcome::Cancelled,
            Err(e) => OperationOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}

/// Executes administrative operations.
///
/// Implementations must observe `token` and return `AdminError::Cancelled`
/// promptly once it fires.
#[async_trait]
pub trait AdminRunner: Send + Sync {
    async fn run(&self, request: OperationRequest, token: CancellationToken) -> Result<(), AdminError>;
}

/// Runner backed by a repository and an external helper
pub struct RepoAdmin {
    repo: Repository,
    helper: PathBuf,
}

impl RepoAdmin {
    pub fn new(repo: Repository, helper: PathBuf) -> Self {
        Self { repo, helper }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    async fn init(&self, target: PathBuf, token: &CancellationToken) -> Result<(), AdminError> {
        if token.is_cancelled() {
            return Err(AdminError::Cancelled);
        }
        tokio::task::spawn_blocking(move || init_sysroot(&target)).await??;
        Ok(())
    }

    async fn fsck(&self, token: CancellationToken) -> Result<(), AdminError> {
        let repo = self.repo.clone();
        let report = tokio::task::spawn_blocking(move || {
            let interrupt = || token.is_cancelled();
            let options = FsckOptions {
                interrupt: Some(&interrupt),
            };
            check_with(&repo, &options)
        })
        .await??;

        if report.had_error() {
            return Err(AdminError::Inconsistent {
                failed: report.failures.len(),
                total: report.n_objects,
            });
        }
        info!("fsck: {} objects verified", report.n_objects);
        Ok(())
    }

    async fn run_helper(
        &self,
        request: &OperationRequest,
        token: &CancellationToken,
    ) -> Result<(), AdminError> {
        let mut child = Command::new(&self.helper)
            .arg(request.op.name())
            .arg(&request.target)
            .args(&request.args)
            .env("ARBOR_REPO", self.repo.root())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        debug!("Spawned {} for {}", self.helper.display(), request.op);

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(AdminError::Helper {
                        helper: self.helper.display().to_string(),
                        status: status.to_string(),
                    })
                }
            }
            _ = token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", self.helper.display(), e);
                }
                Err(AdminError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl AdminRunner for RepoAdmin {
    async fn run(&self, request: OperationRequest, token: CancellationToken) -> Result<(), AdminError> {
        match request.op {
            AdminOp::Init => self.init(request.target, &token).await,
            AdminOp::Fsck => self.fsck(token).await,
            _ => self.run_helper(&request, &token).await,
        }
    }
}

/// Lay out a fresh system root: a bare repository plus a deployment directory
fn init_sysroot(target: &Path) -> Result<(), AdminError> {
    std::fs::create_dir_all(target.join("deploy"))?;
    let repo_path = target.join("repo");
    if repo_path.join("config").exists() {
        debug!("Repository already present at {}", repo_path.display());
        return Ok(());
    }
    Repository::create(&repo_path, RepoMode::Bare)?;
    Ok(())
}
