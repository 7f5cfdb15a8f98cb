//! Daemon event loop
//!
//! One task owns the [`OperationRegistry`] and serializes every mutation of
//! it: requests arrive on a command channel from any number of
//! [`DaemonHandle`]s, operations report back on a completion channel, and
//! the loop retires them and wakes whoever is waiting.
//!
//! Shutdown cancels every in-flight operation, stops accepting commands and
//! keeps draining completions until the registry is empty.

use crate::admin::{AdminOp, AdminRunner, OperationOutcome, OperationRequest};
use crate::error::DaemonError;
use crate::registry::{DaemonId, OperationId, OperationInfo, OperationRegistry};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const COMMAND_QUEUE: usize = 64;
/// Outcomes kept after retirement so late waiters still learn them
const RECENT_OUTCOMES: usize = 256;

/// A request to start an operation
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub requestor: String,
    pub op: AdminOp,
    pub target: PathBuf,
    pub args: Vec<String>,
    /// Cancel the operation once this much time has elapsed
    pub timeout: Option<Duration>,
}

enum Command {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<OperationId>,
    },
    Cancel {
        id: OperationId,
        requestor: String,
        reply: oneshot::Sender<Result<(), DaemonError>>,
    },
    Wait {
        id: OperationId,
        reply: oneshot::Sender<Result<OperationOutcome, DaemonError>>,
    },
    List {
        reply: oneshot::Sender<Vec<OperationInfo>>,
    },
}

type Completion = (OperationId, OperationOutcome);

pub struct Daemon {
    id: DaemonId,
    registry: OperationRegistry,
    runner: Arc<dyn AdminRunner>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    waiters: HashMap<OperationId, Vec<oneshot::Sender<Result<OperationOutcome, DaemonError>>>>,
    recent: VecDeque<(OperationId, OperationOutcome)>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(runner: Arc<dyn AdminRunner>) -> (Self, DaemonHandle) {
        let id = DaemonId::new();
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let daemon = Self {
            id,
            registry: OperationRegistry::new(id),
            runner,
            commands,
            completions_tx,
            completions,
            waiters: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_OUTCOMES),
            shutdown: shutdown.clone(),
        };
        let handle = DaemonHandle {
            id,
            commands: commands_tx,
            shutdown,
        };
        (daemon, handle)
    }

    pub fn id(&self) -> DaemonId {
        self.id
    }

    /// Run until shutdown has been requested and every operation retired.
    ///
    /// A registry invariant violation stops the loop with an error.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        info!("Daemon {} started", self.id);
        let mut accepting = true;

        loop {
            if !accepting && self.registry.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled(), if accepting => {
                    accepting = false;
                    info!("Shutdown requested, {} operations in flight", self.registry.len());
                    self.registry.cancel_all();
                }
                cmd = self.commands.recv(), if accepting => match cmd {
                    Some(cmd) => self.dispatch(cmd),
                    None => {
                        // every handle is gone
                        self.shutdown.cancel();
                    }
                },
                Some((id, outcome)) = self.completions.recv() => {
                    self.complete(id, outcome)?;
                }
            }
        }

        info!("Daemon {} stopped", self.id);
        Ok(())
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Start { request, reply } => {
                let id = self.start(request);
                if reply.send(id).is_err() {
                    warn!("Caller went away before learning operation id {}", id);
                }
            }
            Command::Cancel {
                id,
                requestor,
                reply,
            } => {
                let result = self.registry.cancel(id, &requestor);
                if let Err(DaemonError::PermissionDenied { .. }) = &result {
                    warn!("Denied cancellation of operation {} requested by {}", id, requestor);
                }
                let _ = reply.send(result);
            }
            Command::Wait { id, reply } => {
                if self.registry.lookup(id).is_some() {
                    self.waiters.entry(id).or_default().push(reply);
                } else {
                    let result = self
                        .recent
                        .iter()
                        .find(|(done, _)| *done == id)
                        .map(|(_, outcome)| outcome.clone())
                        .ok_or(DaemonError::NotFound(id));
                    let _ = reply.send(result);
                }
            }
            Command::List { reply } => {
                let ops = self.registry.list().into_iter().map(OperationInfo::from).collect();
                let _ = reply.send(ops);
            }
        }
    }

    fn start(&mut self, request: StartRequest) -> OperationId {
        let id = self.registry.allocate(&request.requestor, request.op);
        let token = self
            .registry
            .lookup(id)
            .map(|op| op.token.clone())
            .unwrap_or_default();

        let runner = Arc::clone(&self.runner);
        let completions = self.completions_tx.clone();
        let timeout = request.timeout;
        let op_request = OperationRequest {
            op: request.op,
            target: request.target,
            args: request.args,
        };

        let work = tokio::spawn(async move {
            let work = runner.run(op_request, token.clone());
            tokio::pin!(work);

            let timer = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = &mut work => result,
                _ = timer => {
                    warn!("Operation {} timed out after {:?}", id, timeout.unwrap_or_default());
                    token.cancel();
                    work.await
                }
            }
        });

        // a panicking runner still has to retire its record
        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(result) => result.into(),
                Err(e) => {
                    error!("Operation {} aborted: {}", id, e);
                    OperationOutcome::Failed {
                        message: format!("Operation task aborted: {}", e),
                    }
                }
            };
            let _ = completions.send((id, outcome));
        });
        id
    }

    fn complete(&mut self, id: OperationId, outcome: OperationOutcome) -> Result<(), DaemonError> {
        let op = self.registry.retire(id).inspect_err(|e| error!("{}", e))?;
        if op.daemon != self.id {
            return Err(DaemonError::InvariantViolation(format!(
                "operation {} belongs to daemon {}",
                id, op.daemon
            )));
        }

        match &outcome {
            OperationOutcome::Succeeded => info!("Operation {} ({}) succeeded", id, op.op),
            OperationOutcome::Cancelled => info!("Operation {} ({}) cancelled", id, op.op),
            OperationOutcome::Failed { message } => {
                warn!("Operation {} ({}) failed: {}", id, op.op, message)
            }
        }

        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(Ok(outcome.clone()));
        }
        if self.recent.len() == RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back((id, outcome));
        Ok(())
    }
}

/// Cloneable front end to a running [`Daemon`]
#[derive(Clone)]
pub struct DaemonHandle {
    id: DaemonId,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl DaemonHandle {
    pub fn daemon_id(&self) -> DaemonId {
        self.id
    }

    pub async fn start(&self, request: StartRequest) -> Result<OperationId, DaemonError> {
        self.call(|reply| Command::Start { request, reply }).await
    }

    pub async fn cancel(&self, id: OperationId, requestor: &str) -> Result<(), DaemonError> {
        let requestor = requestor.to_string();
        self.call(|reply| Command::Cancel {
            id,
            requestor,
            reply,
        })
        .await?
    }

    /// Resolve once operation `id` has retired.
    ///
    /// Operations that retired recently resolve immediately.
    pub async fn wait(&self, id: OperationId) -> Result<OperationOutcome, DaemonError> {
        self.call(|reply| Command::Wait { id, reply }).await?
    }

    pub async fn list(&self) -> Result<Vec<OperationInfo>, DaemonError> {
        self.call(|reply| Command::List { reply }).await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Fires when shutdown has been requested
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, DaemonError> {
        if self.shutdown.is_cancelled() {
            return Err(DaemonError::ShuttingDown);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| DaemonError::ShuttingDown)?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)
    }
}
