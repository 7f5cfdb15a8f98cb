//! Operation registry
//!
//! The table of in-flight administrative operations owned by one daemon.
//! All access goes through the daemon's event loop, so the registry is a
//! plain `&mut self` structure with no interior locking.

use crate::admin::AdminOp;
use crate::error::DaemonError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub type OperationId = u32;

/// Identity of a daemon instance.
///
/// Operation records hold this instead of a reference to the daemon itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonId(Uuid);

impl DaemonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DaemonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One in-flight operation
#[derive(Debug)]
pub struct Operation {
    pub id: OperationId,
    pub daemon: DaemonId,
    pub requestor: String,
    pub op: AdminOp,
    pub started_at: DateTime<Utc>,
    pub token: CancellationToken,
}

/// Summary of an operation for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: OperationId,
    pub operation: AdminOp,
    pub requestor: String,
    pub started_at: DateTime<Utc>,
}

impl From<&Operation> for OperationInfo {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id,
            operation: op.op,
            requestor: op.requestor.clone(),
            started_at: op.started_at,
        }
    }
}

pub struct OperationRegistry {
    daemon: DaemonId,
    next_id: OperationId,
    ops: HashMap<OperationId, Operation>,
    /// Parent of every operation token
    root: CancellationToken,
}

impl OperationRegistry {
    pub fn new(daemon: DaemonId) -> Self {
        Self {
            daemon,
            next_id: 1,
            ops: HashMap::new(),
            root: CancellationToken::new(),
        }
    }

    pub fn daemon(&self) -> DaemonId {
        self.daemon
    }

    /// Register a new operation and return its id
    pub fn allocate(&mut self, requestor: &str, op: AdminOp) -> OperationId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.ops.insert(
            id,
            Operation {
                id,
                daemon: self.daemon,
                requestor: requestor.to_string(),
                op,
                started_at: Utc::now(),
                token: self.root.child_token(),
            },
        );
        info!("Allocated operation {} ({}) for {}", id, op, requestor);
        id
    }

    pub fn lookup(&self, id: OperationId) -> Option<&Operation> {
        self.ops.get(&id)
    }

    /// Signal an operation's token on behalf of `requestor`.
    ///
    /// The record stays in the table until the operation itself completes.
    pub fn cancel(&self, id: OperationId, requestor: &str) -> Result<(), DaemonError> {
        let op = self.ops.get(&id).ok_or(DaemonError::NotFound(id))?;
        if op.requestor != requestor {
            return Err(DaemonError::PermissionDenied {
                id,
                requestor: requestor.to_string(),
            });
        }
        op.token.cancel();
        info!("Cancellation requested for operation {} by {}", id, requestor);
        Ok(())
    }

    /// Remove a completed operation; retiring twice is an invariant violation
    pub fn retire(&mut self, id: OperationId) -> Result<Operation, DaemonError> {
        let op = self.ops.remove(&id).ok_or_else(|| {
            DaemonError::InvariantViolation(format!("operation {} retired while not registered", id))
        })?;
        info!("Retired operation {} ({})", id, op.op);
        Ok(op)
    }

    /// In-flight operations ordered by id
    pub fn list(&self) -> Vec<&Operation> {
        let mut ops: Vec<&Operation> = self.ops.values().collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Signal every in-flight operation
    pub fn cancel_all(&self) {
        if !self.ops.is_empty() {
            info!("Cancelling {} in-flight operations", self.ops.len());
        }
        self.root.cancel();
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
