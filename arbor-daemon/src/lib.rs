//! Arbor operations daemon
//!
//! Owns one repository and tracks long-running administrative operations
//! requested by external callers, each identified by an id and cancellable
//! by the caller that started it.

pub mod admin;
pub mod config;
pub mod daemon;
pub mod error;
pub mod http;
pub mod registry;

pub use admin::{AdminOp, AdminRunner, OperationOutcome, OperationRequest, RepoAdmin};
pub use config::DaemonConfig;
pub use daemon::{Daemon, DaemonHandle, StartRequest};
pub use error::{AdminError, DaemonError};
pub use http::{serve, ApiServer, REQUESTOR_HEADER};
pub use registry::{DaemonId, Operation, OperationId, OperationInfo, OperationRegistry};
