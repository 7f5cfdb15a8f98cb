//! HTTP IPC surface of the daemon
//!
//! Routes:
//! - `POST /operations` start an operation, `202 {"id"}`
//! - `GET /operations` list in-flight operations
//! - `DELETE /operations/{id}` cancel an operation
//! - `GET /operations/{id}/wait` block until the operation retires
//! - `GET /repo` describe the served repository
//!
//! The caller's identity travels in the `X-Arbor-Requestor` header.

use crate::admin::{AdminOp, OperationOutcome};
use crate::daemon::{DaemonHandle, StartRequest};
use crate::error::DaemonError;
use crate::registry::{OperationId, OperationInfo};
use arbor_core::RepoMode;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const REQUESTOR_HEADER: &str = "x-arbor-requestor";

/// Body of `POST /operations`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBody {
    pub operation: String,
    pub target: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedBody {
    pub id: OperationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitBody {
    pub id: OperationId,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoBody {
    pub path: PathBuf,
    pub mode: RepoMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Request-level failures, each mapped to one status code
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::NotFound(_) => ApiError::NotFound(err.to_string()),
            DaemonError::PermissionDenied { .. } => ApiError::Forbidden(err.to_string()),
            DaemonError::UnknownOperation(_) => ApiError::BadRequest(err.to_string()),
            DaemonError::ShuttingDown => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Routes IPC requests to a daemon
pub struct ApiServer {
    handle: DaemonHandle,
    repo: RepoBody,
    max_body_size: usize,
}

impl ApiServer {
    pub fn new(handle: DaemonHandle, repo_path: PathBuf, repo_mode: RepoMode, max_body_size: usize) -> Self {
        Self {
            handle,
            repo: RepoBody {
                path: repo_path,
                mode: repo_mode,
            },
            max_body_size,
        }
    }

    /// Handle one request; errors are rendered as JSON bodies
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("IPC request: {} {}", method, path);

        match self.route(req).await {
            Ok(resp) => resp,
            Err(e) => {
                if e.status().is_server_error() {
                    error!("{} {}: {}", method, path, e);
                } else {
                    debug!("{} {}: {}", method, path, e);
                }
                json_response(e.status(), &ErrorBody { error: e.to_string() })
            }
        }
    }

    async fn route<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ApiError>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (req.method(), segments.as_slice()) {
            (&Method::POST, ["operations"]) => self.start_operation(req).await,
            (&Method::GET, ["operations"]) => self.list_operations().await,
            (&Method::DELETE, ["operations", id]) => {
                let id = parse_id(id)?;
                let requestor = requestor(&req)?;
                self.cancel_operation(&requestor, id).await
            }
            (&Method::GET, ["operations", id, "wait"]) => {
                let id = parse_id(id)?;
                requestor(&req)?;
                self.wait_operation(id).await
            }
            (&Method::GET, ["repo"]) => Ok(json_response(StatusCode::OK, &self.repo)),
            _ => Err(ApiError::NotFound(format!("{} {}", req.method(), path))),
        }
    }

    async fn start_operation<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ApiError>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let requestor = requestor(&req)?;
        let body = self.read_body(req).await?;
        let body: StartBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid operation request: {}", e)))?;
        let op: AdminOp = body.operation.parse()?;

        let id = self
            .handle
            .start(StartRequest {
                requestor: requestor.clone(),
                op,
                target: body.target,
                args: body.args,
                timeout: body.timeout_secs.map(Duration::from_secs),
            })
            .await?;
        info!("{} started {} as operation {}", requestor, op, id);
        Ok(json_response(StatusCode::ACCEPTED, &StartedBody { id }))
    }

    async fn list_operations(&self) -> Result<Response<Full<Bytes>>, ApiError> {
        let ops: Vec<OperationInfo> = self.handle.list().await?;
        Ok(json_response(StatusCode::OK, &ops))
    }

    async fn cancel_operation(&self, requestor: &str, id: OperationId) -> Result<Response<Full<Bytes>>, ApiError> {
        self.handle.cancel(id, requestor).await?;
        Ok(json_response(StatusCode::ACCEPTED, &StartedBody { id }))
    }

    async fn wait_operation(&self, id: OperationId) -> Result<Response<Full<Bytes>>, ApiError> {
        let outcome = self.handle.wait(id).await?;
        Ok(json_response(StatusCode::OK, &WaitBody { id, outcome }))
    }

    async fn read_body<B>(&self, req: Request<B>) -> Result<Bytes, ApiError>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let limited = Limited::new(req.into_body(), self.max_body_size);
        match limited.collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(ApiError::PayloadTooLarge(self.max_body_size))
            }
            Err(e) => Err(ApiError::BadRequest(format!("failed to read body: {}", e))),
        }
    }
}

fn requestor<B>(req: &Request<B>) -> Result<String, ApiError> {
    req.headers()
        .get(REQUESTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", REQUESTOR_HEADER)))
}

fn parse_id(raw: &str) -> Result<OperationId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid operation id '{}'", raw)))
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{{\"error\":\"serialization failed: {}\"}}", e).into_bytes(),
        ),
    };
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Accept connections until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    server: Arc<ApiServer>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("IPC listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => break,
        };
        debug!("Connection from {}", peer);
        let server = server.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, hyper::Error>(server.handle(req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {:?}", e);
            }
        });
    }

    info!("IPC listener stopped");
    Ok(())
}
