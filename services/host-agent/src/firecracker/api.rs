//! Firecracker HTTP API client.
//!
//! Each guest exposes its control plane on its own Unix socket. The
//! [`ControlPlaneClient`] trait is the seam the launcher and terminator talk
//! through; [`FirecrackerClient`] speaks HTTP over the socket directly.
//!
//! Calls are independent and never retried here. Retry policy belongs to the
//! caller. Every call is bounded by a timeout so a hung guest cannot stall
//! reconciliation.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use super::config::{ActionType, InstanceAction, InstanceInfo};

/// Errors from the Firecracker API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Socket not found: {0}")]
    SocketNotFound(String),

    #[error("{method} {path} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        path: String,
        timeout: Duration,
    },
}

/// A successful control-plane response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code (2xx).
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

/// Issues requests against a single guest's control-plane socket.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// PUT a JSON body to `path`.
    async fn put(
        &self,
        socket: &Path,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiResponse, ApiError>;

    /// GET `path`.
    async fn get(&self, socket: &Path, path: &str) -> Result<ApiResponse, ApiError>;
}

/// PUT a typed body.
pub async fn put_json<T: Serialize + ?Sized>(
    client: &dyn ControlPlaneClient,
    socket: &Path,
    path: &str,
    body: &T,
) -> Result<ApiResponse, ApiError> {
    let value = serde_json::to_value(body)?;
    client.put(socket, path, &value).await
}

/// Send an instance action.
pub async fn send_action(
    client: &dyn ControlPlaneClient,
    socket: &Path,
    action_type: ActionType,
) -> Result<ApiResponse, ApiError> {
    put_json(client, socket, "/actions", &InstanceAction { action_type }).await
}

/// Fetch instance info (`GET /`).
pub async fn instance_info(
    client: &dyn ControlPlaneClient,
    socket: &Path,
) -> Result<InstanceInfo, ApiError> {
    let response = client.get(socket, "/").await?;
    Ok(serde_json::from_str(&response.body)?)
}

/// Firecracker API client for Unix socket communication.
pub struct FirecrackerClient {
    client: Client<UnixConnector>,
    timeout: Duration,
}

impl FirecrackerClient {
    /// Create a new client with a per-call timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::unix(),
            timeout,
        }
    }

    async fn request(
        &self,
        method: Method,
        socket: &Path,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ApiResponse, ApiError> {
        if !socket.exists() {
            return Err(ApiError::SocketNotFound(socket.display().to_string()));
        }

        let method_name = if method == Method::PUT { "PUT" } else { "GET" };
        debug!(method = method_name, path = path, socket = %socket.display(), "Request to Firecracker API");

        let uri: hyper::Uri = Uri::new(socket, path).into();
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;

        let exchange = async move {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ApiError::Timeout {
                method: method_name,
                path: path.to_string(),
                timeout: self.timeout,
            })??;

        let body = String::from_utf8_lossy(&bytes).to_string();
        if status.is_success() {
            Ok(ApiResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            error!(status = %status, path = path, message = %body, "Firecracker API error");
            Err(ApiError::Api {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

#[async_trait]
impl ControlPlaneClient for FirecrackerClient {
    async fn put(
        &self,
        socket: &Path,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiResponse, ApiError> {
        let bytes = serde_json::to_vec(body)?;
        self.request(Method::PUT, socket, path, Some(bytes)).await
    }

    async fn get(&self, socket: &Path, path: &str) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, socket, path, None).await
    }
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}
