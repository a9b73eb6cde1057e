//! Status reporting.
//!
//! After every cycle the reconciler emits a [`StatusReport`] listing the
//! tasks it attempted and the guests it found running. Reports go to a
//! [`StatusSink`]: the log by default, or an HTTP collector.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

/// Per-cycle summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Task descriptions, e.g. `NEED TO START SLOT 3`.
    pub tasks: Vec<String>,

    /// `<agent>Z<slot>` for each running guest.
    pub running_agents: Vec<String>,
}

/// Errors delivering status.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to encode status report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for sign-on and status reports.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Announce this host at startup.
    async fn announce(&self, host_id: &str) -> Result<(), StatusError>;

    /// Publish one cycle's report.
    async fn publish(&self, host_id: &str, report: &StatusReport) -> Result<(), StatusError>;
}

/// Writes reports to the log.
#[derive(Debug, Default, Clone)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn announce(&self, host_id: &str) -> Result<(), StatusError> {
        info!(host_id = %host_id, "Host signed on");
        Ok(())
    }

    async fn publish(&self, host_id: &str, report: &StatusReport) -> Result<(), StatusError> {
        let status = serde_json::to_string(report)?;
        info!(host_id = %host_id, status = %status, "Status report");
        Ok(())
    }
}

/// POSTs reports to a collector.
pub struct HttpStatusSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSink {
    /// Create a sink posting under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(StatusError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, host_id: &str, leaf: &str) -> String {
        format!("{}/v1/hosts/{}/{}", self.base_url, host_id, leaf)
    }

    async fn post<T>(&self, url: String, body: &T) -> Result<(), StatusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        debug!(url = %url, "Posting status");

        let response = match self.client.post(&url).json(body).send().await {
            Ok(response) => response,
            Err(source) => return Err(StatusError::Request { url, source }),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(
                status,
                body = %body,
                url = %url,
                "Status collector rejected request"
            );
            return Err(StatusError::Rejected { url, status, body });
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct SignOn<'a> {
    host_id: &'a str,
    version: &'a str,
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn announce(&self, host_id: &str) -> Result<(), StatusError> {
        let body = SignOn {
            host_id,
            version: env!("CARGO_PKG_VERSION"),
        };
        self.post(self.url(host_id, "signon"), &body).await?;
        info!(host_id = %host_id, "Host signed on");
        Ok(())
    }

    async fn publish(&self, host_id: &str, report: &StatusReport) -> Result<(), StatusError> {
        self.post(self.url(host_id, "status"), report).await
    }
}

/// Keeps every report, for tests.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    announced: Mutex<Vec<String>>,
    reports: Mutex<Vec<StatusReport>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts announced so far.
    pub fn announced(&self) -> Vec<String> {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reports published so far, oldest first.
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn announce(&self, host_id: &str) -> Result<(), StatusError> {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(host_id.to_string());
        Ok(())
    }

    async fn publish(&self, _host_id: &str, report: &StatusReport) -> Result<(), StatusError> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
        Ok(())
    }
}
