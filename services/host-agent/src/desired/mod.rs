//! Desired-state sources.
//!
//! The desired-state table is owned by an external system. The agent only
//! reads it: each cycle asks for the enabled slots assigned to this host.
//!
//! - `postgres`: the production store (SQLx)
//! - `file`: a JSON file, for development hosts without a database

mod file;
mod postgres;

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use vmfleet_reconcile::SlotDefinition;

pub use file::FileDesiredState;
pub use postgres::{DbConfig, PostgresDesiredState};

/// Errors reading desired state.
#[derive(Debug, Error)]
pub enum DesiredStateError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to read the slots file.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Slots file is not valid JSON.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Store is unreachable for another reason.
    #[error("desired state unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the desired-state table.
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    /// Enabled slot definitions assigned to `host_id`.
    async fn list_enabled_slots(&self, host_id: &str)
        -> Result<Vec<SlotDefinition>, DesiredStateError>;
}

/// In-memory store for tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryDesiredState {
    slots: Mutex<Vec<SlotDefinition>>,
    unavailable: Mutex<Option<String>>,
}

impl MemoryDesiredState {
    pub fn new(slots: Vec<SlotDefinition>) -> Self {
        Self {
            slots: Mutex::new(slots),
            unavailable: Mutex::new(None),
        }
    }

    /// Replace the table contents.
    pub fn set(&self, slots: Vec<SlotDefinition>) {
        *self.slots.lock().unwrap_or_else(|e| e.into_inner()) = slots;
    }

    /// Make subsequent reads fail (`Some`) or succeed again (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }
}

#[async_trait]
impl DesiredStateStore for MemoryDesiredState {
    async fn list_enabled_slots(
        &self,
        _host_id: &str,
    ) -> Result<Vec<SlotDefinition>, DesiredStateError> {
        if let Some(reason) = self
            .unavailable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(DesiredStateError::Unavailable(reason));
        }
        Ok(self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }
}
