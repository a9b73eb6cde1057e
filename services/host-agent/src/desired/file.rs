//! Desired state from a JSON file.
//!
//! The file holds an array of rows, re-read on every cycle:
//!
//! ```json
//! [{"host_id": "h1", "agent_id": "3f2a", "slot": 0, "image_name": "base", "enabled": true}]
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use vmfleet_reconcile::SlotDefinition;

use super::{DesiredStateError, DesiredStateStore};

#[derive(Debug, Deserialize)]
struct SlotRow {
    host_id: String,
    #[serde(flatten)]
    definition: SlotDefinition,
}

/// Desired state read from a JSON file.
#[derive(Debug, Clone)]
pub struct FileDesiredState {
    path: PathBuf,
}

impl FileDesiredState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DesiredStateStore for FileDesiredState {
    async fn list_enabled_slots(
        &self,
        host_id: &str,
    ) -> Result<Vec<SlotDefinition>, DesiredStateError> {
        let path = self.path.display().to_string();
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| DesiredStateError::Read {
                path: path.clone(),
                source,
            })?;
        let rows: Vec<SlotRow> = serde_json::from_slice(&bytes)
            .map_err(|source| DesiredStateError::Parse { path, source })?;

        Ok(rows
            .into_iter()
            .filter(|r| r.host_id == host_id && r.definition.enabled)
            .map(|r| r.definition)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filters_by_host_and_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slots.json");
        std::fs::write(
            &path,
            r#"[
                {"host_id": "h1", "agent_id": "a", "slot": 0, "image_name": "base", "enabled": true},
                {"host_id": "h1", "agent_id": "b", "slot": 1, "image_name": "base", "enabled": false},
                {"host_id": "h2", "agent_id": "c", "slot": 2, "image_name": "base", "enabled": true}
            ]"#,
        )
        .unwrap();

        let store = FileDesiredState::new(&path);
        let slots = store.list_enabled_slots("h1").await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].agent_id, "a");
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDesiredState::new(dir.path().join("absent.json"));
        assert!(matches!(
            store.list_enabled_slots("h1").await,
            Err(DesiredStateError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_negative_slot_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slots.json");
        std::fs::write(
            &path,
            r#"[{"host_id": "h1", "agent_id": "a", "slot": -1, "image_name": "base", "enabled": true}]"#,
        )
        .unwrap();

        let store = FileDesiredState::new(&path);
        assert!(matches!(
            store.list_enabled_slots("h1").await,
            Err(DesiredStateError::Parse { .. })
        ));
    }
}
