//! Postgres-backed desired state.
//!
//! Reads the `firecracker_slot` table:
//!
//! ```sql
//! firecracker_slot (host_id text, agent_id text, slot integer, image_name text, enabled boolean)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};
use vmfleet_reconcile::SlotDefinition;

use super::{DesiredStateError, DesiredStateStore};

const ENABLED_SLOTS_QUERY: &str = r#"
    SELECT agent_id, slot::bigint AS slot, image_name, enabled
    FROM firecracker_slot
    WHERE host_id = $1 AND enabled
    ORDER BY slot
"#;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/vmfleet".to_string(),
            max_connections: 2,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// Load configuration from a variable source.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = var("DB_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let min_connections = var("DB_MIN_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_connections);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..defaults
        }
    }
}

/// Desired state read from Postgres.
#[derive(Clone)]
pub struct PostgresDesiredState {
    pool: PgPool,
}

impl PostgresDesiredState {
    /// Connect and verify the database is reachable.
    pub async fn connect(config: &DbConfig) -> Result<Self, DesiredStateError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to desired-state database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(DesiredStateError::Connect)?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(DesiredStateError::Query)?;

        info!("Desired-state database connection established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DesiredStateStore for PostgresDesiredState {
    async fn list_enabled_slots(
        &self,
        host_id: &str,
    ) -> Result<Vec<SlotDefinition>, DesiredStateError> {
        let rows = sqlx::query(ENABLED_SLOTS_QUERY)
            .bind(host_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DesiredStateError::Query)?;

        let mut slots = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(slot) = slot_from_row(row)? {
                slots.push(slot);
            }
        }
        Ok(slots)
    }
}

fn slot_from_row(row: &PgRow) -> Result<Option<SlotDefinition>, DesiredStateError> {
    let agent_id: String = row.try_get("agent_id").map_err(DesiredStateError::Query)?;
    let slot: i64 = row.try_get("slot").map_err(DesiredStateError::Query)?;
    let image_name: String = row.try_get("image_name").map_err(DesiredStateError::Query)?;
    let enabled: bool = row.try_get("enabled").map_err(DesiredStateError::Query)?;

    let Ok(slot) = u32::try_from(slot) else {
        warn!(agent_id = %agent_id, slot, "Skipping slot row with out-of-range slot");
        return Ok(None);
    };

    Ok(Some(SlotDefinition {
        agent_id,
        slot,
        image_name,
        enabled,
    }))
}
