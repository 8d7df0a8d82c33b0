use crate::infrastructure::error::{InfraError, poisoned};
use crate::infrastructure::storage::open_database;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Bookkeeping for the last remote pull that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub owner_id: String,
    pub last_sync_time: DateTime<Utc>,
}

pub trait SyncStateRepository: Send + Sync {
    fn load(&self) -> Result<Option<SyncState>, InfraError>;
    fn save(&self, owner_id: &str, last_sync_time: DateTime<Utc>) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSyncStateRepository {
    db_path: PathBuf,
}

impl SqliteSyncStateRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

impl SyncStateRepository for SqliteSyncStateRepository {
    fn load(&self) -> Result<Option<SyncState>, InfraError> {
        let connection = open_database(&self.db_path)?;
        let row: Option<(String, String)> = connection
            .query_row(
                "SELECT owner_id, last_sync_time FROM sync_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((owner_id, last_sync_time_raw)) = row else {
            return Ok(None);
        };

        let parsed = DateTime::parse_from_rfc3339(&last_sync_time_raw).map_err(|error| {
            InfraError::InvalidConfig(format!(
                "invalid sync_state.last_sync_time '{last_sync_time_raw}': {error}"
            ))
        })?;

        Ok(Some(SyncState {
            owner_id,
            last_sync_time: parsed.with_timezone(&Utc),
        }))
    }

    fn save(&self, owner_id: &str, last_sync_time: DateTime<Utc>) -> Result<(), InfraError> {
        let connection = open_database(&self.db_path)?;
        connection.execute(
            "INSERT INTO sync_state (id, owner_id, last_sync_time)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               owner_id = excluded.owner_id,
               last_sync_time = excluded.last_sync_time",
            params![owner_id, last_sync_time.to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncStateRepository {
    state: Mutex<Option<SyncState>>,
}

impl SyncStateRepository for InMemorySyncStateRepository {
    fn load(&self) -> Result<Option<SyncState>, InfraError> {
        let state = self
            .state
            .lock()
            .map_err(|error| poisoned("sync state", error))?;
        Ok(state.clone())
    }

    fn save(&self, owner_id: &str, last_sync_time: DateTime<Utc>) -> Result<(), InfraError> {
        let mut state = self
            .state
            .lock()
            .map_err(|error| poisoned("sync state", error))?;
        *state = Some(SyncState {
            owner_id: owner_id.to_string(),
            last_sync_time,
        });
        Ok(())
    }
}
