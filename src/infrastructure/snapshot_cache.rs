use crate::infrastructure::error::{InfraError, poisoned};
use crate::infrastructure::storage::open_database;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Namespaced key/value store for offline fallback data. Never authoritative
/// while the remote is reachable.
pub trait SnapshotCache: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), InfraError>;
    fn remove(&self, namespace: &str, key: &str) -> Result<(), InfraError>;
}

fn normalized(namespace: &str, key: &str) -> Result<(String, String), InfraError> {
    let namespace = namespace.trim();
    let key = key.trim();
    if namespace.is_empty() || key.is_empty() {
        return Err(InfraError::invalid_input(
            "snapshot namespace and key must not be empty",
        ));
    }
    Ok((namespace.to_string(), key.to_string()))
}

#[derive(Debug, Clone)]
pub struct SqliteSnapshotCache {
    db_path: PathBuf,
}

impl SqliteSnapshotCache {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

impl SnapshotCache for SqliteSnapshotCache {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, InfraError> {
        let (namespace, key) = normalized(namespace, key)?;
        let connection = open_database(&self.db_path)?;
        let value = connection
            .query_row(
                "SELECT value FROM snapshots WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), InfraError> {
        let (namespace, key) = normalized(namespace, key)?;
        let connection = open_database(&self.db_path)?;
        connection.execute(
            "INSERT INTO snapshots (namespace, key, value, saved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
               value = excluded.value,
               saved_at = excluded.saved_at",
            params![namespace, key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), InfraError> {
        let (namespace, key) = normalized(namespace, key)?;
        let connection = open_database(&self.db_path)?;
        connection.execute(
            "DELETE FROM snapshots WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotCache {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl SnapshotCache for InMemorySnapshotCache {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, InfraError> {
        let entry = normalized(namespace, key)?;
        let entries = self
            .entries
            .lock()
            .map_err(|error| poisoned("snapshot cache", error))?;
        Ok(entries.get(&entry).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), InfraError> {
        let entry = normalized(namespace, key)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| poisoned("snapshot cache", error))?;
        entries.insert(entry, value.to_string());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<(), InfraError> {
        let entry = normalized(namespace, key)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| poisoned("snapshot cache", error))?;
        entries.remove(&entry);
        Ok(())
    }
}
