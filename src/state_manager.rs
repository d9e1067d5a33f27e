// src/state_manager.rs

use crate::models::ContentCategory;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tokio_rusqlite::Connection;

pub const KEY_CLICK_COUNT: &str = "monetization_click_count";
pub const KEY_IS_COMPLETE: &str = "monetization_is_complete";
pub const KEY_PLATFORM_TYPE: &str = "monetization_platform_type";
pub const KEY_IS_CONVERSION: &str = "monetization_is_conversion";

const ALL_KEYS: [&str; 4] = [KEY_CLICK_COUNT, KEY_IS_COMPLETE, KEY_PLATFORM_TYPE, KEY_IS_CONVERSION];

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("corrupt value for key {key}: {value:?}")]
    Corrupt { key: &'static str, value: String },
}

/// Gate progress as it is written to the key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedGate {
    pub click_count: u32,
    pub is_complete: bool,
    pub category: ContentCategory,
    pub is_conversion: bool,
}

impl PersistedGate {
    fn to_entries(self) -> Vec<(&'static str, String)> {
        vec![
            (KEY_CLICK_COUNT, self.click_count.to_string()),
            (KEY_IS_COMPLETE, self.is_complete.to_string()),
            (KEY_PLATFORM_TYPE, self.category.as_str().to_string()),
            (KEY_IS_CONVERSION, self.is_conversion.to_string()),
        ]
    }

    /// Rebuilds gate state from stored entries. A missing count means
    /// nothing was ever saved; other missing keys take their zero value.
    fn from_entries(entries: &HashMap<String, String>) -> Result<Option<Self>, StateError> {
        let Some(count) = entries.get(KEY_CLICK_COUNT) else {
            return Ok(None);
        };
        let click_count = count.parse::<u32>().map_err(|_| StateError::Corrupt {
            key: KEY_CLICK_COUNT,
            value: count.clone(),
        })?;
        let is_complete = parse_flag(entries, KEY_IS_COMPLETE)?;
        let is_conversion = parse_flag(entries, KEY_IS_CONVERSION)?;
        let category = match entries.get(KEY_PLATFORM_TYPE) {
            None => ContentCategory::General,
            Some(value) => ContentCategory::parse(value).ok_or_else(|| StateError::Corrupt {
                key: KEY_PLATFORM_TYPE,
                value: value.clone(),
            })?,
        };
        Ok(Some(Self { click_count, is_complete, category, is_conversion }))
    }
}

fn parse_flag(entries: &HashMap<String, String>, key: &'static str) -> Result<bool, StateError> {
    match entries.get(key).map(String::as_str) {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(StateError::Corrupt { key, value: other.to_string() }),
    }
}

/// Durable storage for the monetization gate.
#[async_trait]
pub trait GateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedGate>, StateError>;
    async fn save(&self, gate: &PersistedGate) -> Result<(), StateError>;
    async fn clear(&self) -> Result<(), StateError>;
}

/// Key/value store backed by an SQLite file.
pub struct SqliteGateStore {
    conn: Connection,
}

impl SqliteGateStore {
    /// Opens the database file, creating it and the `kv` table if needed.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS kv (
                        key     TEXT PRIMARY KEY,
                        value   TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Reads a single raw entry.
    pub async fn get(&self, key: &'static str) -> Result<Option<String>, StateError> {
        let value = self
            .conn
            .call(move |conn| {
                let value: Option<String> = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl GateStore for SqliteGateStore {
    async fn load(&self) -> Result<Option<PersistedGate>, StateError> {
        let entries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
                let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
                let entries: Result<HashMap<String, String>, rusqlite::Error> = rows.collect();
                Ok(entries?)
            })
            .await?;
        PersistedGate::from_entries(&entries)
    }

    async fn save(&self, gate: &PersistedGate) -> Result<(), StateError> {
        let entries = gate.to_entries();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (key, value) in &entries {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                for key in ALL_KEYS {
                    conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Process-local store; state is lost when the process exits.
#[derive(Default)]
pub struct MemoryGateStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GateStore for MemoryGateStore {
    async fn load(&self) -> Result<Option<PersistedGate>, StateError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone();
        PersistedGate::from_entries(&entries)
    }

    async fn save(&self, gate: &PersistedGate) -> Result<(), StateError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in gate.to_entries() {
            entries.insert(key.to_string(), value);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StateError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for key in ALL_KEYS {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedGate {
        PersistedGate {
            click_count: 2,
            is_complete: false,
            category: ContentCategory::Restricted,
            is_conversion: true,
        }
    }

    #[tokio::test]
    async fn sqlite_round_trip() {
        let store = SqliteGateStore::in_memory().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(sample()));
        assert_eq!(store.get(KEY_PLATFORM_TYPE).await.unwrap().as_deref(), Some("restricted"));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_round_trip() {
        let store = MemoryGateStore::new();
        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(sample()));
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[test]
    fn corrupt_count_is_reported() {
        let mut entries = HashMap::new();
        entries.insert(KEY_CLICK_COUNT.to_string(), "many".to_string());
        assert!(matches!(
            PersistedGate::from_entries(&entries),
            Err(StateError::Corrupt { key: KEY_CLICK_COUNT, .. })
        ));
    }

    #[test]
    fn legacy_platform_names_load() {
        let mut entries = HashMap::new();
        entries.insert(KEY_CLICK_COUNT.to_string(), "1".to_string());
        entries.insert(KEY_PLATFORM_TYPE.to_string(), "adult".to_string());
        let gate = PersistedGate::from_entries(&entries).unwrap().unwrap();
        assert_eq!(gate.category, ContentCategory::Restricted);
        assert!(!gate.is_conversion);
    }
}
