//! Persistence of the last poll cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::Mutex;

use moldap_common::Result;

/// Store for per-base poll cursors.
///
/// Stores never move a cursor backwards: storing an older timestamp than
/// the one held is a no-op.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last stored cursor for `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record that everything up to `at` under `key` has been covered.
    async fn store(&self, key: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Process-lifetime cursor store.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.cursors.lock().await.get(key).copied())
    }

    async fn store(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut cursors = self.cursors.lock().await;
        let entry = cursors.entry(key.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }
}

/// Cursor store backed by a JSON file mapping key to RFC 3339 timestamp.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash never leaves a half-written file behind.
pub struct FileCursorStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.get(key).copied())
    }

    async fn store(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut cursors = self.read_all().await?;
        if cursors.get(key).is_some_and(|existing| *existing >= at) {
            return Ok(());
        }
        cursors.insert(key.to_string(), at);

        let json = serde_json::to_vec_pretty(&cursors)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_never_moves_backwards() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load("ou=users").await.unwrap(), None);
        store.store("ou=users", at(100)).await.unwrap();
        store.store("ou=users", at(50)).await.unwrap();
        assert_eq!(store.load("ou=users").await.unwrap(), Some(at(100)));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cursors.json");

        let store = FileCursorStore::new(&path);
        store.store("ou=a", at(1_000)).await.unwrap();
        store.store("ou=b", at(2_000)).await.unwrap();
        store.store("ou=a", at(500)).await.unwrap();

        let reopened = FileCursorStore::new(&path);
        assert_eq!(reopened.load("ou=a").await.unwrap(), Some(at(1_000)));
        assert_eq!(reopened.load("ou=b").await.unwrap(), Some(at(2_000)));
        assert_eq!(reopened.load("ou=c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCursorStore::new(temp_dir.path().join("absent.json"));
        assert_eq!(store.load("x").await.unwrap(), None);
    }
}
