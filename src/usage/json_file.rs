use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{UsageError, UsageRecord, UsageStore};

/// Counters kept in a single JSON object on disk.
///
/// Each operation reads the whole file and, after a mutation, replaces it via
/// a temp file and a rename so a concurrent `load` never sees half a file.
/// The async mutex serializes load-mutate-save cycles within this process.
#[derive(Debug)]
pub struct JsonFileUsageStore {
    path: PathBuf,
    cycle: Mutex<()>,
}

impl JsonFileUsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cycle: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("usage.json"));
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read_snapshot(&self) -> Result<UsageRecord, UsageError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("Usage file {} not found; starting empty", self.path.display());
                return Ok(UsageRecord::new());
            }
            Err(err) => return Err(err.into()),
        };
        if raw.trim().is_empty() {
            warn!("Usage file {} is empty; treating as no usage", self.path.display());
            return Ok(UsageRecord::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_snapshot(&self, record: &UsageRecord) -> Result<(), UsageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec(record)?;
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for JsonFileUsageStore {
    async fn load(&self) -> Result<UsageRecord, UsageError> {
        self.read_snapshot().await
    }

    async fn save(&self, record: &UsageRecord) -> Result<(), UsageError> {
        let _guard = self.cycle.lock().await;
        self.write_snapshot(record).await
    }

    async fn increment(&self, key: &str) -> Result<u64, UsageError> {
        let _guard = self.cycle.lock().await;
        let mut record = self.read_snapshot().await?;
        let value = record.bump(key);
        self.write_snapshot(&record).await?;
        debug!(key = key, value = value, "usage counter incremented");
        Ok(value)
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> JsonFileUsageStore {
        JsonFileUsageStore::new(tmp.path().join("data").join("request_data.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_record() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);

        let record = store.load().await.unwrap();
        assert!(record.is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn save_then_load_returns_same_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut record = UsageRecord::new();
        record.set("2024-05", 12);
        record.set("safety_trips", 3);

        store.save(&record).await.unwrap();

        assert_eq!(store.load().await.unwrap(), record);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn increment_bumps_key_and_keeps_others() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut record = UsageRecord::new();
        record.set("2024-05", 1);
        record.set("memes", 9);
        store.save(&record).await.unwrap();

        let value = store.increment("2024-05").await.unwrap();
        let reloaded = store.load().await.unwrap();

        assert_eq!(value, 2);
        assert_eq!(reloaded.get("2024-05"), 2);
        assert_eq!(reloaded.get("memes"), 9);
    }

    #[tokio::test]
    async fn reads_file_written_by_older_bot() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), r#"{"2023-11": 100, "safety_trips": 4}"#).unwrap();

        let record = store.load().await.unwrap();
        assert_eq!(record.get("2023-11"), 100);
        assert_eq!(record.get("safety_trips"), 4);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, UsageError::Parse(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_increments_in_one_process_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store_in(&tmp));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("2024-05").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.load().await.unwrap().get("2024-05"), 16);
    }
}
