//! Usage counters: a flat map of counter key to count, persisted as a whole.
//!
//! Keys are either a calendar month tag (`"2024-05"`) or one of the fixed
//! named counters below. Every read starts from a fresh snapshot; nothing is
//! cached between calls.

pub mod json_file;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use json_file::JsonFileUsageStore;
pub use memory::InMemoryUsageStore;

pub const SAFETY_TRIPS_KEY: &str = "safety_trips";
pub const MEMES_KEY: &str = "memes";

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("usage file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("usage file is not a valid counter map: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("usage database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored count for '{key}' is negative ({value})")]
    NegativeCount { key: String, value: i64 },
    #[error("count for '{key}' does not fit the database column ({value})")]
    CountOverflow { key: String, value: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageRecord {
    counts: BTreeMap<String, u64>,
}

impl UsageRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for `key`, zero when the key has never been written.
    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn set(&mut self, key: impl Into<String>, value: u64) {
        self.counts.insert(key.into(), value);
    }

    pub fn bump(&mut self, key: &str) -> u64 {
        let entry = self.counts.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl FromIterator<(String, u64)> for UsageRecord {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        UsageRecord {
            counts: iter.into_iter().collect(),
        }
    }
}

/// Durable counter storage.
///
/// `increment` is one load-mutate-save unit; implementations serialize it
/// against other calls on the same instance. Nothing is coordinated across
/// processes.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn load(&self) -> Result<UsageRecord, UsageError>;

    async fn save(&self, record: &UsageRecord) -> Result<(), UsageError>;

    async fn increment(&self, key: &str) -> Result<u64, UsageError>;

    fn describe(&self) -> String;
}
