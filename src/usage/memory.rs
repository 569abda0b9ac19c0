use async_trait::async_trait;
use parking_lot::Mutex;

use super::{UsageError, UsageRecord, UsageStore};

/// Process-local counters, used by tests and as a throwaway backend.
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    record: Mutex<UsageRecord>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: UsageRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn load(&self) -> Result<UsageRecord, UsageError> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, record: &UsageRecord) -> Result<(), UsageError> {
        *self.record.lock() = record.clone();
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<u64, UsageError> {
        Ok(self.record.lock().bump(key))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
