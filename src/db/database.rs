use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::models::CounterRow;
use crate::usage::{UsageError, UsageRecord, UsageStore};

/// Counters in a SQLite table, one row per key.
///
/// `increment` is a single upsert statement, so it stays correct even with
/// several writers on the same database file.
#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
    label: String,
}

fn ensure_parent_dir(database_url: &str) -> Result<(), UsageError> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn to_column(key: &str, value: u64) -> Result<i64, UsageError> {
    i64::try_from(value).map_err(|_| UsageError::CountOverflow {
        key: key.to_string(),
        value,
    })
}

fn to_count(row: CounterRow) -> Result<(String, u64), UsageError> {
    let count = u64::try_from(row.count).map_err(|_| UsageError::NegativeCount {
        key: row.counter_key.clone(),
        value: row.count,
    })?;
    Ok((row.counter_key, count))
}

impl SqliteUsageStore {
    pub async fn init(database_url: &str) -> Result<Self, UsageError> {
        ensure_parent_dir(database_url)?;
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let store = Self::connect_with(options, database_url).await?;
        info!("Usage counters stored in {}", database_url);
        Ok(store)
    }

    pub async fn connect_with(
        options: SqliteConnectOptions,
        label: &str,
    ) -> Result<Self, UsageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_counters (\
                counter_key TEXT PRIMARY KEY,\
                count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),\
                updated_at TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        Ok(SqliteUsageStore {
            pool,
            label: label.to_string(),
        })
    }

    pub async fn health_check(&self) -> Result<(), UsageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn load(&self) -> Result<UsageRecord, UsageError> {
        let rows = sqlx::query_as::<_, CounterRow>(
            "SELECT counter_key, count FROM usage_counters ORDER BY counter_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(to_count).collect()
    }

    async fn save(&self, record: &UsageRecord) -> Result<(), UsageError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM usage_counters")
            .execute(&mut *tx)
            .await?;
        for (key, value) in record.iter() {
            let value = to_column(key, value)?;
            sqlx::query(
                "INSERT INTO usage_counters (counter_key, count, updated_at) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(value)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<u64, UsageError> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO usage_counters (counter_key, count, updated_at) VALUES (?, 1, ?) \
             ON CONFLICT(counter_key) DO UPDATE SET \
             count = usage_counters.count + 1, \
             updated_at = excluded.updated_at \
             RETURNING count",
        )
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        debug!(key = key, value = value, "usage counter incremented");

        u64::try_from(value).map_err(|_| UsageError::NegativeCount {
            key: key.to_string(),
            value,
        })
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.label)
    }
}
