//! JSON blob storage.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Read a JSON value by key
    ///
    /// A stored value that no longer parses as JSON is logged and reported as absent.
    pub async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM kv_store WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read key '{}': {}",
                key, e
            )))
        })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding corrupt stored value");
                Ok(None)
            }
        }
    }

    /// Write a JSON value by key, replacing any previous value
    pub async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&raw)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write key '{}': {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// Overwrite the raw text of a key, bypassing JSON encoding
    #[cfg(test)]
    pub(crate) async fn set_raw(&self, key: &str, raw: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, 0)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
