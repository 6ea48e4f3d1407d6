//! Content-addressed value and blob rows.
//!
//! The deduplication layer: rows are keyed by content hash, writes are
//! idempotent by primary key (`INSERT OR IGNORE`), duplicate inserts are
//! success. The store has no understanding of value semantics.

use anyhow::Result;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};

use strata_types::{canonical_bytes, Reference};

use crate::db::SpaceDb;

/// A stored binary blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// The blob bytes.
    pub data: Vec<u8>,
    /// Optional MIME type recorded at write time.
    pub content_type: Option<String>,
    /// Byte length, denormalized for listing without loading data.
    pub size: u64,
}

/// Content-addressed JSON-value dedup and blob store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    db: SpaceDb,
}

impl ContentStore {
    /// Create a view over the Space database.
    pub fn new(db: SpaceDb) -> Self {
        Self { db }
    }

    /// Store a value row keyed by its canonical-encoding hash.
    pub async fn put_value(&self, value: &Value) -> Result<Reference> {
        let mut conn = self.db.pool().acquire().await?;
        Self::put_value_in(&mut *conn, value).await
    }

    /// Transaction-scoped variant of [`put_value`](Self::put_value).
    pub async fn put_value_in(conn: &mut SqliteConnection, value: &Value) -> Result<Reference> {
        let reference = Reference::of(value);
        let data = String::from_utf8(canonical_bytes(value))?;
        sqlx::query("INSERT OR IGNORE INTO value (hash, data) VALUES (?, ?)")
            .bind(reference.as_str())
            .bind(data)
            .execute(&mut *conn)
            .await?;
        Ok(reference)
    }

    /// Point lookup of a value row.
    ///
    /// Returns `None` for missing rows and for the `__empty__` sentinel,
    /// whose data column is NULL.
    pub async fn get_value(&self, reference: &Reference) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT data FROM value WHERE hash = ?")
            .bind(reference.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let data: Option<String> = row.get("data");
        match data {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Count of distinct value rows, the sentinel included.
    pub async fn value_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM value")
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.get("n"))
    }

    /// Store a blob keyed by its byte hash. Idempotent.
    pub async fn put_blob(&self, data: &[u8], content_type: Option<&str>) -> Result<Reference> {
        let reference = Reference::of_bytes(data);
        sqlx::query(
            "INSERT OR IGNORE INTO blob_store (hash, data, content_type, size) VALUES (?, ?, ?, ?)",
        )
        .bind(reference.as_str())
        .bind(data)
        .bind(content_type)
        .bind(data.len() as i64)
        .execute(self.db.pool())
        .await?;
        Ok(reference)
    }

    /// Point lookup of a blob.
    pub async fn get_blob(&self, reference: &Reference) -> Result<Option<Blob>> {
        let row = sqlx::query("SELECT data, content_type, size FROM blob_store WHERE hash = ?")
            .bind(reference.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|r| Blob {
            data: r.get("data"),
            content_type: r.get("content_type"),
            size: r.get::<i64, _>("size") as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceConfig;
    use serde_json::json;

    async fn store() -> ContentStore {
        let db = SpaceDb::in_memory(SpaceConfig::default()).await.unwrap();
        ContentStore::new(db)
    }

    #[tokio::test]
    async fn value_roundtrip_and_dedup() {
        let content = store().await;
        let v = json!({"a": 1, "b": [true, null]});

        let r1 = content.put_value(&v).await.unwrap();
        let r2 = content.put_value(&v).await.unwrap();
        assert_eq!(r1, r2);

        // Sentinel row + exactly one value row.
        assert_eq!(content.value_count().await.unwrap(), 2);
        assert_eq!(content.get_value(&r1).await.unwrap(), Some(v));
    }

    #[tokio::test]
    async fn empty_sentinel_reads_as_none() {
        let content = store().await;
        assert_eq!(content.get_value(&Reference::empty()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let content = store().await;
        let bytes = b"binary payload";

        let r = content.put_blob(bytes, Some("application/octet-stream")).await.unwrap();
        // Duplicate write succeeds.
        let r2 = content.put_blob(bytes, None).await.unwrap();
        assert_eq!(r, r2);

        let blob = content.get_blob(&r).await.unwrap().unwrap();
        assert_eq!(blob.data, bytes);
        assert_eq!(blob.size, bytes.len() as u64);
        assert_eq!(blob.content_type.as_deref(), Some("application/octet-stream"));
    }
}
