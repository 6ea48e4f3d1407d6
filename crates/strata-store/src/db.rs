//! Space database lifecycle.
//!
//! Opens or creates the single SQLite file a Space owns, applies the
//! connection pragmas, runs schema migration and seeds the two rows that are
//! never deleted: the `__empty__` value and the default branch.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use strata_types::{DEFAULT_BRANCH, EMPTY_HASH};

use crate::config::SpaceConfig;

/// Clamp a seq for an SQLite INTEGER bind. `Seq::MAX` caps (used for
/// "uncapped" visibility) must not wrap negative.
pub(crate) fn seq_to_db(seq: strata_types::Seq) -> i64 {
    seq.min(i64::MAX as u64) as i64
}

/// Handle to one Space's database.
///
/// Cheap to clone; all storage subsystems share the underlying pool.
#[derive(Debug, Clone)]
pub struct SpaceDb {
    pool: SqlitePool,
    config: SpaceConfig,
}

impl SpaceDb {
    /// Open or create the Space database at `path`.
    ///
    /// Applies WAL journaling, `synchronous = NORMAL`, the configured busy
    /// timeout, page cache, mmap window and FK enforcement; the page size
    /// takes effect on creation.
    pub async fn open<P: AsRef<Path>>(path: P, config: SpaceConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true)
            .page_size(config.page_size)
            .pragma("cache_size", format!("-{}", config.page_cache_kib))
            .pragma("temp_store", "MEMORY")
            .pragma("mmap_size", config.mmap_bytes.to_string());
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Self::from_pool(pool, config).await?;
        info!(path = %path.as_ref().display(), "space database open");
        Ok(db)
    }

    /// Open an in-memory database, useful for tests and ephemeral Spaces.
    ///
    /// The pool is pinned to a single connection so every caller sees the
    /// same in-memory database.
    pub async fn in_memory(config: SpaceConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, config).await
    }

    /// Wrap an existing pool, running migration and seeding.
    pub async fn from_pool(pool: SqlitePool, config: SpaceConfig) -> Result<Self> {
        let db = Self { pool, config };
        db.migrate().await?;
        db.seed().await?;
        Ok(db)
    }

    /// The shared connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The Space's configuration.
    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the schema if it does not exist yet.
    ///
    /// The commit table is named `commit_log` because `COMMIT` is an SQL
    /// keyword; the logical model is unchanged.
    async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS value (
                hash TEXT PRIMARY KEY,
                data TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS commit_log (
                hash TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                branch TEXT NOT NULL,
                reads TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS fact (
                hash TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                fact_type TEXT NOT NULL,
                value_ref TEXT NOT NULL REFERENCES value(hash),
                parent TEXT,
                branch TEXT NOT NULL,
                seq INTEGER NOT NULL,
                commit_ref TEXT NOT NULL REFERENCES commit_log(hash)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS head (
                branch TEXT NOT NULL,
                id TEXT NOT NULL,
                fact_hash TEXT NOT NULL REFERENCES fact(hash),
                seq INTEGER NOT NULL,
                PRIMARY KEY (branch, id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS snapshot (
                branch TEXT NOT NULL,
                id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                value_ref TEXT NOT NULL REFERENCES value(hash),
                PRIMARY KEY (branch, id, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS branch (
                name TEXT PRIMARY KEY,
                parent_branch TEXT REFERENCES branch(name),
                fork_seq INTEGER NOT NULL,
                head_seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS blob_store (
                hash TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                content_type TEXT,
                size INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_fact_seq ON fact(seq)",
            "CREATE INDEX IF NOT EXISTS idx_fact_id ON fact(id)",
            "CREATE INDEX IF NOT EXISTS idx_fact_id_seq ON fact(id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_fact_commit ON fact(commit_ref)",
            "CREATE INDEX IF NOT EXISTS idx_fact_branch ON fact(branch)",
            "CREATE INDEX IF NOT EXISTS idx_head_branch ON head(branch)",
            "CREATE INDEX IF NOT EXISTS idx_commit_seq ON commit_log(seq)",
            "CREATE INDEX IF NOT EXISTS idx_commit_branch ON commit_log(branch)",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Seed the `__empty__` value row and the default branch row.
    async fn seed(&self) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO value (hash, data) VALUES (?, NULL)")
            .bind(EMPTY_HASH)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO branch (name, parent_branch, fork_seq, head_seq, created_at)
            VALUES (?, NULL, 0, 0, ?)
            "#,
        )
        .bind(DEFAULT_BRANCH)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
