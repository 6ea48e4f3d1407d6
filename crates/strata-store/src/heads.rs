//! Branch-scoped head pointers.
//!
//! Key is `(branch, id)`, value is the hash and seq of the entity's current
//! fact on that branch. Resolution falls back through the parent chain,
//! capped at each hop by the fork seq crossed, and caches what it finds into
//! the child's own row so subsequent lookups are O(1).

use anyhow::Result;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use strata_types::{EntityId, Head, Seq};

use crate::branches::BranchStore;
use crate::db::{seq_to_db, SpaceDb};
use crate::facts::FactLog;

/// Storage view over the `head` table.
#[derive(Debug, Clone)]
pub struct HeadIndex {
    db: SpaceDb,
    branches: BranchStore,
    facts: FactLog,
}

impl HeadIndex {
    /// Create a view over the Space database.
    pub fn new(db: SpaceDb) -> Self {
        Self {
            branches: BranchStore::new(db.clone()),
            facts: FactLog::new(db.clone()),
            db,
        }
    }

    /// Direct lookup of a branch's own head row, no fallback.
    pub async fn lookup(&self, branch: &str, id: &EntityId) -> Result<Option<Head>> {
        let row = sqlx::query("SELECT fact_hash, seq FROM head WHERE branch = ? AND id = ?")
            .bind(branch)
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|r| row_to_head(&r)).transpose()
    }

    /// Resolve the current head for `(branch, id)`, falling back through
    /// the parent chain.
    ///
    /// An ancestor's own head row short-circuits the walk when its seq is
    /// within the fork cap; an ancestor that advanced past the fork forces
    /// a history scan over the visible (branch, cap) pairs. Either way the
    /// result is cached into the child's row.
    pub async fn resolve(&self, branch: &str, id: &EntityId) -> Result<Option<Head>> {
        if let Some(head) = self.lookup(branch, id).await? {
            return Ok(Some(head));
        }
        let pairs = self.branches.visible_pairs(branch).await?;
        if pairs.len() <= 1 {
            // Root branch with no row: the entity never existed here.
            return Ok(None);
        }

        for (ancestor, cap) in pairs.iter().skip(1) {
            match self.lookup(ancestor, id).await? {
                Some(head) if head.seq <= *cap => {
                    debug!(branch, ancestor = %ancestor, id = %id, seq = head.seq, "head inherited");
                    self.lazy_copy(branch, id, &head).await?;
                    return Ok(Some(head));
                }
                Some(_) => break, // advanced past the fork; scan history
                None => continue,
            }
        }

        let head = self
            .facts
            .latest_visible(id, &pairs)
            .await?
            .map(|f| Head { fact_hash: f.hash, seq: f.seq });
        if let Some(head) = &head {
            self.lazy_copy(branch, id, head).await?;
        }
        Ok(head)
    }

    /// Overwrite the head row within the commit transaction.
    pub async fn upsert(
        conn: &mut SqliteConnection,
        branch: &str,
        id: &EntityId,
        head: &Head,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO head (branch, id, fact_hash, seq) VALUES (?, ?, ?, ?)")
            .bind(branch)
            .bind(id.as_str())
            .bind(head.fact_hash.as_str())
            .bind(seq_to_db(head.seq))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Cache an inherited head into the child's own row.
    ///
    /// OR IGNORE: a concurrent commit's upsert wins over a stale copy.
    async fn lazy_copy(&self, branch: &str, id: &EntityId, head: &Head) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO head (branch, id, fact_hash, seq) VALUES (?, ?, ?, ?)")
            .bind(branch)
            .bind(id.as_str())
            .bind(head.fact_hash.as_str())
            .bind(seq_to_db(head.seq))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

fn row_to_head(row: &sqlx::sqlite::SqliteRow) -> Result<Head> {
    let hash: String = row.get("fact_hash");
    Ok(Head {
        fact_hash: strata_types::Reference::parse(&hash)?,
        seq: row.get::<i64, _>("seq") as Seq,
    })
}
