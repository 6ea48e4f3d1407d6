//! Append-only fact log.
//!
//! Facts are inserted inside the commit transaction and never mutated.
//! Queries answer three shapes: direct lookup by hash, per-entity history,
//! and "latest visible" scans over a branch's (branch, cap) visibility
//! pairs for head fallback and point-in-time reads.

use anyhow::Result;
use sqlx::{Row, SqliteConnection};

use strata_types::{EntityId, Fact, FactKind, Reference, Seq, StrataError};

use crate::branches::VisiblePair;
use crate::db::{seq_to_db, SpaceDb};

/// Storage view over the `fact` table.
#[derive(Debug, Clone)]
pub struct FactLog {
    db: SpaceDb,
}

impl FactLog {
    /// Create a view over the Space database.
    pub fn new(db: SpaceDb) -> Self {
        Self { db }
    }

    /// Append a fact within the caller's commit transaction.
    ///
    /// Duplicate hashes are success: an identical fact (same type, id,
    /// payload and parent) is the same fact.
    pub async fn append(conn: &mut SqliteConnection, fact: &Fact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO fact (hash, id, fact_type, value_ref, parent, branch, seq, commit_ref)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fact.hash.as_str())
        .bind(fact.id.as_str())
        .bind(fact.kind.as_str())
        .bind(fact.payload_ref.as_str())
        .bind(fact.parent.as_ref().map(Reference::as_str))
        .bind(&fact.branch)
        .bind(seq_to_db(fact.seq))
        .bind(fact.commit_ref.as_str())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Fetch a fact by hash.
    pub async fn get(&self, hash: &Reference) -> Result<Option<Fact>> {
        let row = sqlx::query(&format!("{SELECT_FACT} WHERE hash = ?"))
            .bind(hash.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_fact).transpose()
    }

    /// All facts for an entity, ordered by seq ascending.
    pub async fn history(&self, id: &EntityId) -> Result<Vec<Fact>> {
        let rows = sqlx::query(&format!("{SELECT_FACT} WHERE id = ? ORDER BY seq ASC"))
            .bind(id.as_str())
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(row_to_fact).collect()
    }

    /// Facts for an entity on one branch in `(lo, hi]`, optionally filtered
    /// by kind, ordered by seq ascending.
    pub async fn range(
        &self,
        id: &EntityId,
        branch: &str,
        lo_exclusive: Seq,
        hi_inclusive: Seq,
        kind: Option<FactKind>,
    ) -> Result<Vec<Fact>> {
        let mut sql = format!("{SELECT_FACT} WHERE id = ? AND branch = ? AND seq > ? AND seq <= ?");
        if kind.is_some() {
            sql.push_str(" AND fact_type = ?");
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut query = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(branch)
            .bind(seq_to_db(lo_exclusive))
            .bind(seq_to_db(hi_inclusive));
        if let Some(kind) = kind {
            query = query.bind(kind.as_str());
        }
        let rows = query.fetch_all(self.db.pool()).await?;
        rows.iter().map(row_to_fact).collect()
    }

    /// The latest fact for an entity across the visibility pairs.
    pub async fn latest_visible(
        &self,
        id: &EntityId,
        pairs: &[VisiblePair],
    ) -> Result<Option<Fact>> {
        self.latest_where(id, pairs, None).await
    }

    /// The latest non-patch fact (a Set or Delete) across the visibility
    /// pairs with seq at most `hi_inclusive`; the base candidate for patch
    /// materialization.
    pub async fn latest_base_visible(
        &self,
        id: &EntityId,
        pairs: &[VisiblePair],
        hi_inclusive: Seq,
    ) -> Result<Option<Fact>> {
        let capped: Vec<VisiblePair> = pairs
            .iter()
            .map(|(b, cap)| (b.clone(), (*cap).min(hi_inclusive)))
            .collect();
        self.latest_where(id, &capped, Some("fact_type != 'patch'")).await
    }

    /// Patch facts visible in `(lo, hi]`, ordered by seq ascending.
    pub async fn visible_patches(
        &self,
        id: &EntityId,
        pairs: &[VisiblePair],
        lo_exclusive: Seq,
        hi_inclusive: Seq,
    ) -> Result<Vec<Fact>> {
        let Some(visibility) = visibility_clause(pairs) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "{SELECT_FACT} WHERE id = ? AND fact_type = 'patch' AND seq > ? AND seq <= ? AND ({visibility}) ORDER BY seq ASC"
        );
        let mut query = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(seq_to_db(lo_exclusive))
            .bind(seq_to_db(hi_inclusive));
        for (branch, cap) in pairs {
            query = query.bind(branch).bind(seq_to_db(*cap));
        }
        let rows = query.fetch_all(self.db.pool()).await?;
        rows.iter().map(row_to_fact).collect()
    }

    /// Distinct entity ids with any visible fact, ordered, starting after
    /// the `after` cursor. Backs wildcard query pagination.
    pub async fn visible_ids(
        &self,
        pairs: &[VisiblePair],
        after: Option<&EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let Some(visibility) = visibility_clause(pairs) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT DISTINCT id FROM fact WHERE id > ? AND ({visibility}) ORDER BY id ASC LIMIT ?"
        );
        let mut query = sqlx::query(&sql).bind(after.map(EntityId::as_str).unwrap_or(""));
        for (branch, cap) in pairs {
            query = query.bind(branch).bind(seq_to_db(*cap));
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(|r| EntityId(r.get("id"))).collect())
    }

    /// Distinct entities with any fact on `branch` with `seq > after`.
    pub async fn entities_changed_on(&self, branch: &str, after: Seq) -> Result<Vec<EntityId>> {
        let rows = sqlx::query("SELECT DISTINCT id FROM fact WHERE branch = ? AND seq > ? ORDER BY id")
            .bind(branch)
            .bind(seq_to_db(after))
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(|r| EntityId(r.get("id"))).collect())
    }

    /// Count of patch facts for an entity on one branch with `seq > after`.
    pub async fn patch_count_since(&self, id: &EntityId, branch: &str, after: Seq) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM fact WHERE id = ? AND branch = ? AND fact_type = 'patch' AND seq > ?",
        )
        .bind(id.as_str())
        .bind(branch)
        .bind(seq_to_db(after))
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Remove facts superseded by a snapshot and referenced by nothing.
    ///
    /// Candidates are facts for `id` with `seq <= up_to` that are neither a
    /// head nor the `parent` of any remaining fact. The delete iterates to a
    /// fixpoint, so a live linear chain retains every fact its successors
    /// still reference. Returns the number of facts removed.
    pub async fn compact(&self, id: &EntityId, up_to: Seq) -> Result<u64> {
        let mut removed = 0u64;
        loop {
            let result = sqlx::query(
                r#"
                DELETE FROM fact
                WHERE id = ? AND seq <= ?
                  AND hash NOT IN (SELECT parent FROM fact WHERE parent IS NOT NULL)
                  AND hash NOT IN (SELECT fact_hash FROM head)
                "#,
            )
            .bind(id.as_str())
            .bind(seq_to_db(up_to))
            .execute(self.db.pool())
            .await?;
            if result.rows_affected() == 0 {
                break;
            }
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn latest_where(
        &self,
        id: &EntityId,
        pairs: &[VisiblePair],
        extra: Option<&str>,
    ) -> Result<Option<Fact>> {
        let Some(visibility) = visibility_clause(pairs) else {
            return Ok(None);
        };
        let extra = extra.map(|e| format!(" AND {e}")).unwrap_or_default();
        let sql = format!(
            "{SELECT_FACT} WHERE id = ?{extra} AND ({visibility}) ORDER BY seq DESC LIMIT 1"
        );
        let mut query = sqlx::query(&sql).bind(id.as_str());
        for (branch, cap) in pairs {
            query = query.bind(branch).bind(seq_to_db(*cap));
        }
        let row = query.fetch_optional(self.db.pool()).await?;
        row.as_ref().map(row_to_fact).transpose()
    }
}

const SELECT_FACT: &str =
    "SELECT hash, id, fact_type, value_ref, parent, branch, seq, commit_ref FROM fact";

fn visibility_clause(pairs: &[VisiblePair]) -> Option<String> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|_| "(branch = ? AND seq <= ?)")
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn row_to_fact(row: &sqlx::sqlite::SqliteRow) -> Result<Fact> {
    let kind_tag: String = row.get("fact_type");
    let kind = FactKind::parse(&kind_tag)
        .ok_or_else(|| StrataError::Storage(format!("unknown fact type {kind_tag:?}")))?;
    let hash: String = row.get("hash");
    let value_ref: String = row.get("value_ref");
    let parent: Option<String> = row.get("parent");
    let commit_ref: String = row.get("commit_ref");
    Ok(Fact {
        hash: Reference::parse(&hash)?,
        id: EntityId(row.get("id")),
        kind,
        payload_ref: Reference::parse(&value_ref)?,
        parent: parent.as_deref().map(Reference::parse).transpose()?,
        branch: row.get("branch"),
        seq: row.get::<i64, _>("seq") as Seq,
        commit_ref: Reference::parse(&commit_ref)?,
    })
}
