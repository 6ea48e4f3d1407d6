//! Branch metadata rows and lineage resolution.
//!
//! Branch rows carry the fork point into the parent; the heavy lifting of
//! fork/merge semantics lives in the engine. This module answers the one
//! question every read path asks: which (branch, seq-cap) pairs are visible
//! from a given branch.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use strata_types::{BranchRecord, Seq, StrataError};

use crate::db::SpaceDb;

/// One hop of a branch's visible history: facts on `branch` with
/// `seq <= cap` are visible.
pub type VisiblePair = (String, Seq);

/// Storage view over the `branch` table.
#[derive(Debug, Clone)]
pub struct BranchStore {
    db: SpaceDb,
}

impl BranchStore {
    /// Create a view over the Space database.
    pub fn new(db: SpaceDb) -> Self {
        Self { db }
    }

    /// Fetch a branch row by name, soft-deleted rows included.
    pub async fn get(&self, name: &str) -> Result<Option<BranchRecord>> {
        let row = sqlx::query(
            "SELECT name, parent_branch, fork_seq, head_seq, created_at, deleted_at FROM branch WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|r| row_to_branch(&r)))
    }

    /// Fetch a live branch row, erroring on missing or soft-deleted names.
    pub async fn get_live(&self, name: &str) -> Result<BranchRecord> {
        match self.get(name).await? {
            Some(rec) if rec.deleted_at.is_none() => Ok(rec),
            _ => Err(StrataError::UnknownBranch(name.to_string()).into()),
        }
    }

    /// Insert a new branch row.
    pub async fn insert(&self, rec: &BranchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branch (name, parent_branch, fork_seq, head_seq, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rec.name)
        .bind(rec.parent.as_deref())
        .bind(rec.fork_seq as i64)
        .bind(rec.head_seq as i64)
        .bind(rec.created_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// List branch rows, optionally including soft-deleted ones.
    pub async fn list(&self, include_deleted: bool) -> Result<Vec<BranchRecord>> {
        let sql = if include_deleted {
            "SELECT name, parent_branch, fork_seq, head_seq, created_at, deleted_at FROM branch ORDER BY created_at"
        } else {
            "SELECT name, parent_branch, fork_seq, head_seq, created_at, deleted_at FROM branch WHERE deleted_at IS NULL ORDER BY created_at"
        };
        let rows = sqlx::query(sql).fetch_all(self.db.pool()).await?;
        Ok(rows.iter().map(row_to_branch).collect())
    }

    /// Soft-delete a branch: mark the row, drop its heads and snapshots.
    ///
    /// Facts are shared with descendants and retained; the name stays
    /// consumed forever.
    pub async fn soft_delete(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("UPDATE branch SET deleted_at = ? WHERE name = ?")
            .bind(at)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM head WHERE branch = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snapshot WHERE branch = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Advance a branch's recorded head seq within a commit transaction.
    pub async fn bump_head_seq(conn: &mut SqliteConnection, name: &str, seq: Seq) -> Result<()> {
        sqlx::query("UPDATE branch SET head_seq = ? WHERE name = ?")
            .bind(seq as i64)
            .bind(name)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Walk from `name` to the root branch, child first.
    pub async fn lineage(&self, name: &str) -> Result<Vec<BranchRecord>> {
        let mut chain = Vec::new();
        let mut cursor = Some(name.to_string());
        while let Some(current) = cursor {
            let rec = self
                .get(&current)
                .await?
                .ok_or_else(|| StrataError::UnknownBranch(current.clone()))?;
            cursor = rec.parent.clone();
            chain.push(rec);
        }
        Ok(chain)
    }

    /// The (branch, cap) pairs visible from `name`.
    ///
    /// A fact on branch `b` at seq `s` is visible iff some pair `(b, cap)`
    /// has `s <= cap`. The branch itself is uncapped; each ancestor hop
    /// tightens the cap to the minimum fork seq crossed so far.
    pub async fn visible_pairs(&self, name: &str) -> Result<Vec<VisiblePair>> {
        let chain = self.lineage(name).await?;
        let mut pairs = Vec::with_capacity(chain.len());
        let mut cap = Seq::MAX;
        for (i, rec) in chain.iter().enumerate() {
            if i > 0 {
                // Crossing into the parent: the child's fork point bounds
                // everything above it.
                cap = cap.min(chain[i - 1].fork_seq);
            }
            pairs.push((rec.name.clone(), cap));
        }
        Ok(pairs)
    }

    /// [`visible_pairs`](Self::visible_pairs) additionally bounded by
    /// `at` for point-in-time reads.
    pub async fn visible_pairs_at(&self, name: &str, at: Seq) -> Result<Vec<VisiblePair>> {
        let mut pairs = self.visible_pairs(name).await?;
        for pair in &mut pairs {
            pair.1 = pair.1.min(at);
        }
        Ok(pairs)
    }
}

fn row_to_branch(row: &sqlx::sqlite::SqliteRow) -> BranchRecord {
    BranchRecord {
        name: row.get("name"),
        parent: row.get("parent_branch"),
        fork_seq: row.get::<i64, _>("fork_seq") as Seq,
        head_seq: row.get::<i64, _>("head_seq") as Seq,
        created_at: row.get("created_at"),
        deleted_at: row.get("deleted_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceConfig;
    use strata_types::DEFAULT_BRANCH;

    async fn store() -> BranchStore {
        let db = SpaceDb::in_memory(SpaceConfig::default()).await.unwrap();
        BranchStore::new(db)
    }

    fn branch(name: &str, parent: &str, fork_seq: Seq) -> BranchRecord {
        BranchRecord {
            name: name.to_string(),
            parent: Some(parent.to_string()),
            fork_seq,
            head_seq: fork_seq,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn lineage_walks_to_root() {
        let branches = store().await;
        branches.insert(&branch("a", DEFAULT_BRANCH, 5)).await.unwrap();
        branches.insert(&branch("a/b", "a", 9)).await.unwrap();

        let chain = branches.lineage("a/b").await.unwrap();
        let names: Vec<&str> = chain.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a/b", "a", DEFAULT_BRANCH]);
    }

    #[tokio::test]
    async fn visible_pairs_tighten_caps() {
        let branches = store().await;
        branches.insert(&branch("a", DEFAULT_BRANCH, 20)).await.unwrap();
        // Child forked later but from an older point of "a".
        branches.insert(&branch("a/b", "a", 7)).await.unwrap();

        let pairs = branches.visible_pairs("a/b").await.unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a/b".to_string(), Seq::MAX),
                ("a".to_string(), 7),
                (DEFAULT_BRANCH.to_string(), 7),
            ]
        );

        let pairs = branches.visible_pairs_at("a/b", 3).await.unwrap();
        assert!(pairs.iter().all(|(_, cap)| *cap == 3));
    }

    #[tokio::test]
    async fn soft_delete_keeps_name_row() {
        let branches = store().await;
        branches.insert(&branch("dead", DEFAULT_BRANCH, 1)).await.unwrap();
        branches.soft_delete("dead", Utc::now()).await.unwrap();

        assert!(branches.get("dead").await.unwrap().unwrap().deleted_at.is_some());
        assert!(branches.get_live("dead").await.is_err());
        // A second insert with the consumed name violates the primary key.
        assert!(branches.insert(&branch("dead", DEFAULT_BRANCH, 1)).await.is_err());
        assert_eq!(branches.list(false).await.unwrap().len(), 1);
        assert_eq!(branches.list(true).await.unwrap().len(), 2);
    }
}
