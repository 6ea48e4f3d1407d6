//! Snapshot-accelerated reads.
//!
//! Current and point-in-time reads share one materialization path: resolve
//! the head (or the PIT head), and for Patch heads replay the visible patch
//! run on top of the nearest base — a snapshot when one exists, otherwise
//! the latest Set or Delete fact, otherwise the empty object. Snapshots are
//! semantically transparent: reads produce identical values with and
//! without them.

use anyhow::Result;
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, warn};

use strata_types::{
    patch::{apply_patches, PatchOp},
    EntityId, Fact, FactKind, Reference, Seq, SnapshotRecord, StrataError,
};

use crate::branches::BranchStore;
use crate::content::ContentStore;
use crate::db::{seq_to_db, SpaceDb};
use crate::facts::FactLog;
use crate::heads::HeadIndex;

/// Outcome of reading an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadView {
    /// The entity never existed on the branch-visible history.
    Absent,
    /// The entity's head is a tombstone.
    Deleted,
    /// The entity's materialized value.
    Value(Value),
}

impl ReadView {
    /// The value, if the entity currently has one.
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent | Self::Deleted => None,
        }
    }
}

/// Periodic materializations plus patch replay for fast reads.
#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    db: SpaceDb,
    content: ContentStore,
    facts: FactLog,
    heads: HeadIndex,
    branches: BranchStore,
}

impl SnapshotEngine {
    /// Create a view over the Space database.
    pub fn new(db: SpaceDb) -> Self {
        Self {
            content: ContentStore::new(db.clone()),
            facts: FactLog::new(db.clone()),
            heads: HeadIndex::new(db.clone()),
            branches: BranchStore::new(db.clone()),
            db,
        }
    }

    /// Read the current value of `(branch, id)`.
    pub async fn read_current(&self, branch: &str, id: &EntityId) -> Result<ReadView> {
        let Some(head) = self.heads.resolve(branch, id).await? else {
            return Ok(ReadView::Absent);
        };
        let fact = self.facts.get(&head.fact_hash).await?.ok_or_else(|| {
            StrataError::InvariantBreach(format!(
                "head of {id} on {branch:?} references missing fact {}",
                head.fact_hash
            ))
        })?;
        if fact.seq != head.seq {
            return Err(StrataError::InvariantBreach(format!(
                "head seq {} does not match fact seq {} for {id}",
                head.seq, fact.seq
            ))
            .into());
        }
        self.view_of(branch, id, &fact).await
    }

    /// Read the value of `(branch, id)` as of `target_seq`.
    ///
    /// The head at `target_seq` is the latest branch-visible fact with
    /// `seq <= target_seq`.
    pub async fn read_at(&self, branch: &str, id: &EntityId, target_seq: Seq) -> Result<ReadView> {
        let pairs = self.branches.visible_pairs_at(branch, target_seq).await?;
        let Some(fact) = self.facts.latest_visible(id, &pairs).await? else {
            return Ok(ReadView::Absent);
        };
        self.view_of(branch, id, &fact).await
    }

    async fn view_of(&self, branch: &str, id: &EntityId, head_fact: &Fact) -> Result<ReadView> {
        match head_fact.kind {
            FactKind::Delete => Ok(ReadView::Deleted),
            FactKind::Set => {
                let value = self.content.get_value(&head_fact.payload_ref).await?.ok_or_else(|| {
                    StrataError::Storage(format!("missing value row {}", head_fact.payload_ref))
                })?;
                Ok(ReadView::Value(value))
            }
            FactKind::Patch => Ok(ReadView::Value(
                self.materialize(branch, id, head_fact.seq).await?,
            )),
        }
    }

    /// Replay the patch run ending at `upto` on top of the nearest base.
    async fn materialize(&self, branch: &str, id: &EntityId, upto: Seq) -> Result<Value> {
        let pairs = self.branches.visible_pairs_at(branch, upto).await?;

        let (mut value, base_seq) = match self.nearest_snapshot(branch, id, upto).await? {
            Some(snap) => {
                let value = self.content.get_value(&snap.value_ref).await?.ok_or_else(|| {
                    StrataError::Storage(format!("missing snapshot value {}", snap.value_ref))
                })?;
                (value, snap.seq)
            }
            None => match self.facts.latest_base_visible(id, &pairs, upto).await? {
                Some(base) if base.kind == FactKind::Set => {
                    let value = self.content.get_value(&base.payload_ref).await?.ok_or_else(
                        || StrataError::Storage(format!("missing value row {}", base.payload_ref)),
                    )?;
                    (value, base.seq)
                }
                // A tombstone base or no base at all replays from nothing.
                Some(base) => (Value::Object(serde_json::Map::new()), base.seq),
                None => (Value::Object(serde_json::Map::new()), 0),
            },
        };

        let patches = self.facts.visible_patches(id, &pairs, base_seq, upto).await?;
        for patch in patches {
            let ops_value = self.content.get_value(&patch.payload_ref).await?.ok_or_else(|| {
                StrataError::Storage(format!("missing ops row {}", patch.payload_ref))
            })?;
            let ops: Vec<PatchOp> = serde_json::from_value(ops_value)?;
            value = apply_patches(value, &ops).map_err(StrataError::Patch)?;
        }
        Ok(value)
    }

    /// The most recent snapshot for `(branch, id)` with `seq <= at`.
    pub async fn nearest_snapshot(
        &self,
        branch: &str,
        id: &EntityId,
        at: Seq,
    ) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            "SELECT seq, value_ref FROM snapshot WHERE branch = ? AND id = ? AND seq <= ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(branch)
        .bind(id.as_str())
        .bind(seq_to_db(at))
        .fetch_optional(self.db.pool())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value_ref: String = row.get("value_ref");
        Ok(Some(SnapshotRecord {
            branch: branch.to_string(),
            id: id.clone(),
            seq: row.get::<i64, _>("seq") as Seq,
            value_ref: Reference::parse(&value_ref)?,
        }))
    }

    /// Cut a snapshot if enough patch facts accumulated since the last one.
    ///
    /// Best-effort: callers run this after the commit transaction and a
    /// failure must never roll the commit back — it is logged and the next
    /// commit retries naturally.
    pub async fn maybe_snapshot(&self, branch: &str, id: &EntityId) -> Result<bool> {
        let last = self
            .nearest_snapshot(branch, id, Seq::MAX)
            .await?
            .map(|s| s.seq)
            .unwrap_or(0);
        let pending = self.facts.patch_count_since(id, branch, last).await?;
        if pending < self.db.config().snapshot_interval {
            return Ok(false);
        }

        let Some(head) = self.heads.resolve(branch, id).await? else {
            return Ok(false);
        };
        let ReadView::Value(value) = self.read_current(branch, id).await? else {
            return Ok(false);
        };
        let value_ref = self.content.put_value(&value).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO snapshot (branch, id, seq, value_ref) VALUES (?, ?, ?, ?)",
        )
        .bind(branch)
        .bind(id.as_str())
        .bind(seq_to_db(head.seq))
        .bind(value_ref.as_str())
        .execute(self.db.pool())
        .await?;
        debug!(branch, id = %id, seq = head.seq, "snapshot created");
        Ok(true)
    }

    /// [`maybe_snapshot`](Self::maybe_snapshot) with failures demoted to a
    /// warning, for use on the post-commit path.
    pub async fn maybe_snapshot_best_effort(&self, branch: &str, id: &EntityId) {
        if let Err(error) = self.maybe_snapshot(branch, id).await {
            warn!(branch, id = %id, %error, "snapshot creation failed; will retry after next commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceConfig;
    use crate::testutil;
    use serde_json::json;
    use strata_types::DEFAULT_BRANCH;

    fn replace_n(k: i64) -> Value {
        json!([{"op": "replace", "path": "/n", "value": k}])
    }

    async fn space() -> (SpaceDb, SnapshotEngine) {
        let db = SpaceDb::in_memory(SpaceConfig::default()).await.unwrap();
        let engine = SnapshotEngine::new(db.clone());
        (db, engine)
    }

    #[tokio::test]
    async fn set_then_read() {
        let (db, engine) = space().await;
        testutil::commit_set(&db, DEFAULT_BRANCH, "c", json!({"n": 0}), 1).await;
        assert_eq!(
            engine.read_current(DEFAULT_BRANCH, &"c".into()).await.unwrap(),
            ReadView::Value(json!({"n": 0}))
        );
    }

    #[tokio::test]
    async fn patch_replay_with_and_without_snapshot() {
        let (db, engine) = space().await;
        testutil::commit_set(&db, DEFAULT_BRANCH, "c", json!({"n": 0}), 1).await;
        for k in 1..=11i64 {
            testutil::commit_patch(&db, DEFAULT_BRANCH, "c", replace_n(k), 1 + k as Seq).await;
        }

        // Pure replay, no snapshot yet.
        let before = engine.read_current(DEFAULT_BRANCH, &"c".into()).await.unwrap();
        assert_eq!(before, ReadView::Value(json!({"n": 11})));

        // Threshold of 10 patches reached, snapshot lands at the head seq.
        assert!(engine.maybe_snapshot(DEFAULT_BRANCH, &"c".into()).await.unwrap());
        let snap = engine
            .nearest_snapshot(DEFAULT_BRANCH, &"c".into(), Seq::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.seq, 12);

        // Snapshots are transparent to reads.
        let after = engine.read_current(DEFAULT_BRANCH, &"c".into()).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn point_in_time_read() {
        let (db, engine) = space().await;
        testutil::commit_set(&db, DEFAULT_BRANCH, "c", json!({"n": 0}), 1).await;
        for k in 1..=11i64 {
            testutil::commit_patch(&db, DEFAULT_BRANCH, "c", replace_n(k), 1 + k as Seq).await;
        }
        // At seq 7 the last applied patch was k = 6.
        assert_eq!(
            engine.read_at(DEFAULT_BRANCH, &"c".into(), 7).await.unwrap(),
            ReadView::Value(json!({"n": 6}))
        );
        // Before the entity existed.
        assert_eq!(
            engine.read_at(DEFAULT_BRANCH, &"c".into(), 0).await.unwrap(),
            ReadView::Absent
        );
    }

    #[tokio::test]
    async fn deleted_reads_as_deleted_and_patches_restart_empty() {
        let (db, engine) = space().await;
        testutil::commit_set(&db, DEFAULT_BRANCH, "c", json!({"n": 1}), 1).await;
        testutil::commit_delete(&db, DEFAULT_BRANCH, "c", 2).await;
        assert_eq!(
            engine.read_current(DEFAULT_BRANCH, &"c".into()).await.unwrap(),
            ReadView::Deleted
        );

        // A patch after a tombstone replays from the empty object.
        testutil::commit_patch(
            &db,
            DEFAULT_BRANCH,
            "c",
            json!([{"op": "add", "path": "/n", "value": 7}]),
            3,
        )
        .await;
        assert_eq!(
            engine.read_current(DEFAULT_BRANCH, &"c".into()).await.unwrap(),
            ReadView::Value(json!({"n": 7}))
        );
    }

    #[tokio::test]
    async fn branch_isolation_of_reads() {
        let (db, engine) = space().await;
        testutil::commit_set(&db, DEFAULT_BRANCH, "e", json!({"k": "v0"}), 1).await;
        testutil::fork(&db, "draft", DEFAULT_BRANCH, 1).await;
        testutil::commit_set(&db, "draft", "e", json!({"k": "v1"}), 2).await;

        assert_eq!(
            engine.read_current("draft", &"e".into()).await.unwrap(),
            ReadView::Value(json!({"k": "v1"}))
        );
        // The parent still sees its own value.
        assert_eq!(
            engine.read_current(DEFAULT_BRANCH, &"e".into()).await.unwrap(),
            ReadView::Value(json!({"k": "v0"}))
        );
    }

    #[tokio::test]
    async fn compaction_preserves_reads() {
        let (db, engine) = space().await;
        let facts = FactLog::new(db.clone());
        testutil::commit_set(&db, DEFAULT_BRANCH, "c", json!({"n": 0}), 1).await;
        for k in 1..=11i64 {
            testutil::commit_patch(&db, DEFAULT_BRANCH, "c", replace_n(k), 1 + k as Seq).await;
        }
        engine.maybe_snapshot(DEFAULT_BRANCH, &"c".into()).await.unwrap();

        // Reference-safe compaction: facts still chained to the head stay.
        facts.compact(&"c".into(), 6).await.unwrap();
        assert_eq!(
            engine.read_current(DEFAULT_BRANCH, &"c".into()).await.unwrap(),
            ReadView::Value(json!({"n": 11}))
        );
        assert_eq!(
            engine.read_at(DEFAULT_BRANCH, &"c".into(), 7).await.unwrap(),
            ReadView::Value(json!({"n": 6}))
        );
    }
}
