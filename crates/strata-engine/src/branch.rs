//! Branch lifecycle.
//!
//! Creation is O(1): a single branch row with a fork point, no head copying
//! (resolution falls back lazily). Deletion is soft and the name stays
//! consumed. Merge compares each source-changed entity three ways — source
//! head, target head, common ancestor — and commits an ordinary commit on
//! the target that fast-forwards the non-conflicted entities; conflict
//! granularity is the entity.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use strata_store::snapshots::ReadView;
use strata_types::{
    BranchConflict, BranchRecord, ClientCommit, CommitRecord, ConfirmedRead, EntityId, ReadSet,
    Seq, StrataError, UserOp, DEFAULT_BRANCH,
};

use crate::space::Space;
use crate::storage_error;

/// Entity-level difference between two branches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchDiff {
    /// Present on source, absent or deleted on target.
    pub added: Vec<EntityId>,
    /// Deleted on source, present on target.
    pub removed: Vec<EntityId>,
    /// Present on both with different heads.
    pub modified: Vec<EntityId>,
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The merge commit, `None` when there was nothing to carry over.
    pub commit: Option<CommitRecord>,
    /// Entities the merge moved onto the target.
    pub merged: Vec<EntityId>,
}

impl Space {
    /// Fork a new branch off `from` at `at_seq` (default: the parent head).
    pub async fn create_branch(
        &self,
        name: &str,
        from: &str,
        at_seq: Option<Seq>,
    ) -> Result<BranchRecord, StrataError> {
        if name.is_empty() {
            return Err(StrataError::NameTaken(name.to_string()));
        }
        // Serialize against other branch ops and commits.
        let _writer = self.writer.lock().await;

        if self.branches.get(name).await.map_err(storage_error)?.is_some() {
            // Soft-deleted rows hold their name forever.
            return Err(StrataError::NameTaken(name.to_string()));
        }
        let parent = self.branches.get_live(from).await.map_err(storage_error)?;
        let depth = self
            .branches
            .lineage(from)
            .await
            .map_err(storage_error)?
            .len();
        let cap = self.config().branch_depth_cap;
        if depth + 1 > cap {
            return Err(StrataError::BranchDepthExceeded { cap });
        }
        let fork_seq = match at_seq {
            Some(seq) if seq > parent.head_seq => {
                return Err(StrataError::SeqOutOfRange {
                    requested: seq,
                    head: parent.head_seq,
                })
            }
            Some(seq) => seq,
            None => parent.head_seq,
        };

        let record = BranchRecord {
            name: name.to_string(),
            parent: Some(from.to_string()),
            fork_seq,
            head_seq: fork_seq,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.branches.insert(&record).await.map_err(storage_error)?;
        info!(branch = name, from, fork_seq, "branch created");
        Ok(record)
    }

    /// Soft-delete a branch: heads and snapshots go, facts stay shared.
    pub async fn delete_branch(&self, name: &str) -> Result<(), StrataError> {
        if name == DEFAULT_BRANCH {
            return Err(StrataError::DefaultBranchProtected);
        }
        let _writer = self.writer.lock().await;
        self.branches.get_live(name).await.map_err(storage_error)?;
        self.branches
            .soft_delete(name, Utc::now())
            .await
            .map_err(storage_error)?;
        info!(branch = name, "branch deleted");
        Ok(())
    }

    /// List branches, optionally including soft-deleted rows.
    pub async fn list_branches(
        &self,
        include_deleted: bool,
    ) -> Result<Vec<BranchRecord>, StrataError> {
        self.branches
            .list(include_deleted)
            .await
            .map_err(storage_error)
    }

    /// Entity-level diff of source against target.
    pub async fn diff_branches(
        &self,
        source: &str,
        target: &str,
    ) -> Result<BranchDiff, StrataError> {
        let src_branch = self.branches.get_live(source).await.map_err(storage_error)?;
        self.branches.get_live(target).await.map_err(storage_error)?;

        let mut diff = BranchDiff::default();
        let changed = self
            .facts
            .entities_changed_on(source, src_branch.fork_seq)
            .await
            .map_err(storage_error)?;
        for id in changed {
            let src = self.heads.resolve(source, &id).await.map_err(storage_error)?;
            let tgt = self.heads.resolve(target, &id).await.map_err(storage_error)?;
            if src.as_ref().map(|h| &h.fact_hash) == tgt.as_ref().map(|h| &h.fact_hash) {
                continue;
            }
            let src_view = self
                .snapshots
                .read_current(source, &id)
                .await
                .map_err(storage_error)?;
            let tgt_view = self
                .snapshots
                .read_current(target, &id)
                .await
                .map_err(storage_error)?;
            match (&src_view, &tgt_view) {
                (ReadView::Value(_), ReadView::Value(_)) => diff.modified.push(id),
                (ReadView::Value(_), _) => diff.added.push(id),
                (ReadView::Deleted, ReadView::Value(_)) => diff.removed.push(id),
                _ => {}
            }
        }
        Ok(diff)
    }

    /// Merge `source` into `target`.
    ///
    /// For every entity changed on the source since its fork point:
    /// target-unchanged entities fast-forward to the source state; entities
    /// changed on both sides conflict unless a resolution value is supplied.
    /// The merge lands as one ordinary commit on the target.
    pub async fn merge_branches(
        &self,
        source: &str,
        target: &str,
        resolutions: Option<&HashMap<EntityId, Value>>,
    ) -> Result<MergeOutcome, StrataError> {
        let src_branch = self.branches.get_live(source).await.map_err(storage_error)?;
        self.branches.get_live(target).await.map_err(storage_error)?;
        let fork_seq = src_branch.fork_seq;

        let mut operations = Vec::new();
        let mut reads = Vec::new();
        let mut merged = Vec::new();
        let mut conflicts = Vec::new();

        let changed = self
            .facts
            .entities_changed_on(source, fork_seq)
            .await
            .map_err(storage_error)?;
        let ancestor_pairs = self
            .branches
            .visible_pairs_at(target, fork_seq)
            .await
            .map_err(storage_error)?;

        for id in changed {
            let src = self.heads.resolve(source, &id).await.map_err(storage_error)?;
            let tgt = self.heads.resolve(target, &id).await.map_err(storage_error)?;
            let anc = self
                .facts
                .latest_visible(&id, &ancestor_pairs)
                .await
                .map_err(storage_error)?;

            let src_hash = src.as_ref().map(|h| h.fact_hash.clone());
            let tgt_hash = tgt.as_ref().map(|h| h.fact_hash.clone());
            let anc_hash = anc.as_ref().map(|f| f.hash.clone());

            if src_hash == tgt_hash {
                continue; // already identical on both sides
            }
            if tgt_hash == anc_hash {
                // Target untouched since the fork: fast-forward.
                let op = match self
                    .snapshots
                    .read_current(source, &id)
                    .await
                    .map_err(storage_error)?
                {
                    ReadView::Value(value) => UserOp::Set { id: id.clone(), value },
                    ReadView::Deleted => UserOp::Delete { id: id.clone() },
                    ReadView::Absent => continue,
                };
                reads.push(ConfirmedRead {
                    id: id.clone(),
                    seq: tgt.as_ref().map(|h| h.seq).unwrap_or(0),
                });
                operations.push(op);
                merged.push(id);
            } else if src_hash == anc_hash {
                // Only the target moved; nothing to merge for this entity.
            } else if let Some(value) = resolutions.and_then(|r| r.get(&id)) {
                reads.push(ConfirmedRead {
                    id: id.clone(),
                    seq: tgt.as_ref().map(|h| h.seq).unwrap_or(0),
                });
                operations.push(UserOp::Set {
                    id: id.clone(),
                    value: value.clone(),
                });
                merged.push(id);
            } else {
                conflicts.push(BranchConflict {
                    id: id.clone(),
                    source: self
                        .snapshots
                        .read_current(source, &id)
                        .await
                        .map_err(storage_error)?
                        .value(),
                    target: self
                        .snapshots
                        .read_current(target, &id)
                        .await
                        .map_err(storage_error)?
                        .value(),
                    ancestor: self
                        .snapshots
                        .read_at(target, &id, fork_seq)
                        .await
                        .map_err(storage_error)?
                        .value(),
                });
            }
        }

        if !conflicts.is_empty() {
            return Err(StrataError::MergeConflict { conflicts });
        }
        if operations.is_empty() {
            return Ok(MergeOutcome {
                commit: None,
                merged,
            });
        }

        let changes = self
            .transact(
                ClientCommit {
                    reads: ReadSet {
                        confirmed: reads,
                        pending: Vec::new(),
                    },
                    operations,
                    branch: Some(target.to_string()),
                },
                None,
            )
            .await?;
        info!(source, target, entities = merged.len(), seq = changes.commit.seq, "branches merged");
        Ok(MergeOutcome {
            commit: Some(changes.commit),
            merged,
        })
    }
}
