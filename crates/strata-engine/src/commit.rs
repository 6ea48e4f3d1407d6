//! The commit pipeline.
//!
//! One commit = one database transaction. Validation happens against the
//! last committed state under the Space write lock; nothing is written until
//! every read checks out and every patch applies. Post-commit side effects
//! (snapshot triggers, bus fan-out) run after the transaction commits and
//! never roll it back.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use strata_bus::{ChangeBus, ChangeSet};
use strata_store::branches::BranchStore;
use strata_store::content::ContentStore;
use strata_store::facts::FactLog;
use strata_store::heads::HeadIndex;
use strata_store::snapshots::ReadView;
use strata_types::{
    patch::apply_patches, reference::HashPayload, ClientCommit, CommitRecord, ConfirmedRead,
    EntityConflict, EntityId, Fact, FactKind, Head, LocalSeq, Reference, Seq, SessionId,
    StrataError, UserOp,
};

use crate::space::{PendingOutcome, Space, Writer};
use crate::storage_error;

/// Identifies the client commit a `transact` call carries, so the engine
/// can resolve later pending reads against its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOrigin {
    /// The submitting session.
    pub session: SessionId,
    /// The session-local index of this commit.
    pub local_seq: LocalSeq,
}

/// A fact planned during op processing, before seq assignment.
struct PlannedFact {
    id: EntityId,
    kind: FactKind,
    payload_ref: Reference,
    payload_value: Option<Value>,
    parent: Option<Reference>,
    hash: Reference,
}

impl Space {
    /// Validate and apply one client commit.
    ///
    /// On success the returned [`ChangeSet`] is exactly what was fanned out
    /// on the Space bus. Any error means nothing was applied; if `origin` is
    /// given, the outcome is recorded either way so dependent pending reads
    /// resolve or cascade.
    pub async fn transact(
        &self,
        commit: ClientCommit,
        origin: Option<CommitOrigin>,
    ) -> Result<ChangeSet, StrataError> {
        let branch_name = commit.branch().to_string();
        self.branches
            .get_live(&branch_name)
            .await
            .map_err(storage_error)?;

        let mut writer = self.writer.lock().await;
        let result = self.apply_locked(&mut writer, &branch_name, &commit, origin).await;
        if let Some(origin) = origin {
            let outcome = match &result {
                Ok(changes) => PendingOutcome::Accepted(changes.commit.seq),
                Err(_) => PendingOutcome::Rejected,
            };
            self.record_outcome(origin.session, origin.local_seq, outcome);
        }
        result
    }

    async fn apply_locked(
        &self,
        writer: &mut Writer,
        branch: &str,
        commit: &ClientCommit,
        origin: Option<CommitOrigin>,
    ) -> Result<ChangeSet, StrataError> {
        // 1. Confirmed reads: stale iff the head moved past the observed seq.
        let mut conflicts = Vec::new();
        for read in &commit.reads.confirmed {
            self.check_read(branch, &read.id, read.seq, &mut conflicts).await?;
        }

        // 2. Pending reads resolve through the session's recorded outcomes.
        //    A rejected or unknown dependency cascades; submission order
        //    guarantees a well-formed client never sees "unknown" here.
        for read in &commit.reads.pending {
            let outcome = origin
                .and_then(|o| self.session_outcome(o.session, read.local_seq));
            match outcome {
                Some(PendingOutcome::Accepted(seq)) => {
                    self.check_read(branch, &read.id, seq, &mut conflicts).await?;
                }
                Some(PendingOutcome::Rejected) | None => {
                    return Err(StrataError::CascadedRejection {
                        local_seq: read.local_seq,
                    });
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(StrataError::Conflict { conflicts });
        }

        // 3. All facts of this commit share the next counter value.
        let seq = writer.last_seq + 1;

        // 4–5. Resolve parents and build facts, threading per-entity chains
        // and views so several ops on one entity compose within the commit.
        let mut parents: HashMap<EntityId, Option<Reference>> = HashMap::new();
        let mut views: HashMap<EntityId, ReadView> = HashMap::new();
        let mut planned: Vec<PlannedFact> = Vec::new();
        let mut claimed: Vec<ConfirmedRead> = Vec::new();

        for op in &commit.operations {
            let id = op.id().clone();
            if !parents.contains_key(&id) {
                let head = self
                    .heads
                    .resolve(branch, &id)
                    .await
                    .map_err(storage_error)?;
                parents.insert(id.clone(), head.map(|h| h.fact_hash));
            }
            match op {
                UserOp::Set { value, .. } => {
                    let payload_ref = Reference::of(value);
                    self.plan(&mut planned, &mut parents, id.clone(), FactKind::Set, payload_ref, Some(value.clone()));
                    views.insert(id, ReadView::Value(value.clone()));
                }
                UserOp::Patch { patches, .. } => {
                    let base = match views.get(&id) {
                        Some(view) => view.clone(),
                        None => self
                            .snapshots
                            .read_current(branch, &id)
                            .await
                            .map_err(storage_error)?,
                    };
                    let base_value = base
                        .value()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                    let next = apply_patches(base_value, patches).map_err(StrataError::Patch)?;
                    let ops_value =
                        serde_json::to_value(patches).map_err(|e| StrataError::Storage(e.to_string()))?;
                    let payload_ref = Reference::of(&ops_value);
                    self.plan(&mut planned, &mut parents, id.clone(), FactKind::Patch, payload_ref, Some(ops_value));
                    views.insert(id, ReadView::Value(next));
                }
                UserOp::Delete { .. } => {
                    self.plan(&mut planned, &mut parents, id.clone(), FactKind::Delete, Reference::empty(), None);
                    views.insert(id, ReadView::Deleted);
                }
                UserOp::Claim { .. } => {
                    let observed = self
                        .heads
                        .resolve(branch, &id)
                        .await
                        .map_err(storage_error)?
                        .map(|h| h.seq)
                        .unwrap_or(0);
                    claimed.push(ConfirmedRead { id, seq: observed });
                }
            }
        }

        // 6. The commit hash covers the logical content.
        let mut recorded_reads = commit.reads.clone();
        recorded_reads.confirmed.extend(claimed);
        let reads_value =
            serde_json::to_value(&recorded_reads).map_err(|e| StrataError::Storage(e.to_string()))?;
        let fact_hashes = Value::Array(
            planned
                .iter()
                .map(|p| Value::String(p.hash.as_str().to_string()))
                .collect(),
        );
        let commit_hash = HashPayload::new()
            .field("branch", branch)
            .field("seq", seq)
            .field("facts", fact_hashes)
            .field("reads", reads_value.clone())
            .reference();
        let record = CommitRecord {
            hash: commit_hash.clone(),
            seq,
            branch: branch.to_string(),
            reads: recorded_reads,
            created_at: Utc::now(),
        };

        // 5–7. One database transaction; any failure rolls everything back.
        let mut facts: Vec<Fact> = Vec::with_capacity(planned.len());
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StrataError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO commit_log (hash, seq, branch, reads, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(commit_hash.as_str())
        .bind(seq as i64)
        .bind(branch)
        .bind(reads_value.to_string())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StrataError::Storage(e.to_string()))?;

        let mut final_heads: HashMap<EntityId, Reference> = HashMap::new();
        for p in planned {
            if let Some(value) = &p.payload_value {
                ContentStore::put_value_in(&mut *tx, value)
                    .await
                    .map_err(storage_error)?;
            }
            let fact = Fact {
                hash: p.hash.clone(),
                id: p.id.clone(),
                kind: p.kind,
                payload_ref: p.payload_ref,
                parent: p.parent,
                seq,
                commit_ref: commit_hash.clone(),
                branch: branch.to_string(),
            };
            FactLog::append(&mut *tx, &fact)
                .await
                .map_err(storage_error)?;
            final_heads.insert(p.id, p.hash);
            facts.push(fact);
        }
        for (id, fact_hash) in &final_heads {
            HeadIndex::upsert(
                &mut *tx,
                branch,
                id,
                &Head {
                    fact_hash: fact_hash.clone(),
                    seq,
                },
            )
            .await
            .map_err(storage_error)?;
        }
        BranchStore::bump_head_seq(&mut *tx, branch, seq)
            .await
            .map_err(storage_error)?;
        tx.commit()
            .await
            .map_err(|e| StrataError::Storage(e.to_string()))?;
        writer.last_seq = seq;
        debug!(branch, seq, facts = facts.len(), "commit applied");

        // 8. Post-commit: best-effort snapshots, then fan-out. Publishing
        // under the write lock keeps the bus in seq order.
        for id in final_heads.keys() {
            self.snapshots.maybe_snapshot_best_effort(branch, id).await;
        }
        let changes = ChangeSet {
            commit: record,
            facts,
            origin: origin.map(|o| o.session),
        };
        let _ = self.bus.publish(&changes);
        Ok(changes)
    }

    /// Plan one fact: chain it onto the entity's parent pointer.
    fn plan(
        &self,
        planned: &mut Vec<PlannedFact>,
        parents: &mut HashMap<EntityId, Option<Reference>>,
        id: EntityId,
        kind: FactKind,
        payload_ref: Reference,
        payload_value: Option<Value>,
    ) {
        let parent = parents.get(&id).cloned().flatten();
        let hash = Fact::content_hash(kind, &id, &payload_ref, parent.as_ref());
        parents.insert(id.clone(), Some(hash.clone()));
        planned.push(PlannedFact {
            id,
            kind,
            payload_ref,
            payload_value,
            parent,
            hash,
        });
    }

    /// Shared staleness check for confirmed reads and resolved pending reads.
    async fn check_read(
        &self,
        branch: &str,
        id: &EntityId,
        observed_seq: Seq,
        conflicts: &mut Vec<EntityConflict>,
    ) -> Result<(), StrataError> {
        let head = self.heads.resolve(branch, id).await.map_err(storage_error)?;
        let stale = match &head {
            Some(h) => observed_seq < h.seq,
            None => observed_seq != 0,
        };
        if stale {
            // Ship the current value with the conflict to save a round-trip.
            let actual_value = self
                .snapshots
                .read_current(branch, id)
                .await
                .map_err(storage_error)?
                .value();
            conflicts.push(EntityConflict {
                id: id.clone(),
                expected_seq: observed_seq,
                actual_seq: head.map(|h| h.seq).unwrap_or(0),
                actual_value,
            });
        }
        Ok(())
    }
}
