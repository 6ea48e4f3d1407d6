//! The confirmed/pending session state machine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use strata_types::{
    patch::apply_patches, ClientCommit, ConfirmedRead, EntityId, LocalSeq, PendingRead, ReadSet,
    Seq, StrataError, UserOp,
};

use crate::{ChangeListener, EntityChange, EntityState, Notification, RemoteChange};

/// Where a read resolved from, for read-set construction.
enum ReadSource {
    Confirmed(Seq),
    Pending(LocalSeq),
}

#[derive(Debug, Clone)]
struct ConfirmedEntry {
    seq: Seq,
    state: EntityState,
}

struct PendingCommit {
    local_seq: LocalSeq,
    payload: ClientCommit,
    /// Final per-entity state this commit established locally.
    after: HashMap<EntityId, EntityState>,
    resolver: Option<oneshot::Sender<Result<Seq, StrataError>>>,
}

/// Handle to one submitted commit.
///
/// Carries the wire payload for the transport and resolves once the server
/// responds.
pub struct CommitHandle {
    /// Session-local index of the pending commit.
    pub local_seq: LocalSeq,
    /// The payload to submit to the commit engine.
    pub payload: ClientCommit,
    receiver: oneshot::Receiver<Result<Seq, StrataError>>,
}

impl std::fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHandle")
            .field("local_seq", &self.local_seq)
            .field("payload", &self.payload)
            .finish()
    }
}

impl CommitHandle {
    /// Wait for the server's verdict: the assigned seq, or the rejection.
    pub async fn resolved(self) -> Result<Seq, StrataError> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(StrataError::Storage("session closed before resolution".into())))
    }
}

/// One client session against one Space branch.
pub struct SpaceSession {
    branch: Option<String>,
    confirmed: HashMap<EntityId, ConfirmedEntry>,
    pending: VecDeque<PendingCommit>,
    next_local_seq: LocalSeq,
    listener: Arc<dyn ChangeListener>,
    /// Integrations held back while their entity is in pending state,
    /// newest seq per entity.
    deferred: HashMap<EntityId, RemoteChange>,
}

impl SpaceSession {
    /// Create a session on the default branch.
    pub fn new(listener: Arc<dyn ChangeListener>) -> Self {
        Self::on_branch(None, listener)
    }

    /// Create a session targeting a specific branch.
    pub fn on_branch(branch: Option<String>, listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            branch,
            confirmed: HashMap::new(),
            pending: VecDeque::new(),
            next_local_seq: 1,
            listener,
            deferred: HashMap::new(),
        }
    }

    /// Number of commits awaiting the server.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The confirmed-tier state of an entity, ignoring pending overlays.
    pub fn confirmed_state(&self, id: &EntityId) -> EntityState {
        self.confirmed
            .get(id)
            .map(|e| e.state.clone())
            .unwrap_or(EntityState::Absent)
    }

    /// Read an entity pending-first.
    ///
    /// The newest pending value wins over the confirmed tier; this is what
    /// makes stacked commits read their predecessors' writes instead of
    /// tripping over stale confirmed seqs.
    pub fn read(&self, id: &EntityId) -> EntityState {
        for commit in self.pending.iter().rev() {
            if let Some(state) = commit.after.get(id) {
                return state.clone();
            }
        }
        self.confirmed_state(id)
    }

    fn read_with_source(&self, id: &EntityId) -> (EntityState, ReadSource) {
        for commit in self.pending.iter().rev() {
            if let Some(state) = commit.after.get(id) {
                return (state.clone(), ReadSource::Pending(commit.local_seq));
            }
        }
        let entry = self.confirmed.get(id);
        (
            entry.map(|e| e.state.clone()).unwrap_or(EntityState::Absent),
            ReadSource::Confirmed(entry.map(|e| e.seq).unwrap_or(0)),
        )
    }

    //─────────────────────────────
    //  Write path (synchronous)
    //─────────────────────────────

    /// Apply `operations` optimistically and enqueue them for the server.
    ///
    /// Everything up to and including the `commit` notification happens
    /// before this returns; the handle resolves when the transport feeds
    /// back the server's verdict. A patch that fails locally aborts the
    /// whole commit with no state change.
    pub fn commit(&mut self, operations: Vec<UserOp>) -> Result<CommitHandle, StrataError> {
        let mut reads = ReadSet::empty();
        let mut seen_reads: HashSet<EntityId> = HashSet::new();
        let mut after: HashMap<EntityId, EntityState> = HashMap::new();
        let mut before: Vec<(EntityId, EntityState)> = Vec::new();

        for op in &operations {
            let id = op.id().clone();
            // Every op reads its entity: writes read to diff, claims read
            // by definition. Record the resolution source once per entity.
            if seen_reads.insert(id.clone()) {
                let (state, source) = self.read_with_source(&id);
                match source {
                    ReadSource::Pending(local_seq) => reads.pending.push(PendingRead {
                        id: id.clone(),
                        local_seq,
                    }),
                    ReadSource::Confirmed(seq) => reads.confirmed.push(ConfirmedRead {
                        id: id.clone(),
                        seq,
                    }),
                }
                if op.writes_fact() {
                    before.push((id.clone(), state));
                }
            } else if op.writes_fact() && !after.contains_key(&id) {
                before.push((id.clone(), self.read(&id)));
            }

            let current = after
                .get(&id)
                .cloned()
                .unwrap_or_else(|| self.read(&id));
            match op {
                UserOp::Set { value, .. } => {
                    after.insert(id, EntityState::Value(value.clone()));
                }
                UserOp::Patch { patches, .. } => {
                    let base = match current {
                        EntityState::Value(v) => v,
                        EntityState::Absent | EntityState::Deleted => {
                            Value::Object(serde_json::Map::new())
                        }
                    };
                    let next = apply_patches(base, patches)?;
                    after.insert(id, EntityState::Value(next));
                }
                UserOp::Delete { .. } => {
                    after.insert(id, EntityState::Deleted);
                }
                UserOp::Claim { .. } => {}
            }
        }

        let local_seq = self.next_local_seq;
        self.next_local_seq += 1;
        let payload = ClientCommit {
            reads,
            operations,
            branch: self.branch.clone(),
        };
        let changes: Vec<EntityChange> = before
            .into_iter()
            .filter_map(|(id, before_state)| {
                after.get(&id).map(|after_state| EntityChange {
                    id: id.clone(),
                    before: before_state,
                    after: after_state.clone(),
                })
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingCommit {
            local_seq,
            payload: payload.clone(),
            after,
            resolver: Some(tx),
        });
        debug!(local_seq, pending = self.pending.len(), "commit applied locally");

        // Synchronous, same-frame: the scheduler hears about the write
        // before the caller gets the handle back.
        self.listener.notify(&Notification::Commit { local_seq, changes });

        Ok(CommitHandle {
            local_seq,
            payload,
            receiver: rx,
        })
    }

    //─────────────────────────────
    //  Async resolution
    //─────────────────────────────

    /// The server accepted the front pending commit at `server_seq`.
    ///
    /// Its entities promote into the confirmed tier; the `commit`
    /// notification already told the scheduler everything it needs.
    pub fn resolve_accept(
        &mut self,
        local_seq: LocalSeq,
        server_seq: Seq,
    ) -> Result<(), StrataError> {
        let front = self.pending.front().map(|c| c.local_seq);
        if front != Some(local_seq) {
            return Err(StrataError::InvariantBreach(format!(
                "out-of-order resolution: expected front {front:?}, got {local_seq}"
            )));
        }
        let mut commit = self
            .pending
            .pop_front()
            .ok_or_else(|| StrataError::InvariantBreach("empty pending queue".into()))?;
        for (id, state) in commit.after.drain() {
            self.confirmed.insert(id, ConfirmedEntry {
                seq: server_seq,
                state,
            });
        }
        if let Some(tx) = commit.resolver.take() {
            let _ = tx.send(Ok(server_seq));
        }
        self.flush_deferred();
        Ok(())
    }

    /// The server rejected the front pending commit.
    ///
    /// Fires its `revert` synchronously, then cascade-rejects every later
    /// pending commit that read from it, directly or transitively, each
    /// with its own `revert`, in queue order.
    pub fn resolve_reject(
        &mut self,
        local_seq: LocalSeq,
        error: StrataError,
    ) -> Result<(), StrataError> {
        let front = self.pending.front().map(|c| c.local_seq);
        if front != Some(local_seq) {
            return Err(StrataError::InvariantBreach(format!(
                "out-of-order resolution: expected front {front:?}, got {local_seq}"
            )));
        }
        self.reject_at(0, error);

        let mut rejected: HashSet<LocalSeq> = HashSet::new();
        rejected.insert(local_seq);
        loop {
            let next = self.pending.iter().position(|c| {
                c.payload
                    .reads
                    .pending
                    .iter()
                    .any(|r| rejected.contains(&r.local_seq))
            });
            let Some(index) = next else { break };
            let dependency = self.pending[index]
                .payload
                .reads
                .pending
                .iter()
                .find(|r| rejected.contains(&r.local_seq))
                .map(|r| r.local_seq)
                .unwrap_or(local_seq);
            rejected.insert(self.pending[index].local_seq);
            self.reject_at(index, StrataError::CascadedRejection {
                local_seq: dependency,
            });
        }
        self.flush_deferred();
        Ok(())
    }

    /// Remove the pending commit at `index`, firing its revert with the
    /// diffs between the visible state with and without it.
    fn reject_at(&mut self, index: usize, error: StrataError) {
        let ids: Vec<EntityId> = self.pending[index].after.keys().cloned().collect();
        let pre: HashMap<EntityId, EntityState> =
            ids.iter().map(|id| (id.clone(), self.read(id))).collect();

        let Some(mut commit) = self.pending.remove(index) else {
            return;
        };

        let mut changes: Vec<EntityChange> = Vec::new();
        for id in ids {
            let now = self.read(&id);
            let was = pre.get(&id).cloned().unwrap_or(EntityState::Absent);
            // Entities whose visible state did not move were superseded by
            // a later write or an earlier integrate: partial revert.
            if now != was {
                changes.push(EntityChange {
                    id,
                    before: was,
                    after: now,
                });
            }
        }
        debug!(local_seq = commit.local_seq, reverted = changes.len(), "pending commit rejected");

        // Revert fires before the promise resolves.
        self.listener.notify(&Notification::Revert {
            local_seq: commit.local_seq,
            changes,
        });
        if let Some(tx) = commit.resolver.take() {
            let _ = tx.send(Err(error));
        }
    }

    //─────────────────────────────
    //  External changes
    //─────────────────────────────

    /// Fold in changes another client committed.
    ///
    /// Entities this session currently has in pending state are deferred
    /// until their pending commit resolves; everything else updates the
    /// confirmed tier and fires one `integrate` notification.
    pub fn integrate(&mut self, changes: Vec<RemoteChange>) {
        let mut ready: Vec<EntityChange> = Vec::new();
        for change in changes {
            if self.pending.iter().any(|c| c.after.contains_key(&change.id)) {
                let newer = self
                    .deferred
                    .get(&change.id)
                    .map_or(true, |held| change.seq > held.seq);
                if newer {
                    self.deferred.insert(change.id.clone(), change);
                }
                continue;
            }
            if let Some(applied) = self.apply_remote(change) {
                ready.push(applied);
            }
        }
        if !ready.is_empty() {
            self.listener.notify(&Notification::Integrate { changes: ready });
        }
    }

    fn apply_remote(&mut self, change: RemoteChange) -> Option<EntityChange> {
        let entry = self.confirmed.get(&change.id);
        if entry.is_some_and(|e| change.seq <= e.seq) {
            return None; // stale replay
        }
        let before = self.confirmed_state(&change.id);
        self.confirmed.insert(change.id.clone(), ConfirmedEntry {
            seq: change.seq,
            state: change.state.clone(),
        });
        Some(EntityChange {
            id: change.id,
            before,
            after: change.state,
        })
    }

    /// Replay deferred integrations whose entities left pending state.
    fn flush_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let held: Vec<RemoteChange> = {
            let pending = &self.pending;
            let (ready, kept): (Vec<_>, Vec<_>) = self
                .deferred
                .drain()
                .partition(|(id, _)| !pending.iter().any(|c| c.after.contains_key(id)));
            self.deferred = kept.into_iter().collect();
            ready.into_iter().map(|(_, change)| change).collect()
        };
        if !held.is_empty() {
            self.integrate(held);
        }
    }
}
