//! Space handles and the Space manager.
//!
//! One Space = one database file = one writer. The handle carries the
//! Lamport counter behind the per-Space write mutex; every commit, merge
//! included, runs under that lock. Sessions register here so pending-read
//! validation can map a session's `local_seq` to its server outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use sqlx::Row;
use tokio::sync::Mutex;
use tracing::info;

use strata_bus::SpaceBus;
use strata_store::branches::BranchStore;
use strata_store::content::ContentStore;
use strata_store::facts::FactLog;
use strata_store::heads::HeadIndex;
use strata_store::snapshots::{ReadView, SnapshotEngine};
use strata_store::{SpaceConfig, SpaceDb};
use strata_types::{EntityId, LocalSeq, Seq, SessionId, StrataError};

use crate::storage_error;

/// Server-side outcome of one pending client commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOutcome {
    /// Accepted and assigned this seq.
    Accepted(Seq),
    /// Rejected; dependents cascade.
    Rejected,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub outcomes: HashMap<LocalSeq, PendingOutcome>,
}

/// The Lamport counter, guarded by the Space write lock.
#[derive(Debug)]
pub(crate) struct Writer {
    pub last_seq: Seq,
}

/// Handle to one open Space.
pub struct Space {
    pub(crate) db: SpaceDb,
    pub(crate) bus: SpaceBus,
    pub(crate) content: ContentStore,
    pub(crate) facts: FactLog,
    pub(crate) heads: HeadIndex,
    pub(crate) branches: BranchStore,
    pub(crate) snapshots: SnapshotEngine,
    pub(crate) writer: Mutex<Writer>,
    pub(crate) sessions: StdMutex<HashMap<SessionId, SessionState>>,
    next_session: AtomicU64,
}

impl Space {
    /// Open or create the Space database at `path`.
    pub async fn open<P: AsRef<Path>>(path: P, config: SpaceConfig) -> Result<Self, StrataError> {
        let db = SpaceDb::open(path, config).await.map_err(storage_error)?;
        Self::from_db(db).await
    }

    /// Open an ephemeral in-memory Space.
    pub async fn in_memory(config: SpaceConfig) -> Result<Self, StrataError> {
        let db = SpaceDb::in_memory(config).await.map_err(storage_error)?;
        Self::from_db(db).await
    }

    async fn from_db(db: SpaceDb) -> Result<Self, StrataError> {
        let last_seq = Self::load_last_seq(&db).await?;
        let bus = SpaceBus::new(db.config().broadcast_buffer);
        Ok(Self {
            bus,
            content: ContentStore::new(db.clone()),
            facts: FactLog::new(db.clone()),
            heads: HeadIndex::new(db.clone()),
            branches: BranchStore::new(db.clone()),
            snapshots: SnapshotEngine::new(db.clone()),
            writer: Mutex::new(Writer { last_seq }),
            sessions: StdMutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            db,
        })
    }

    /// The counter resumes from the highest committed seq.
    async fn load_last_seq(db: &SpaceDb) -> Result<Seq, StrataError> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM commit_log")
            .fetch_one(db.pool())
            .await
            .map_err(|e| StrataError::Storage(e.to_string()))?;
        Ok(row.get::<i64, _>("seq") as Seq)
    }

    /// The Space's configuration.
    pub fn config(&self) -> &SpaceConfig {
        self.db.config()
    }

    /// The Space's change bus.
    pub fn bus(&self) -> &SpaceBus {
        &self.bus
    }

    /// The content-addressed value and blob store.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// The append-only fact log.
    pub fn facts(&self) -> &FactLog {
        &self.facts
    }

    /// The branch-scoped head index.
    pub fn heads(&self) -> &HeadIndex {
        &self.heads
    }

    /// Register a new client session and return its identifier.
    pub fn register_session(&self) -> SessionId {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        lock_sessions(&self.sessions).insert(session, SessionState::default());
        session
    }

    /// Drop a session's pending-commit bookkeeping.
    pub fn close_session(&self, session: SessionId) {
        lock_sessions(&self.sessions).remove(&session);
    }

    pub(crate) fn session_outcome(
        &self,
        session: SessionId,
        local_seq: LocalSeq,
    ) -> Option<PendingOutcome> {
        lock_sessions(&self.sessions)
            .get(&session)
            .and_then(|s| s.outcomes.get(&local_seq).copied())
    }

    pub(crate) fn record_outcome(
        &self,
        session: SessionId,
        local_seq: LocalSeq,
        outcome: PendingOutcome,
    ) {
        if let Some(state) = lock_sessions(&self.sessions).get_mut(&session) {
            state.outcomes.insert(local_seq, outcome);
        }
    }

    /// Read the current value of `(branch, id)`.
    pub async fn read_current(&self, branch: &str, id: &EntityId) -> Result<ReadView, StrataError> {
        self.branches.get_live(branch).await.map_err(storage_error)?;
        self.snapshots
            .read_current(branch, id)
            .await
            .map_err(storage_error)
    }

    /// Read the value of `(branch, id)` as of `seq`.
    pub async fn read_at(
        &self,
        branch: &str,
        id: &EntityId,
        seq: Seq,
    ) -> Result<ReadView, StrataError> {
        self.branches.get_live(branch).await.map_err(storage_error)?;
        self.snapshots
            .read_at(branch, id, seq)
            .await
            .map_err(storage_error)
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space").finish_non_exhaustive()
    }
}

//─────────────────────────────
//  Space manager
//─────────────────────────────

/// Opens Spaces on demand and caches live handles.
///
/// One database file per Space under the root directory, named after the
/// Space identifier.
pub struct SpaceManager {
    root: PathBuf,
    config: SpaceConfig,
    spaces: Mutex<HashMap<String, Arc<Space>>>,
}

impl SpaceManager {
    /// Create a manager rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P, config: SpaceConfig) -> Self {
        Self {
            root: root.into(),
            config,
            spaces: Mutex::new(HashMap::new()),
        }
    }

    /// Open-or-return the Space named `id`.
    pub async fn space(&self, id: &str) -> Result<Arc<Space>, StrataError> {
        if !valid_space_id(id) {
            return Err(StrataError::NotFound(format!("invalid space id {id:?}")));
        }
        let mut spaces = self.spaces.lock().await;
        if let Some(space) = spaces.get(id) {
            return Ok(Arc::clone(space));
        }
        let path = self.root.join(format!("{id}.sqlite"));
        let space = Arc::new(Space::open(&path, self.config.clone()).await?);
        info!(space = id, "space opened");
        spaces.insert(id.to_string(), Arc::clone(&space));
        Ok(space)
    }

    /// Close and evict the Space named `id`, if open.
    pub async fn close(&self, id: &str) {
        if let Some(space) = self.spaces.lock().await.remove(id) {
            space.db.close().await;
            info!(space = id, "space closed");
        }
    }
}

/// A poisoned registry only means another thread panicked mid-insert;
/// the map itself stays coherent, so recover it.
fn lock_sessions(
    sessions: &StdMutex<HashMap<SessionId, SessionState>>,
) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionState>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Space identifiers become file names; keep them to a safe alphabet.
fn valid_space_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' || b == b':')
        && !id.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manager_caches_handles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SpaceManager::new(dir.path(), SpaceConfig::default());

        let a = manager.space("tenant-1").await.unwrap();
        let b = manager.space("tenant-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        manager.close("tenant-1").await;
        let c = manager.space("tenant-1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn space_ids_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SpaceManager::new(dir.path(), SpaceConfig::default());
        assert!(manager.space("../escape").await.is_err());
        assert!(manager.space("").await.is_err());
        assert!(manager.space("did:key:z6Mk").await.is_ok());
    }

    #[tokio::test]
    async fn sessions_register_and_close() {
        let space = Space::in_memory(SpaceConfig::default()).await.unwrap();
        let s1 = space.register_session();
        let s2 = space.register_session();
        assert_ne!(s1, s2);

        space.record_outcome(s1, 1, PendingOutcome::Accepted(9));
        assert_eq!(space.session_outcome(s1, 1), Some(PendingOutcome::Accepted(9)));
        space.close_session(s1);
        assert_eq!(space.session_outcome(s1, 1), None);
    }
}
