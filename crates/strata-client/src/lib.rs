#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strata-client** – Client-side state machine for Strata.
//!
//! A [`SpaceSession`] keeps two tiers of entity state: **Confirmed**, what
//! the server has acknowledged, and **Pending**, an ordered queue of
//! optimistic commits awaiting the server's verdict. Reads are pending-first
//! so stacked commits compose; a rejection reverts its local effects and
//! cascade-rejects every later commit that depended on it. The session
//! fires its `commit` notification synchronously inside the caller's write
//! frame — the scheduler hears about a write before `commit` returns.
//!
//! The session is transport-agnostic: [`SpaceSession::commit`] hands back
//! the wire payload plus a resolution handle, and the transport feeds the
//! server's verdict into [`SpaceSession::resolve_accept`] /
//! [`SpaceSession::resolve_reject`] and remote changes into
//! [`SpaceSession::integrate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_types::{EntityId, LocalSeq, Seq};

mod session;

pub use session::{CommitHandle, SpaceSession};

//─────────────────────────────
//  Local entity state
//─────────────────────────────

/// Client-side view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityState {
    /// Never seen on this branch.
    Absent,
    /// Tombstoned.
    Deleted,
    /// Present with this value.
    Value(Value),
}

impl EntityState {
    /// The value, if present.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent | Self::Deleted => None,
        }
    }
}

//─────────────────────────────
//  Notifications
//─────────────────────────────

/// One entity's before/after transition inside a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    /// The entity that changed.
    pub id: EntityId,
    /// Visible state before the transition.
    pub before: EntityState,
    /// Visible state after the transition.
    pub after: EntityState,
}

/// What the session tells its scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A local commit was applied optimistically. Fired synchronously,
    /// before `commit()` returns.
    Commit {
        /// The pending commit's session-local index.
        local_seq: LocalSeq,
        /// Entity-level diffs of the local apply.
        changes: Vec<EntityChange>,
    },
    /// A pending commit was rejected; these diffs roll its effects back.
    /// Entities superseded by later writes are omitted (partial revert).
    Revert {
        /// The rejected commit's session-local index.
        local_seq: LocalSeq,
        /// Entity-level rollback diffs.
        changes: Vec<EntityChange>,
    },
    /// Another client changed entities this session is not writing.
    Integrate {
        /// Entity-level diffs of the incoming state.
        changes: Vec<EntityChange>,
    },
}

/// Synchronous sink for session notifications.
///
/// Implementations run inside the session's write frame and must not block.
pub trait ChangeListener: Send + Sync {
    /// Deliver one notification.
    fn notify(&self, note: &Notification);
}

/// Listener that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ChangeListener for NullListener {
    fn notify(&self, _note: &Notification) {}
}

//─────────────────────────────
//  Remote changes
//─────────────────────────────

/// One entity's server-side state, as resolved by the transport from a
/// subscription update.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// The changed entity.
    pub id: EntityId,
    /// Seq of the commit that produced the change.
    pub seq: Seq,
    /// The entity's state after that commit.
    pub state: EntityState,
}
