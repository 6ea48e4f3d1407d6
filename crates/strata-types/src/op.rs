//! Client-facing operations and commit payloads.
//!
//! Operations are a closed tagged enum over the capability set
//! {apply-to-value, resolve-parent, contribute-to-fact-hash}; they carry no
//! `parent` — the commit engine resolves it at apply time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::patch::PatchOp;
use crate::{EntityId, LocalSeq, Seq};

//─────────────────────────────
//  User operations
//─────────────────────────────

/// One operation inside a client commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum UserOp {
    /// Establish a complete value for an entity.
    Set {
        /// Target entity.
        id: EntityId,
        /// New value (envelope-shaped).
        value: Value,
    },
    /// Apply patch operations to the entity's current value.
    Patch {
        /// Target entity.
        id: EntityId,
        /// Ordered patch operations.
        patches: Vec<PatchOp>,
    },
    /// Tombstone the entity.
    Delete {
        /// Target entity.
        id: EntityId,
    },
    /// Read-only assertion recorded in the read set; writes no fact.
    Claim {
        /// Asserted entity.
        id: EntityId,
    },
}

impl UserOp {
    /// The entity this operation targets.
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Set { id, .. }
            | Self::Patch { id, .. }
            | Self::Delete { id }
            | Self::Claim { id } => id,
        }
    }

    /// Whether the operation produces a fact when committed.
    pub fn writes_fact(&self) -> bool {
        !matches!(self, Self::Claim { .. })
    }
}

//─────────────────────────────
//  Read sets
//─────────────────────────────

/// A read observed against server-confirmed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedRead {
    /// Entity that was read.
    pub id: EntityId,
    /// Seq the entity was observed at; `0` means never-existed.
    pub seq: Seq,
}

/// A read that resolved from a not-yet-confirmed pending commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRead {
    /// Entity that was read.
    pub id: EntityId,
    /// The pending commit the value came from.
    pub local_seq: LocalSeq,
}

/// The full read set a commit was built against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadSet {
    /// Reads satisfied by confirmed state.
    pub confirmed: Vec<ConfirmedRead>,
    /// Reads satisfied by earlier pending commits of the same session.
    pub pending: Vec<PendingRead>,
}

impl ReadSet {
    /// A read set with no entries (blind write).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the set records no reads at all.
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.pending.is_empty()
    }
}

//─────────────────────────────
//  Client commit envelope
//─────────────────────────────

/// The payload a client submits to the commit engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCommit {
    /// Reads the operations were computed from.
    #[serde(default)]
    pub reads: ReadSet,
    /// Operations to apply atomically.
    pub operations: Vec<UserOp>,
    /// Target branch; `None` means the default branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl ClientCommit {
    /// Branch the commit targets, defaulting to the default branch.
    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or(crate::DEFAULT_BRANCH)
    }
}
