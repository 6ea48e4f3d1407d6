//! Typed error taxonomy.
//!
//! Five classes per the error handling design: validation errors surface as
//! [`StrataError::Conflict`] / [`StrataError::CascadedRejection`]; integrity
//! and contention failures as [`StrataError::Storage`]; resource-limit
//! rejections as their own typed variants; invariant breaches as
//! [`StrataError::InvariantBreach`], which callers treat as non-recoverable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EntityId, LocalSeq, Seq};

//─────────────────────────────
//  Conflict payloads
//─────────────────────────────

/// Per-entity detail of a failed read validation.
///
/// `actual_value` is optional and exists to save the client a refresh
/// round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConflict {
    /// Entity whose read went stale.
    pub id: EntityId,
    /// Seq the client claimed to have observed.
    pub expected_seq: Seq,
    /// Seq of the entity's actual head.
    pub actual_seq: Seq,
    /// Current value at the actual head, if the engine chose to attach it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<Value>,
}

/// Per-entity detail of a branch merge conflict: both sides diverged from
/// the common ancestor. Conflict granularity is entity-level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConflict {
    /// The conflicted entity.
    pub id: EntityId,
    /// Value at the source branch head, `None` if deleted.
    pub source: Option<Value>,
    /// Value at the target branch head, `None` if deleted.
    pub target: Option<Value>,
    /// Value at the common ancestor, `None` if it did not exist.
    pub ancestor: Option<Value>,
}

//─────────────────────────────
//  Patch errors
//─────────────────────────────

/// Failure applying a single patch operation. Any of these aborts the
/// entire patch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// The path is not a well-formed JSON Pointer.
    #[error("invalid JSON pointer: {0}")]
    InvalidPointer(String),
    /// The path does not resolve in the current value.
    #[error("path not found: {0}")]
    PathNotFound(String),
    /// Splice target is not an array.
    #[error("not an array: {0}")]
    NotAnArray(String),
    /// Cannot descend into a scalar.
    #[error("not a container: {0}")]
    NotAContainer(String),
    /// Array index out of range.
    #[error("index {index} out of range at {path} (len {len})")]
    IndexOutOfRange {
        /// Offending path.
        path: String,
        /// Requested index.
        index: usize,
        /// Array length at the target.
        len: usize,
    },
}

//─────────────────────────────
//  Workspace-wide error type
//─────────────────────────────

/// Errors crossing the core's ingress/egress boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StrataError {
    /// One or more confirmed reads went stale.
    #[error("read conflict on {} entities", .conflicts.len())]
    Conflict {
        /// Per-entity conflict details.
        conflicts: Vec<EntityConflict>,
    },
    /// A pending dependency of this commit was rejected.
    #[error("cascaded rejection of pending commit {local_seq}")]
    CascadedRejection {
        /// The rejected dependency.
        local_seq: LocalSeq,
    },
    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Produced by the collaborating policy evaluator; carried through.
    #[error("authorization denied: {0}")]
    Authorization(String),
    /// Integrity or contention failure in the storage layer.
    #[error("storage error: {0}")]
    Storage(String),
    /// Request rejected by rate limiting.
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// Branch name was already consumed (names are never reused).
    #[error("branch name taken: {0:?}")]
    NameTaken(String),
    /// Referenced branch does not exist.
    #[error("unknown branch: {0:?}")]
    UnknownBranch(String),
    /// Fork point is beyond the parent's head.
    #[error("fork seq {requested} out of range (parent head {head})")]
    SeqOutOfRange {
        /// Requested fork point.
        requested: Seq,
        /// Parent branch head at the time.
        head: Seq,
    },
    /// The default branch cannot be deleted.
    #[error("default branch is protected")]
    DefaultBranchProtected,
    /// Fork would exceed the configured branch depth cap.
    #[error("branch depth cap {cap} exceeded")]
    BranchDepthExceeded {
        /// Configured maximum parent-chain length.
        cap: usize,
    },
    /// Source and target branches diverged for these entities.
    #[error("merge conflict on {} entities", .conflicts.len())]
    MergeConflict {
        /// Per-entity three-way conflict details.
        conflicts: Vec<BranchConflict>,
    },
    /// String is not a valid reference encoding.
    #[error("invalid reference: {0:?}")]
    InvalidReference(String),
    /// Patch application failed; the transaction rolls back.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// A storage invariant no longer holds; Space I/O must stop.
    #[error("invariant breach: {0}")]
    InvariantBreach(String),
}

impl StrataError {
    /// Build a single-entity conflict.
    pub fn conflict(id: EntityId, expected_seq: Seq, actual_seq: Seq, actual_value: Option<Value>) -> Self {
        Self::Conflict {
            conflicts: vec![EntityConflict {
                id,
                expected_seq,
                actual_seq,
                actual_value,
            }],
        }
    }

    /// Whether a client retry with refreshed reads can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Storage(_) | Self::RateLimit(_))
    }
}
