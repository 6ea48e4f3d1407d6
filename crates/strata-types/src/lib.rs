#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strata-types** – Shared primitive data structures for Strata.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the content-addressing scheme, the fact and commit records that
//! make up a Space's log, the patch operation language, and the typed error
//! taxonomy. It intentionally makes no assumptions about I/O or storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

//─────────────────────────────
//  Modules
//─────────────────────────────

/// Content-addressed references and the canonical JSON encoder.
pub mod reference;
/// Immutable fact records and their content hashing.
pub mod fact;
/// JSON Pointer patch operations and atomic application.
pub mod patch;
/// Client-facing operations, read sets and commit payloads.
pub mod op;
/// Typed error taxonomy shared across the workspace.
pub mod error;

pub use error::{BranchConflict, EntityConflict, PatchError, StrataError};
pub use fact::{Fact, FactKind, Head};
pub use op::{ClientCommit, ConfirmedRead, PendingRead, ReadSet, UserOp};
pub use patch::PatchOp;
pub use reference::{canonical_bytes, Reference, EMPTY_HASH};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Opaque identifier for an entity inside a Space.
///
/// The core imposes no structural constraint; callers typically use
/// URI-shaped strings but any non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// View the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of the default branch every Space starts with.
///
/// The default branch has no parent and is never deletable.
pub const DEFAULT_BRANCH: &str = "";

/// Space-global Lamport sequence number. Strictly increasing across all
/// branches of a Space; all facts of one commit share the same value.
pub type Seq = u64;

/// Per-session monotonic index identifying a pending client commit.
pub type LocalSeq = u64;

/// Identifier of one client session attached to a Space.
pub type SessionId = u64;

//─────────────────────────────
//  Entity document envelope
//─────────────────────────────

/// The `{value, source?}` wrapper the core imposes on entity values.
///
/// This is the only schema the core knows about; path addressing into an
/// entity begins at the envelope root, so a patch touching the payload uses
/// paths under `/value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The entity's data.
    pub value: Value,
    /// Optional provenance link (`{"/": hash}` form).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

impl Envelope {
    /// Wrap a bare value with no provenance link.
    pub fn new(value: Value) -> Self {
        Self { value, source: None }
    }

    /// Convert the envelope into a plain JSON value.
    pub fn into_value(self) -> Value {
        // Serialization cannot fail: the envelope is built from JSON values.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

//─────────────────────────────
//  Commit / branch / snapshot records
//─────────────────────────────

/// Record of one applied commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Content hash over the commit's logical content.
    pub hash: Reference,
    /// Space-global sequence number assigned to this commit.
    pub seq: Seq,
    /// Branch the commit landed on.
    pub branch: String,
    /// The read set the client validated against, kept for audit replay.
    pub reads: ReadSet,
    /// Wall-clock timestamp when the commit was recorded.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Branch metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Branch name; `""` is the default branch.
    pub name: String,
    /// Parent branch, `None` only for the default branch.
    pub parent: Option<String>,
    /// Sequence number at which this branch forked off its parent.
    pub fork_seq: Seq,
    /// Highest seq committed on this branch.
    pub head_seq: Seq,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Soft-deletion timestamp; the name stays consumed forever.
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Precomputed materialization of an entity's value at a seq on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Branch the snapshot belongs to.
    pub branch: String,
    /// Entity the snapshot materializes.
    pub id: EntityId,
    /// Sequence number the materialization is exact at.
    pub seq: Seq,
    /// Reference to the materialized value in the content store.
    pub value_ref: Reference,
}
