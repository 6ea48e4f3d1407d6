//! Immutable fact records.
//!
//! A fact is one state transition for one entity: a complete value (`Set`),
//! an ordered list of patch operations (`Patch`), or a tombstone (`Delete`).
//! Facts are content-hashed over `{type, id, value-or-ops, parent}` and never
//! mutated once written. `seq`, `commit_ref` and `branch` are assigned by the
//! commit engine and do not participate in the content hash.

use serde::{Deserialize, Serialize};

use crate::reference::{HashPayload, Reference};
use crate::{EntityId, Seq};

//─────────────────────────────
//  Fact kind
//─────────────────────────────

/// Discriminant of the three fact variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    /// Establishes a complete value.
    Set,
    /// Records patch operations applied to the prior value.
    Patch,
    /// Tombstone; the payload is the `__empty__` sentinel.
    Delete,
}

impl FactKind {
    /// Stable string tag used in hashing and persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }

    /// Parse the stable string tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "set" => Some(Self::Set),
            "patch" => Some(Self::Patch),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for FactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Fact record
//─────────────────────────────

/// One immutable state transition for an entity.
///
/// `payload_ref` points at the value row for `Set`, the ops row for `Patch`,
/// and the `__empty__` sentinel for `Delete`. `parent` is the hash of the
/// predecessor fact for this entity, `None` iff this is the entity's first
/// fact ever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Content hash of this fact.
    pub hash: Reference,
    /// Entity the transition applies to.
    pub id: EntityId,
    /// Which of the three variants this is.
    pub kind: FactKind,
    /// Value reference (`Set`/`Delete`) or ops reference (`Patch`).
    pub payload_ref: Reference,
    /// Hash of the predecessor fact, `None` for the first fact.
    pub parent: Option<Reference>,
    /// Space-global seq of the producing commit.
    pub seq: Seq,
    /// Hash of the producing commit.
    pub commit_ref: Reference,
    /// Branch the producing commit landed on (denormalized).
    pub branch: String,
}

impl Fact {
    /// Compute the content hash of a fact from its hashed fields.
    ///
    /// Patch facts contribute their ops reference under `ops`, the other two
    /// variants contribute `value`; an unset parent is omitted entirely.
    pub fn content_hash(
        kind: FactKind,
        id: &EntityId,
        payload_ref: &Reference,
        parent: Option<&Reference>,
    ) -> Reference {
        let payload_key = match kind {
            FactKind::Patch => "ops",
            FactKind::Set | FactKind::Delete => "value",
        };
        HashPayload::new()
            .field("type", kind.as_str())
            .field("id", id.as_str())
            .field(payload_key, payload_ref.as_str())
            .field_opt("parent", parent.map(Reference::as_str))
            .reference()
    }

    /// Whether this fact tombstones its entity.
    pub fn is_delete(&self) -> bool {
        self.kind == FactKind::Delete
    }
}

//─────────────────────────────
//  Head pointer
//─────────────────────────────

/// The current fact for a (branch, entity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Hash of the head fact.
    pub fact_hash: Reference,
    /// Seq of the head fact; always equals the referenced fact's seq.
    pub seq: Seq,
}
