#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strata-engine** – Per-Space commit engine for Strata.
//!
//! A [`Space`] is the serialization point for one tenant: it owns the
//! database handle, the Space-global Lamport counter, the per-Space write
//! lock and the change bus. On top of it this crate implements the commit
//! pipeline (read-set validation, seq assignment, atomic application,
//! fan-out), the branch manager (O(1) forks, soft delete, diff and
//! entity-level merge), schema-agnostic queries and live subscriptions.
//!
//! Transport framing, authentication and the schema traverser are external
//! collaborators; they talk to this crate through [`Space::transact`],
//! [`Space::query`], [`Space::subscribe`] and the branch lifecycle calls.

/// Space handle, session registry and the Space manager.
pub mod space;
/// The commit pipeline.
pub mod commit;
/// Branch lifecycle: fork, soft delete, diff, merge.
pub mod branch;
/// Selectors, fact sets and current-state queries.
pub mod query;
/// Per-session subscription delivery.
pub mod subscribe;

pub use branch::{BranchDiff, MergeOutcome};
pub use commit::CommitOrigin;
pub use query::{FactSet, Selector};
pub use space::{Space, SpaceManager};
pub use subscribe::{Subscription, SubscriptionState};

use strata_types::StrataError;

/// Map an internal storage failure onto the typed taxonomy, letting typed
/// errors already in the chain pass through unchanged.
pub(crate) fn storage_error(error: anyhow::Error) -> StrataError {
    match error.downcast::<StrataError>() {
        Ok(typed) => typed,
        Err(other) => StrataError::Storage(other.to_string()),
    }
}
