//! Selectors, fact sets and current-state queries.

use std::collections::BTreeSet;

use serde_json::Value;

use strata_types::{EntityId, Fact, Seq, StrataError};

use crate::space::Space;
use crate::storage_error;

//─────────────────────────────
//  Selectors
//─────────────────────────────

/// Which entities a query or subscription covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every entity on the branch (`{"*": {}}` on the wire).
    All,
    /// An explicit set of entity ids.
    Ids(BTreeSet<EntityId>),
}

impl Selector {
    /// Selector over the listed ids.
    pub fn ids<I: IntoIterator<Item = EntityId>>(ids: I) -> Self {
        Self::Ids(ids.into_iter().collect())
    }

    /// Parse the wire form: an object whose keys are entity ids, with the
    /// reserved key `*` selecting everything.
    pub fn from_json(value: &Value) -> Result<Self, StrataError> {
        let Some(map) = value.as_object() else {
            return Err(StrataError::NotFound(format!(
                "selector must be an object, got {value}"
            )));
        };
        if map.contains_key("*") {
            return Ok(Self::All);
        }
        Ok(Self::Ids(map.keys().map(|k| EntityId(k.clone())).collect()))
    }

    /// Whether the selector covers `id`.
    pub fn matches(&self, id: &EntityId) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(id),
        }
    }
}

//─────────────────────────────
//  Fact sets
//─────────────────────────────

/// A seq-consistent page of facts.
#[derive(Debug, Clone, PartialEq)]
pub struct FactSet {
    /// The facts, one head fact per entity for queries.
    pub facts: Vec<Fact>,
    /// Resume cursor when pagination truncated the result; re-query with
    /// this as `after`.
    pub next: Option<EntityId>,
}

impl FactSet {
    /// A set with nothing in it.
    pub fn empty() -> Self {
        Self {
            facts: Vec::new(),
            next: None,
        }
    }
}

impl Space {
    /// Fetch the current head facts for the selected entities.
    ///
    /// `since` keeps only facts with `seq > since`. Wildcard results
    /// paginate at the configured threshold; each page is consistent at the
    /// moment it is read and carries the resume cursor.
    pub async fn query(
        &self,
        selector: &Selector,
        branch: Option<&str>,
        since: Option<Seq>,
        after: Option<&EntityId>,
    ) -> Result<FactSet, StrataError> {
        let branch = branch.unwrap_or(strata_types::DEFAULT_BRANCH);
        self.branches.get_live(branch).await.map_err(storage_error)?;
        let page_size = self.config().wildcard_page_size;

        let candidates: Vec<EntityId> = match selector {
            Selector::Ids(ids) => ids
                .iter()
                .filter(|id| after.map_or(true, |a| id.as_str() > a.as_str()))
                .take(page_size + 1)
                .cloned()
                .collect(),
            Selector::All => {
                let pairs = self
                    .branches
                    .visible_pairs(branch)
                    .await
                    .map_err(storage_error)?;
                self.facts
                    .visible_ids(&pairs, after, page_size + 1)
                    .await
                    .map_err(storage_error)?
            }
        };

        let (page, next) = if candidates.len() > page_size {
            let next = candidates[page_size].clone();
            (&candidates[..page_size], Some(next))
        } else {
            (&candidates[..], None)
        };

        let mut facts = Vec::new();
        for id in page {
            let Some(head) = self.heads.resolve(branch, id).await.map_err(storage_error)? else {
                continue;
            };
            if since.is_some_and(|s| head.seq <= s) {
                continue;
            }
            let fact = self
                .facts
                .get(&head.fact_hash)
                .await
                .map_err(storage_error)?
                .ok_or_else(|| {
                    StrataError::InvariantBreach(format!(
                        "head of {id} references missing fact {}",
                        head.fact_hash
                    ))
                })?;
            facts.push(fact);
        }
        Ok(FactSet { facts, next })
    }
}
