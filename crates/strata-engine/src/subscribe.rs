//! Per-session subscription delivery.
//!
//! A subscription rides the Space bus and keeps its own cursors: the last
//! commit seq it emitted and, per entity, the last fact seq delivered.
//! Facts already delivered at or after their current seq are suppressed,
//! several facts for one entity within a commit coalesce to the latest, and
//! changes originating from the subscriber's own session are not echoed.

use std::collections::{HashMap, VecDeque};

use tokio::sync::broadcast;
use tracing::warn;

use strata_bus::{ChangeBus, ChangeSet};
use strata_types::{EntityId, Fact, Seq, SessionId, StrataError};

use crate::query::{FactSet, Selector};
use crate::space::Space;

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Delivering updates.
    Active,
    /// Unsubscribe requested, awaiting the close acknowledgement.
    Closing,
    /// Closed; no further delivery.
    Closed,
}

/// A live stream of matching fact sets for one subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeSet>,
    selector: Selector,
    branch: String,
    session: Option<SessionId>,
    state: SubscriptionState,
    last_seq_sent: Seq,
    per_entity_last_seq: HashMap<EntityId, Seq>,
    backlog: VecDeque<FactSet>,
}

impl Space {
    /// Open a subscription on `branch` for the entities `selector` covers.
    ///
    /// With `since`, already-committed matching facts newer than `since`
    /// are delivered first as catch-up pages. `session` marks the
    /// subscriber's own session so its commits are not echoed back.
    pub async fn subscribe(
        &self,
        selector: Selector,
        branch: Option<&str>,
        since: Option<Seq>,
        session: Option<SessionId>,
    ) -> Result<Subscription, StrataError> {
        let branch = branch.unwrap_or(strata_types::DEFAULT_BRANCH).to_string();
        // Attach to the bus before the catch-up query; the per-entity
        // cursors deduplicate any overlap between the two.
        let rx = self.bus.subscribe();

        let mut subscription = Subscription {
            rx,
            selector,
            branch: branch.clone(),
            session,
            state: SubscriptionState::Active,
            last_seq_sent: since.unwrap_or(0),
            per_entity_last_seq: HashMap::new(),
            backlog: VecDeque::new(),
        };
        if since.is_some() {
            let mut after = None;
            loop {
                let page = self
                    .query(&subscription.selector, Some(&branch), since, after.as_ref())
                    .await?;
                let next = page.next.clone();
                subscription.absorb_page(page);
                match next {
                    Some(cursor) => after = Some(cursor),
                    None => break,
                }
            }
        }
        Ok(subscription)
    }
}

impl Subscription {
    /// Wait for the next matching fact set.
    ///
    /// Returns `None` once the subscription has left the `Active` state or
    /// the owning Space shut its bus down.
    pub async fn next(&mut self) -> Option<FactSet> {
        if self.state != SubscriptionState::Active {
            return None;
        }
        if let Some(page) = self.backlog.pop_front() {
            return Some(page);
        }
        loop {
            match self.rx.recv().await {
                Ok(changes) => {
                    if let Some(set) = self.filter(&changes) {
                        return Some(set);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped ring-buffer entries; the per-entity cursors
                    // keep later delivery consistent, gaps need a re-query.
                    warn!(missed, "subscription lagged behind the space bus");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.state = SubscriptionState::Closed;
                    return None;
                }
            }
        }
    }

    /// Request teardown: `Active -> Closing`.
    pub fn unsubscribe(&mut self) {
        if self.state == SubscriptionState::Active {
            self.state = SubscriptionState::Closing;
        }
    }

    /// Acknowledge teardown: `Closing -> Closed`.
    pub fn ack_close(&mut self) {
        if self.state == SubscriptionState::Closing {
            self.state = SubscriptionState::Closed;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Seq of the last commit this subscription delivered.
    pub fn last_seq_sent(&self) -> Seq {
        self.last_seq_sent
    }

    fn absorb_page(&mut self, page: FactSet) {
        for fact in &page.facts {
            self.track(fact);
        }
        if !page.facts.is_empty() {
            // Catch-up pages stream without resume cursors.
            self.backlog.push_back(FactSet {
                facts: page.facts,
                next: None,
            });
        }
    }

    fn track(&mut self, fact: &Fact) {
        self.last_seq_sent = self.last_seq_sent.max(fact.seq);
        self.per_entity_last_seq
            .insert(fact.id.clone(), fact.seq);
    }

    /// Apply origin suppression, branch and selector matching, coalescing
    /// and per-entity dedup to one bus change set.
    fn filter(&mut self, changes: &ChangeSet) -> Option<FactSet> {
        if changes.origin.is_some() && changes.origin == self.session {
            return None;
        }
        if changes.commit.branch != self.branch {
            return None;
        }
        // Coalesce to the latest fact per entity within the commit.
        let mut latest: HashMap<&EntityId, &Fact> = HashMap::new();
        for fact in &changes.facts {
            if self.selector.matches(&fact.id) {
                latest.insert(&fact.id, fact);
            }
        }
        let mut kept: Vec<Fact> = latest
            .into_values()
            .filter(|fact| {
                self.per_entity_last_seq
                    .get(&fact.id)
                    .map_or(true, |sent| fact.seq > *sent)
            })
            .cloned()
            .collect();
        if kept.is_empty() {
            return None;
        }
        kept.sort_by(|a, b| a.id.cmp(&b.id));
        for fact in &kept {
            self.track(fact);
        }
        self.last_seq_sent = self.last_seq_sent.max(changes.commit.seq);
        Some(FactSet {
            facts: kept,
            next: None,
        })
    }
}
