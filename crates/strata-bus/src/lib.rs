#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strata-bus** – Space-level change notification bus for Strata.
//!
//! Every applied commit is published once onto the owning Space's bus as a
//! [`ChangeSet`]: the commit record plus the facts it wrote. Subscription
//! delivery, client sessions and test harnesses all consume the same stream;
//! consumers classify changes into commit/revert/integrate notifications on
//! their side. The bus is in-memory broadcast only — persistence belongs to
//! the storage layer.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use strata_types::{CommitRecord, Fact, SessionId};

//─────────────────────────────
//  Change sets
//─────────────────────────────

/// The unit of fan-out: one applied commit and the facts it changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The commit record as persisted.
    pub commit: CommitRecord,
    /// Facts written by the commit, in operation order.
    pub facts: Vec<Fact>,
    /// Session that produced the commit, if it came through a session;
    /// subscription delivery uses this to suppress same-session echo.
    pub origin: Option<SessionId>,
}

//─────────────────────────────
//  Bus trait
//─────────────────────────────

/// Publish/subscribe abstraction over a Space's change stream.
///
/// Implementations must be thread-safe and support multiple subscribers.
/// Publishing never blocks; subscribers that fall behind the ring buffer
/// miss changes and are expected to re-sync through a query.
pub trait ChangeBus: Send + Sync {
    /// Publish a change set to all subscribers.
    fn publish(&self, changes: &ChangeSet) -> Result<()>;

    /// Subscribe to change sets published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ChangeSet>;
}

//─────────────────────────────
//  In-memory bus
//─────────────────────────────

/// Broadcast-only bus backed by a Tokio channel, one per open Space.
#[derive(Debug, Clone)]
pub struct SpaceBus {
    tx: Arc<broadcast::Sender<ChangeSet>>,
}

impl SpaceBus {
    /// Create a bus with the given ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ChangeBus for SpaceBus {
    fn publish(&self, changes: &ChangeSet) -> Result<()> {
        // No subscribers is fine; lagging subscribers handle missed changes.
        let _ = self.tx.send(changes.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.tx.subscribe()
    }
}
