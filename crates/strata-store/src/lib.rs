#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strata-store** – Per-Space SQLite persistence for Strata.
//!
//! One Space owns one database file. This crate provides the storage
//! subsystems the commit engine composes: the content-addressed value store,
//! the append-only fact log, the branch-scoped head index, and the snapshot
//! engine that bounds patch-replay cost. Writes that must be atomic with a
//! commit take an explicit sqlx transaction handle; read paths go through
//! the connection pool.

/// Space configuration knobs with production defaults.
pub mod config;
/// Database open, pragmas, migration and seeding.
pub mod db;
/// Content-addressed value and blob rows.
pub mod content;
/// Append-only fact log.
pub mod facts;
/// Branch metadata rows and lineage resolution.
pub mod branches;
/// Branch-scoped head pointers with parent-chain fallback.
pub mod heads;
/// Snapshot creation and snapshot-accelerated reads.
pub mod snapshots;

pub use config::SpaceConfig;
pub use db::SpaceDb;
pub use snapshots::ReadView;

#[cfg(test)]
pub(crate) mod testutil {
    //! Minimal commit plumbing for storage-level tests: one fact per
    //! commit, heads and branch seqs maintained the way the engine does.

    use chrono::Utc;
    use serde_json::Value;
    use strata_types::{
        EntityId, Fact, FactKind, Head, ReadSet, Reference, Seq,
    };

    use crate::branches::BranchStore;
    use crate::content::ContentStore;
    use crate::db::SpaceDb;
    use crate::facts::FactLog;
    use crate::heads::HeadIndex;

    pub async fn fork(db: &SpaceDb, name: &str, parent: &str, fork_seq: Seq) {
        let branches = BranchStore::new(db.clone());
        branches
            .insert(&strata_types::BranchRecord {
                name: name.to_string(),
                parent: Some(parent.to_string()),
                fork_seq,
                head_seq: fork_seq,
                created_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();
    }

    pub async fn commit_set(db: &SpaceDb, branch: &str, id: &str, value: Value, seq: Seq) -> Fact {
        commit_fact(db, branch, id, FactKind::Set, Some(value), seq).await
    }

    pub async fn commit_patch(db: &SpaceDb, branch: &str, id: &str, ops: Value, seq: Seq) -> Fact {
        commit_fact(db, branch, id, FactKind::Patch, Some(ops), seq).await
    }

    pub async fn commit_delete(db: &SpaceDb, branch: &str, id: &str, seq: Seq) -> Fact {
        commit_fact(db, branch, id, FactKind::Delete, None, seq).await
    }

    async fn commit_fact(
        db: &SpaceDb,
        branch: &str,
        id: &str,
        kind: FactKind,
        payload: Option<Value>,
        seq: Seq,
    ) -> Fact {
        let heads = HeadIndex::new(db.clone());
        let entity = EntityId::from(id);
        let parent = heads
            .resolve(branch, &entity)
            .await
            .unwrap()
            .map(|h| h.fact_hash);

        let mut tx = db.pool().begin().await.unwrap();
        let payload_ref = match payload {
            Some(value) => ContentStore::put_value_in(&mut *tx, &value).await.unwrap(),
            None => Reference::empty(),
        };
        let hash = Fact::content_hash(kind, &entity, &payload_ref, parent.as_ref());
        let commit_ref = strata_types::reference::HashPayload::new()
            .field("branch", branch)
            .field("seq", seq)
            .field("facts", Value::Array(vec![Value::String(hash.as_str().to_string())]))
            .reference();
        sqlx::query(
            "INSERT INTO commit_log (hash, seq, branch, reads, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(commit_ref.as_str())
        .bind(seq as i64)
        .bind(branch)
        .bind(serde_json::to_string(&ReadSet::empty()).unwrap())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .unwrap();

        let fact = Fact {
            hash,
            id: entity.clone(),
            kind,
            payload_ref,
            parent,
            seq,
            commit_ref,
            branch: branch.to_string(),
        };
        FactLog::append(&mut *tx, &fact).await.unwrap();
        HeadIndex::upsert(
            &mut *tx,
            branch,
            &entity,
            &Head {
                fact_hash: fact.hash.clone(),
                seq,
            },
        )
        .await
        .unwrap();
        BranchStore::bump_head_seq(&mut *tx, branch, seq).await.unwrap();
        tx.commit().await.unwrap();
        fact
    }
}
