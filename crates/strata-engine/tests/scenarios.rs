//! End-to-end scenarios against an in-memory Space.

use std::collections::HashMap;

use serde_json::{json, Value};

use strata_engine::{CommitOrigin, Selector, Space};
use strata_store::snapshots::ReadView;
use strata_store::SpaceConfig;
use strata_types::{
    ClientCommit, ConfirmedRead, EntityId, PatchOp, ReadSet, Seq, StrataError, UserOp,
    DEFAULT_BRANCH,
};

async fn space() -> Space {
    Space::in_memory(SpaceConfig::default()).await.unwrap()
}

fn set(id: &str, value: Value) -> UserOp {
    UserOp::Set {
        id: id.into(),
        value,
    }
}

fn confirmed(reads: &[(&str, Seq)]) -> ReadSet {
    ReadSet {
        confirmed: reads
            .iter()
            .map(|(id, seq)| ConfirmedRead {
                id: (*id).into(),
                seq: *seq,
            })
            .collect(),
        pending: Vec::new(),
    }
}

fn commit(reads: ReadSet, operations: Vec<UserOp>) -> ClientCommit {
    ClientCommit {
        reads,
        operations,
        branch: None,
    }
}

fn replace_n(k: i64) -> Vec<PatchOp> {
    vec![PatchOp::Replace {
        path: "/n".into(),
        value: json!(k),
    }]
}

async fn read(space: &Space, id: &str) -> ReadView {
    space
        .read_current(DEFAULT_BRANCH, &id.into())
        .await
        .unwrap()
}

//─────────────────────────────
//  S1: seq monotonicity + content-address dedup
//─────────────────────────────

#[tokio::test]
async fn seq_monotonicity_and_value_dedup() {
    let space = space().await;

    let first = space
        .transact(
            commit(confirmed(&[("e:1", 0)]), vec![set("e:1", json!({"a": 1}))]),
            None,
        )
        .await
        .unwrap();
    let second = space
        .transact(
            commit(confirmed(&[("e:2", 0)]), vec![set("e:2", json!({"a": 1}))]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(first.commit.seq, 1);
    assert_eq!(second.commit.seq, 2);

    let f1 = &first.facts[0];
    let f2 = &second.facts[0];
    assert_ne!(f1.hash, f2.hash);
    assert!(f1.parent.is_none());
    assert!(f2.parent.is_none());
    // Identical JSON payloads share one value row.
    assert_eq!(f1.payload_ref, f2.payload_ref);
    // The sentinel plus exactly one {"a":1} row.
    assert_eq!(space.content().value_count().await.unwrap(), 2);
}

//─────────────────────────────
//  S2: patch + snapshot replay + compaction
//─────────────────────────────

#[tokio::test]
async fn patch_snapshot_replay_and_compaction() {
    let space = space().await;
    space
        .transact(commit(ReadSet::empty(), vec![set("c", json!({"n": 0}))]), None)
        .await
        .unwrap();
    for k in 1..=11 {
        space
            .transact(
                commit(
                    ReadSet::empty(),
                    vec![UserOp::Patch {
                        id: "c".into(),
                        patches: replace_n(k),
                    }],
                ),
                None,
            )
            .await
            .unwrap();
    }

    // The snapshot threshold (10 patches) fired at or before seq 12.
    let snap = space
        .facts()
        .patch_count_since(&"c".into(), DEFAULT_BRANCH, 0)
        .await
        .unwrap();
    assert_eq!(snap, 11);
    assert_eq!(read(&space, "c").await, ReadView::Value(json!({"n": 11})));
    assert_eq!(
        space.read_at(DEFAULT_BRANCH, &"c".into(), 7).await.unwrap(),
        ReadView::Value(json!({"n": 6}))
    );

    // Reference-safe compaction never breaks replay.
    space.facts().compact(&"c".into(), 6).await.unwrap();
    assert_eq!(read(&space, "c").await, ReadView::Value(json!({"n": 11})));
    assert_eq!(
        space.read_at(DEFAULT_BRANCH, &"c".into(), 7).await.unwrap(),
        ReadView::Value(json!({"n": 6}))
    );
}

//─────────────────────────────
//  S3: seq-based conflict, not CAS
//─────────────────────────────

#[tokio::test]
async fn conflicts_are_seq_based_not_cas() {
    let space = space().await;
    // Bring x to seq 5 with filler commits.
    for i in 1..=4 {
        space
            .transact(
                commit(ReadSet::empty(), vec![set(&format!("filler:{i}"), json!(i))]),
                None,
            )
            .await
            .unwrap();
    }
    space
        .transact(commit(ReadSet::empty(), vec![set("x", json!("v"))]), None)
        .await
        .unwrap();

    // B writes y, advancing the space seq to 6 without touching x.
    space
        .transact(commit(ReadSet::empty(), vec![set("y", json!("w"))]), None)
        .await
        .unwrap();

    // A's read of x at seq 5 is still fresh: accepted at seq 7.
    let accepted = space
        .transact(
            commit(confirmed(&[("x", 5)]), vec![set("x", json!("v2"))]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(accepted.commit.seq, 7);

    // Now another writer moves x itself; the same read goes stale.
    space
        .transact(commit(ReadSet::empty(), vec![set("x", json!("w2"))]), None)
        .await
        .unwrap();
    let err = space
        .transact(
            commit(confirmed(&[("x", 7)]), vec![set("x", json!("v3"))]),
            None,
        )
        .await
        .unwrap_err();
    match err {
        StrataError::Conflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].expected_seq, 7);
            assert_eq!(conflicts[0].actual_seq, 8);
            // The conflict carries the actual value to save a round-trip.
            assert_eq!(conflicts[0].actual_value, Some(json!("w2")));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

//─────────────────────────────
//  S5: branch fork, write, merge
//─────────────────────────────

#[tokio::test]
async fn branch_fork_write_merge() {
    let space = space().await;
    for i in 1..=9 {
        space
            .transact(
                commit(ReadSet::empty(), vec![set(&format!("pad:{i}"), json!(i))]),
                None,
            )
            .await
            .unwrap();
    }
    space
        .transact(commit(ReadSet::empty(), vec![set("e", json!({"k": "v0"}))]), None)
        .await
        .unwrap();

    let draft = space.create_branch("draft", DEFAULT_BRANCH, Some(10)).await.unwrap();
    assert_eq!(draft.fork_seq, 10);

    // Patch e on the draft; touch a different entity on the default branch.
    space
        .transact(
            ClientCommit {
                reads: ReadSet::empty(),
                operations: vec![UserOp::Patch {
                    id: "e".into(),
                    patches: vec![PatchOp::Replace {
                        path: "/k".into(),
                        value: json!("v1"),
                    }],
                }],
                branch: Some("draft".into()),
            },
            None,
        )
        .await
        .unwrap();
    space
        .transact(commit(ReadSet::empty(), vec![set("f", json!({"other": true}))]), None)
        .await
        .unwrap();

    let outcome = space
        .merge_branches("draft", DEFAULT_BRANCH, None)
        .await
        .unwrap();
    assert_eq!(outcome.merged, vec![EntityId::from("e")]);
    assert!(outcome.commit.is_some());

    // e fast-forwarded onto the default branch; history is intact.
    assert_eq!(read(&space, "e").await, ReadView::Value(json!({"k": "v1"})));
    assert_eq!(
        space.read_at(DEFAULT_BRANCH, &"e".into(), 10).await.unwrap(),
        ReadView::Value(json!({"k": "v0"}))
    );
    // f was never changed on the draft.
    assert_eq!(read(&space, "f").await, ReadView::Value(json!({"other": true})));
}

#[tokio::test]
async fn merge_conflict_and_resolution() {
    let space = space().await;
    space
        .transact(commit(ReadSet::empty(), vec![set("e", json!({"k": "base"}))]), None)
        .await
        .unwrap();
    space.create_branch("draft", DEFAULT_BRANCH, None).await.unwrap();

    // Both sides diverge.
    space
        .transact(
            ClientCommit {
                reads: ReadSet::empty(),
                operations: vec![set("e", json!({"k": "theirs"}))],
                branch: Some("draft".into()),
            },
            None,
        )
        .await
        .unwrap();
    space
        .transact(commit(ReadSet::empty(), vec![set("e", json!({"k": "ours"}))]), None)
        .await
        .unwrap();

    let err = space
        .merge_branches("draft", DEFAULT_BRANCH, None)
        .await
        .unwrap_err();
    match err {
        StrataError::MergeConflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, EntityId::from("e"));
            assert_eq!(conflicts[0].source, Some(json!({"k": "theirs"})));
            assert_eq!(conflicts[0].target, Some(json!({"k": "ours"})));
            assert_eq!(conflicts[0].ancestor, Some(json!({"k": "base"})));
        }
        other => panic!("expected merge conflict, got {other:?}"),
    }

    // Entity-level resolutions unblock the merge.
    let resolutions: HashMap<EntityId, Value> =
        [(EntityId::from("e"), json!({"k": "resolved"}))].into();
    let outcome = space
        .merge_branches("draft", DEFAULT_BRANCH, Some(&resolutions))
        .await
        .unwrap();
    assert!(outcome.commit.is_some());
    assert_eq!(read(&space, "e").await, ReadView::Value(json!({"k": "resolved"})));
}

//─────────────────────────────
//  S6: cross-session subscription fan-out
//─────────────────────────────

#[tokio::test]
async fn cross_session_fanout_without_echo() {
    let space = space().await;
    let observer = space.register_session();
    let writer = space.register_session();

    let mut observer_sub = space
        .subscribe(Selector::All, None, None, Some(observer))
        .await
        .unwrap();
    let mut writer_sub = space
        .subscribe(Selector::All, None, None, Some(writer))
        .await
        .unwrap();

    space
        .transact(
            commit(ReadSet::empty(), vec![set("w", json!({}))]),
            Some(CommitOrigin {
                session: writer,
                local_seq: 1,
            }),
        )
        .await
        .unwrap();

    // The other session receives exactly one update for the commit.
    let update = observer_sub.next().await.unwrap();
    assert_eq!(update.facts.len(), 1);
    assert_eq!(update.facts[0].id, EntityId::from("w"));

    // The producing session gets no echo of its own commit.
    space
        .transact(
            commit(ReadSet::empty(), vec![set("z", json!(1))]),
            None, // server-side commit, no origin: delivered everywhere
        )
        .await
        .unwrap();
    let next_for_writer = writer_sub.next().await.unwrap();
    assert_eq!(next_for_writer.facts[0].id, EntityId::from("z"));
}

//─────────────────────────────
//  Boundary behaviors
//─────────────────────────────

#[tokio::test]
async fn delete_then_set_chains_parent() {
    let space = space().await;
    let first = space
        .transact(commit(ReadSet::empty(), vec![set("d", json!(1))]), None)
        .await
        .unwrap();
    let tombstone = space
        .transact(
            commit(ReadSet::empty(), vec![UserOp::Delete { id: "d".into() }]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(read(&space, "d").await, ReadView::Deleted);
    assert_eq!(tombstone.facts[0].parent, Some(first.facts[0].hash.clone()));

    let revived = space
        .transact(commit(ReadSet::empty(), vec![set("d", json!(2))]), None)
        .await
        .unwrap();
    // The new head's parent is the tombstone fact.
    assert_eq!(revived.facts[0].parent, Some(tombstone.facts[0].hash.clone()));
    assert_eq!(read(&space, "d").await, ReadView::Value(json!(2)));
}

#[tokio::test]
async fn branch_depth_cap_rejects_forks_but_not_merges() {
    let mut config = SpaceConfig::default();
    config.branch_depth_cap = 3;
    let space = Space::in_memory(config).await.unwrap();

    space.create_branch("a", DEFAULT_BRANCH, None).await.unwrap();
    space.create_branch("b", "a", None).await.unwrap();
    let err = space.create_branch("c", "b", None).await.unwrap_err();
    assert!(matches!(err, StrataError::BranchDepthExceeded { cap: 3 }));

    // Merging at the cap still proceeds.
    space
        .transact(
            ClientCommit {
                reads: ReadSet::empty(),
                operations: vec![set("deep", json!(true))],
                branch: Some("b".into()),
            },
            None,
        )
        .await
        .unwrap();
    let outcome = space.merge_branches("b", "a", None).await.unwrap();
    assert_eq!(outcome.merged.len(), 1);
}

#[tokio::test]
async fn branch_lifecycle_errors() {
    let space = space().await;
    space.create_branch("draft", DEFAULT_BRANCH, None).await.unwrap();

    assert!(matches!(
        space.create_branch("draft", DEFAULT_BRANCH, None).await.unwrap_err(),
        StrataError::NameTaken(_)
    ));
    assert!(matches!(
        space.create_branch("x", "nope", None).await.unwrap_err(),
        StrataError::UnknownBranch(_)
    ));
    assert!(matches!(
        space.create_branch("x", DEFAULT_BRANCH, Some(99)).await.unwrap_err(),
        StrataError::SeqOutOfRange { .. }
    ));
    assert!(matches!(
        space.delete_branch(DEFAULT_BRANCH).await.unwrap_err(),
        StrataError::DefaultBranchProtected
    ));

    space.delete_branch("draft").await.unwrap();
    // Names are permanently consumed after soft delete.
    assert!(matches!(
        space.create_branch("draft", DEFAULT_BRANCH, None).await.unwrap_err(),
        StrataError::NameTaken(_)
    ));
    assert_eq!(space.list_branches(false).await.unwrap().len(), 1);
    assert_eq!(space.list_branches(true).await.unwrap().len(), 2);
}

#[tokio::test]
async fn branch_isolation_spot_check() {
    let space = space().await;
    space.create_branch("left", DEFAULT_BRANCH, None).await.unwrap();
    space.create_branch("right", DEFAULT_BRANCH, None).await.unwrap();

    for i in 0..5 {
        space
            .transact(
                ClientCommit {
                    reads: ReadSet::empty(),
                    operations: vec![set(&format!("sample:{i}"), json!(i))],
                    branch: Some("left".into()),
                },
                None,
            )
            .await
            .unwrap();
    }
    for i in 0..5 {
        let id = EntityId(format!("sample:{i}"));
        assert_eq!(
            space.read_current("right", &id).await.unwrap(),
            ReadView::Absent,
            "write on left leaked to sibling branch"
        );
    }
}

#[tokio::test]
async fn patch_equivalence_with_direct_set() {
    let space = space().await;
    space
        .transact(commit(ReadSet::empty(), vec![set("p", json!({"n": 0}))]), None)
        .await
        .unwrap();
    for k in 1..=3 {
        space
            .transact(
                commit(
                    ReadSet::empty(),
                    vec![UserOp::Patch {
                        id: "p".into(),
                        patches: replace_n(k),
                    }],
                ),
                None,
            )
            .await
            .unwrap();
    }
    space
        .transact(commit(ReadSet::empty(), vec![set("q", json!({"n": 3}))]), None)
        .await
        .unwrap();

    // N patches and the final materialized value read identically.
    assert_eq!(read(&space, "p").await, read(&space, "q").await);
}

#[tokio::test]
async fn claims_are_recorded_but_write_nothing() {
    let space = space().await;
    space
        .transact(commit(ReadSet::empty(), vec![set("seen", json!(1))]), None)
        .await
        .unwrap();

    let changes = space
        .transact(
            commit(
                ReadSet::empty(),
                vec![UserOp::Claim { id: "seen".into() }, set("other", json!(2))],
            ),
            None,
        )
        .await
        .unwrap();

    // One fact for the Set; the Claim only lands in the recorded reads.
    assert_eq!(changes.facts.len(), 1);
    assert_eq!(changes.facts[0].id, EntityId::from("other"));
    assert!(changes
        .commit
        .reads
        .confirmed
        .iter()
        .any(|r| r.id == EntityId::from("seen") && r.seq == 1));
}

#[tokio::test]
async fn wildcard_query_paginates_consistently() {
    let mut config = SpaceConfig::default();
    config.wildcard_page_size = 3;
    let space = Space::in_memory(config).await.unwrap();

    for i in 0..8 {
        space
            .transact(
                commit(ReadSet::empty(), vec![set(&format!("e:{i}"), json!(i))]),
                None,
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut after: Option<EntityId> = None;
    loop {
        let page = space
            .query(&Selector::All, None, None, after.as_ref())
            .await
            .unwrap();
        assert!(page.facts.len() <= 3);
        seen.extend(page.facts.iter().map(|f| f.id.clone()));
        match page.next {
            Some(cursor) => after = Some(cursor),
            None => break,
        }
    }
    assert_eq!(seen.len(), 8);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "pages are ordered and non-overlapping");
}

#[tokio::test]
async fn pending_read_cascade_on_rejection() {
    let space = space().await;
    let session = space.register_session();

    // L=1 goes stale against a competing write and is rejected.
    space
        .transact(commit(ReadSet::empty(), vec![set("a", json!("server"))]), None)
        .await
        .unwrap();
    let rejected = space
        .transact(
            commit(confirmed(&[("a", 0)]), vec![set("a", json!("mine"))]),
            Some(CommitOrigin { session, local_seq: 1 }),
        )
        .await
        .unwrap_err();
    assert!(matches!(rejected, StrataError::Conflict { .. }));

    // L=2 depends on L=1 and must cascade without touching state.
    let err = space
        .transact(
            ClientCommit {
                reads: ReadSet {
                    confirmed: Vec::new(),
                    pending: vec![strata_types::PendingRead {
                        id: "a".into(),
                        local_seq: 1,
                    }],
                },
                operations: vec![set("b", json!("derived"))],
                branch: None,
            },
            Some(CommitOrigin { session, local_seq: 2 }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::CascadedRejection { local_seq: 1 }));
    assert_eq!(read(&space, "b").await, ReadView::Absent);
}

#[tokio::test]
async fn pending_read_resolves_after_accept() {
    let space = space().await;
    let session = space.register_session();

    space
        .transact(
            commit(confirmed(&[("a", 0)]), vec![set("a", json!("new"))]),
            Some(CommitOrigin { session, local_seq: 1 }),
        )
        .await
        .unwrap();

    // A dependent commit whose read resolved from pending L=1 validates
    // against the seq the server assigned to L=1.
    let changes = space
        .transact(
            ClientCommit {
                reads: ReadSet {
                    confirmed: Vec::new(),
                    pending: vec![strata_types::PendingRead {
                        id: "a".into(),
                        local_seq: 1,
                    }],
                },
                operations: vec![set("b", json!("derived-from-new"))],
                branch: None,
            },
            Some(CommitOrigin { session, local_seq: 2 }),
        )
        .await
        .unwrap();
    assert_eq!(changes.commit.seq, 2);
    assert_eq!(read(&space, "b").await, ReadView::Value(json!("derived-from-new")));
}
