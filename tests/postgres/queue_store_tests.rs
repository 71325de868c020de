//! Conditional queue updates: exclusive claims, leases, and cancellation.

use super::helpers::{CleanupGuard, build_task, database_name, key, setup_store, test_runtime};
use chrono::Utc;
use pg_embedded_setup_unpriv::{TestCluster, test_support::shared_test_cluster};
use pipewright::pipeline::{
    adapters::postgres::PostgresPipelineStore,
    domain::{DispatchState, QueueEntry, TaskKey, WorkerId, lease_deadline},
    ports::{QueueStore, StoreError, TaskStore},
};
use rstest::rstest;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinSet;

const LEASE: Duration = Duration::from_secs(30);

fn enqueue(runtime: &Runtime, store: &PostgresPipelineStore, task_id: u64) -> TaskKey {
    let task = build_task(task_id);
    runtime
        .block_on(store.insert_task(&task))
        .expect("task insert succeeds");
    runtime
        .block_on(store.insert_entry(&QueueEntry::pending(task.key().clone(), Utc::now())))
        .expect("entry insert succeeds");
    task.key().clone()
}

#[rstest]
fn only_one_of_many_concurrent_claims_wins(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("queue_race");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 8).expect("store setup");
    let runtime = test_runtime();
    let task_key = enqueue(&runtime, &store, 1);
    let deadline = lease_deadline(Utc::now(), LEASE);

    let winners: Vec<WorkerId> = runtime.block_on(async {
        let mut claims = JoinSet::new();
        for worker in 0..8 {
            let racer = store.clone();
            let target = task_key.clone();
            claims.spawn(async move {
                racer
                    .try_claim(&target, &WorkerId::new(format!("worker-{worker}")), deadline)
                    .await
            });
        }
        let mut won = Vec::new();
        while let Some(joined) = claims.join_next().await {
            let claimed = joined.expect("claim task joins").expect("claim query succeeds");
            won.extend(claimed.and_then(|entry| entry.worker().cloned()));
        }
        won
    });
    let entry = runtime
        .block_on(store.find_entry(&task_key))
        .expect("lookup succeeds")
        .expect("entry present");

    assert_eq!(winners.len(), 1, "winners: {winners:?}");
    assert_eq!(entry.state(), DispatchState::Claimed);
    assert_eq!(entry.attempts(), 1);
    assert_eq!(entry.worker(), winners.first());
}

#[rstest]
fn expired_lease_returns_the_entry_to_pending_once(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("queue_expiry");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let task_key = enqueue(&runtime, &store, 2);
    let lapsed = Utc::now() - chrono::TimeDelta::seconds(5);
    runtime
        .block_on(store.try_claim(&task_key, &WorkerId::new("crashed"), lapsed))
        .expect("claim query succeeds")
        .expect("claim wins");

    let now = Utc::now();
    let expired = runtime
        .block_on(store.expired_claims(now))
        .expect("sweep query succeeds");
    let released = runtime
        .block_on(store.release_expired(&task_key, now))
        .expect("release query succeeds");
    let repeated = runtime
        .block_on(store.release_expired(&task_key, now))
        .expect("release query succeeds");
    let reclaimed = runtime
        .block_on(store.try_claim(
            &task_key,
            &WorkerId::new("survivor"),
            lease_deadline(now, LEASE),
        ))
        .expect("claim query succeeds")
        .expect("released entry can be claimed");

    assert_eq!(expired.len(), 1);
    assert_eq!(
        released.map(|entry| (entry.state(), entry.worker().cloned())),
        Some((DispatchState::Pending, None))
    );
    assert!(repeated.is_none());
    assert_eq!(reclaimed.attempts(), 2);
}

#[rstest]
fn lease_operations_require_the_current_holder(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("queue_holder");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let task_key = enqueue(&runtime, &store, 3);
    let holder = WorkerId::new("holder");
    let intruder = WorkerId::new("intruder");
    let deadline = lease_deadline(Utc::now(), LEASE);
    runtime
        .block_on(store.try_claim(&task_key, &holder, deadline))
        .expect("claim query succeeds")
        .expect("claim wins");

    let stolen = runtime.block_on(store.heartbeat(&task_key, &intruder, deadline));
    let running = runtime
        .block_on(store.mark_running(&task_key, &holder))
        .expect("holder marks running");
    let renewed = runtime
        .block_on(store.heartbeat(&task_key, &holder, lease_deadline(Utc::now(), LEASE)))
        .expect("holder renews");
    let released = runtime
        .block_on(store.release(&task_key, &holder))
        .expect("holder releases");
    let released_twice = runtime.block_on(store.release(&task_key, &holder));

    assert!(matches!(stolen, Err(StoreError::ClaimLost { .. })));
    assert_eq!(running.state(), DispatchState::Running);
    assert!(renewed.lease_expires_at().is_some());
    assert_eq!(released.state(), DispatchState::Pending);
    assert!(matches!(released_twice, Err(StoreError::ClaimLost { .. })));
}

#[rstest]
fn cancel_flag_survives_until_the_entry_is_removed(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("queue_cancel");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let task_key = enqueue(&runtime, &store, 4);

    let flagged = runtime
        .block_on(store.request_cancel(&task_key))
        .expect("cancel query succeeds")
        .expect("entry present");
    runtime
        .block_on(store.remove_entry(&task_key))
        .expect("remove succeeds");
    let gone = runtime
        .block_on(store.find_entry(&task_key))
        .expect("lookup succeeds");
    let after_removal = runtime
        .block_on(store.request_cancel(&task_key))
        .expect("cancel query succeeds");
    let orphan = runtime.block_on(store.insert_entry(&QueueEntry::pending(key(5), Utc::now())));

    assert!(flagged.cancel_requested());
    assert!(gone.is_none());
    assert!(after_removal.is_none());
    assert!(orphan.is_err(), "entry without a task row must be refused");
}
