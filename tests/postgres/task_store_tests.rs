//! Task documents, optimistic versions, counters, and review notifications.

use super::helpers::{CleanupGuard, build_task, database_name, key, setup_store, test_runtime};
use chrono::{TimeZone, Utc};
use mockable::DefaultClock;
use pg_embedded_setup_unpriv::{TestCluster, test_support::shared_test_cluster};
use pipewright::pipeline::{
    domain::{PipelineName, ReviewNotification, ReviewRef, Status},
    ports::{ReviewNotificationStore, StoreError, TaskStore},
};
use rstest::rstest;

#[rstest]
fn inserted_task_is_found_with_version_one(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("task_insert");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let task = build_task(1);

    let stored = runtime
        .block_on(store.insert_task(&task))
        .expect("insert succeeds");
    let found = runtime
        .block_on(store.find_task(task.key()))
        .expect("lookup succeeds")
        .expect("task present");
    let missing = runtime
        .block_on(store.find_task(&key(99)))
        .expect("lookup succeeds");

    assert_eq!(stored.version(), 1);
    assert_eq!(found, stored);
    assert!(missing.is_none());
}

#[rstest]
fn second_insert_under_the_same_key_is_a_duplicate(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("task_duplicate");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let task = build_task(2);
    runtime
        .block_on(store.insert_task(&task))
        .expect("first insert succeeds");

    let result = runtime.block_on(store.insert_task(&task));

    assert!(matches!(result, Err(StoreError::Duplicate(found)) if found == key(2)));
}

#[rstest]
fn update_from_a_stale_version_conflicts(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("task_version");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let stored = runtime
        .block_on(store.insert_task(&build_task(3)))
        .expect("insert succeeds");

    let mut queued = stored.clone();
    queued
        .transition_to(Status::Queued, &DefaultClock)
        .expect("created task can be queued");
    let updated = runtime
        .block_on(store.update_task(&queued))
        .expect("update from current version succeeds");
    let stale = runtime.block_on(store.update_task(&queued));
    let unknown = runtime.block_on(store.update_task(&build_task(4)));
    let reloaded = runtime
        .block_on(store.find_task(&key(3)))
        .expect("lookup succeeds")
        .expect("task present");

    assert_eq!(updated.version(), 2);
    assert!(matches!(
        stale,
        Err(StoreError::VersionConflict { expected: 1, .. })
    ));
    assert!(matches!(unknown, Err(StoreError::NotFound(_))));
    assert_eq!(reloaded.status(), Status::Queued);
    assert_eq!(reloaded.version(), 2);
}

#[rstest]
fn task_ids_count_up_per_pipeline(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("task_counter");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    let checkout = PipelineName::new("checkout").expect("valid name");
    let billing = PipelineName::new("billing").expect("valid name");

    let first = runtime
        .block_on(store.next_task_id(&checkout))
        .expect("allocated");
    let second = runtime
        .block_on(store.next_task_id(&checkout))
        .expect("allocated");
    let other = runtime
        .block_on(store.next_task_id(&billing))
        .expect("allocated");

    assert_eq!(first.value(), 1);
    assert_eq!(second.value(), 2);
    assert_eq!(other.value(), 1);
}

#[rstest]
fn notification_is_replaced_in_place(shared_test_cluster: &'static TestCluster) {
    let db_name = database_name("task_notification");
    let _guard = CleanupGuard::new(shared_test_cluster, db_name.clone());
    let store = setup_store(shared_test_cluster, &db_name, 1).expect("store setup");
    let runtime = test_runtime();
    runtime
        .block_on(store.insert_task(&build_task(5)))
        .expect("insert succeeds");
    let started = Utc
        .with_ymd_and_hms(2024, 5, 2, 8, 0, 0)
        .single()
        .expect("valid timestamp");
    let finished = Utc
        .with_ymd_and_hms(2024, 5, 2, 8, 12, 0)
        .single()
        .expect("valid timestamp");
    let mut notification =
        ReviewNotification::new(key(5), ReviewRef::new(1, "shop/checkout", 42), started);
    notification.record_comment(Some("note-3".to_owned()), Status::Running, started);
    runtime
        .block_on(store.save_notification(&notification))
        .expect("first save succeeds");

    notification.record_comment(None, Status::Passed, finished);
    runtime
        .block_on(store.save_notification(&notification))
        .expect("second save succeeds");
    let found = runtime
        .block_on(store.find_notification(&key(5)))
        .expect("lookup succeeds")
        .expect("notification present");

    assert_eq!(found.comment_id(), Some("note-3"));
    assert_eq!(found.last_status(), Some(Status::Passed));
    assert_eq!(found.updated_at(), finished);
}
