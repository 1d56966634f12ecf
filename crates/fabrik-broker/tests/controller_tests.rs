//! Operation controller tests for backup, restore and binding resources.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fabrik_broker::controller::{
    EventOutcome, HandlerOutcome, OperationController, ResourceHandler, SkipReason,
};
use fabrik_broker::watcher::StatePredicate;
use fabrik_broker::scheduler::{JobType, Scheduler};
use fabrik_core::lock::{LOCK_ANNOTATION, LockInfo, ResourceLock};
use fabrik_core::resource::{DEFAULT_NAMESPACE, Resource, ResourceRef, ResourceState, ResourceType};
use fabrik_core::store::{KeySection, ResourceStore};
use fabrik_test_utils::{PLAIN_PLAN_ID, PLAN_ID, SERVICE_ID, TestBroker, create_resource, init_test_logging};
use serde_json::{Value, json};
use tokio::sync::watch;

fn backup_options(guid: &str, plan_id: &str) -> Value {
    json!({ "guid": guid, "plan_id": plan_id, "instance_guid": "i-1" })
}

async fn backup_in_queue(env: &TestBroker, guid: &str) -> (ResourceRef, Resource) {
    let reference = create_resource(
        env.store.as_ref(),
        ResourceType::default_backup(),
        guid,
        &backup_options(guid, PLAN_ID),
        ResourceState::InQueue,
    )
    .await
    .expect("create backup");
    let snapshot = env.store.get(&reference).await.expect("get");
    (reference, snapshot)
}

#[tokio::test]
async fn in_queue_backup_is_started_and_lock_released() {
    init_test_logging();
    let env = TestBroker::new("broker-a");
    let (reference, snapshot) = backup_in_queue(&env, "b-1").await;

    let outcome = env.backup_controller().handle_event(&snapshot).await.unwrap();
    assert_eq!(outcome, EventOutcome::Processed);

    let calls = env.backups.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "start_backup");
    assert_eq!(calls[0].1, backup_options("b-1", PLAN_ID));

    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::InProgress);
    let result = stored.status.result.clone().expect("result recorded");
    assert_eq!(result["response"]["guid"], "b-1");
    assert_eq!(result["error"], Value::Null);
    assert_eq!(stored.status.extra.get("options"), Some(&backup_options("b-1", PLAN_ID)));
    assert!(stored.annotation(LOCK_ANNOTATION).is_none());
}

#[tokio::test]
async fn live_foreign_lock_means_no_backend_call() {
    let env = TestBroker::new("broker-a");
    let (reference, snapshot) = backup_in_queue(&env, "b-2").await;

    let other = ResourceLock::new(env.store.clone(), "broker-b", Duration::from_secs(120));
    assert!(other.acquire(&reference).await.unwrap());

    let outcome = env.backup_controller().handle_event(&snapshot).await.unwrap();
    assert_eq!(outcome, EventOutcome::Skipped(SkipReason::Locked));
    assert!(env.backups.calls().is_empty());

    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::InQueue);
    let holder = LockInfo::parse(stored.annotation(LOCK_ANNOTATION).unwrap(), &stored);
    assert_eq!(holder.holder_id, "broker-b");
}

#[tokio::test]
async fn stale_lock_is_taken_over() {
    let env = TestBroker::new("broker-a");
    let stale = LockInfo {
        holder_id: "crashed-broker".into(),
        acquired_at: Utc::now() - chrono::Duration::minutes(10),
        sequence_number: 4,
        operation: Some("in_queue".into()),
    };
    let reference = ResourceRef::new(ResourceType::default_backup(), DEFAULT_NAMESPACE, "b-3");
    let resource = Resource::new(&reference, &backup_options("b-3", PLAN_ID))
        .unwrap()
        .with_annotation(LOCK_ANNOTATION, serde_json::to_string(&stale).unwrap());
    let snapshot = env.store.create(resource).await.unwrap();

    let outcome = env.backup_controller().handle_event(&snapshot).await.unwrap();
    assert_eq!(outcome, EventOutcome::Processed);
    assert_eq!(env.backups.calls().len(), 1);
    let stored = env.store.get(&reference).await.unwrap();
    assert!(stored.annotation(LOCK_ANNOTATION).is_none());
}

#[tokio::test]
async fn redelivered_event_is_a_no_op() {
    let env = TestBroker::new("broker-a");
    let (_, snapshot) = backup_in_queue(&env, "b-4").await;
    let controller = env.backup_controller();

    assert_eq!(controller.handle_event(&snapshot).await.unwrap(), EventOutcome::Processed);
    assert_eq!(
        controller.handle_event(&snapshot).await.unwrap(),
        EventOutcome::Skipped(SkipReason::StateChanged)
    );
    assert_eq!(env.backups.calls().len(), 1);
}

#[tokio::test]
async fn unwatched_state_is_skipped_without_locking() {
    let env = TestBroker::new("broker-a");
    let reference = create_resource(
        env.store.as_ref(),
        ResourceType::default_backup(),
        "b-5",
        &backup_options("b-5", PLAN_ID),
        ResourceState::Succeeded,
    )
    .await
    .unwrap();
    let snapshot = env.store.get(&reference).await.unwrap();
    let version = snapshot.metadata.resource_version;

    let outcome = env.backup_controller().handle_event(&snapshot).await.unwrap();
    assert_eq!(outcome, EventOutcome::Skipped(SkipReason::StateNotWatched));
    assert_eq!(env.store.get(&reference).await.unwrap().metadata.resource_version, version);
}

#[tokio::test]
async fn abort_reuses_the_options_the_backup_started_with() {
    let env = TestBroker::new("broker-a");
    let (reference, snapshot) = backup_in_queue(&env, "b-6").await;
    let controller = env.backup_controller();
    controller.handle_event(&snapshot).await.unwrap();

    let aborting = env.store.update_state(&reference, ResourceState::Abort).await.unwrap();
    assert_eq!(controller.handle_event(&aborting).await.unwrap(), EventOutcome::Processed);

    let calls = env.backups.calls();
    assert_eq!(calls[1].0, "abort_last_backup");
    assert_eq!(calls[1].1, backup_options("b-6", PLAN_ID));
    assert_eq!(
        env.store.get(&reference).await.unwrap().state(),
        ResourceState::Aborting
    );
}

#[tokio::test]
async fn delete_removes_backup_and_resource() {
    let env = TestBroker::new("broker-a");
    let (reference, snapshot) = backup_in_queue(&env, "b-7").await;
    let controller = env.backup_controller();
    controller.handle_event(&snapshot).await.unwrap();

    let deleting = env.store.update_state(&reference, ResourceState::Delete).await.unwrap();
    // The lock release that follows hits a missing resource and is swallowed.
    assert_eq!(controller.handle_event(&deleting).await.unwrap(), EventOutcome::Processed);

    assert_eq!(env.backups.calls()[1].0, "delete_backup");
    assert!(env.store.get(&reference).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn backend_failure_is_recorded_and_lock_released() {
    let env = TestBroker::new("broker-a");
    env.backups.fail_with("agent unreachable");
    let (reference, snapshot) = backup_in_queue(&env, "b-8").await;

    let outcome = env.backup_controller().handle_event(&snapshot).await.unwrap();
    assert_eq!(outcome, EventOutcome::Failed);

    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Failed);
    let error = stored.status.error.clone().expect("error recorded");
    assert_eq!(error["code"], "BackendError");
    assert!(error["message"].as_str().unwrap().contains("agent unreachable"));
    assert!(stored.annotation(LOCK_ANNOTATION).is_none());
}

#[tokio::test]
async fn plan_without_backup_support_fails_the_resource() {
    let env = TestBroker::new("broker-a");
    let reference = create_resource(
        env.store.as_ref(),
        ResourceType::default_backup(),
        "b-9",
        &backup_options("b-9", PLAIN_PLAN_ID),
        ResourceState::InQueue,
    )
    .await
    .unwrap();
    let snapshot = env.store.get(&reference).await.unwrap();

    assert_eq!(
        env.backup_controller().handle_event(&snapshot).await.unwrap(),
        EventOutcome::Failed
    );
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(
        stored.status.error.clone().unwrap()["code"],
        "FeatureNotSupportedByAnyAgent"
    );
    assert!(env.backups.calls().is_empty());
}

#[tokio::test]
async fn restore_starts_and_aborts() {
    let env = TestBroker::new("broker-a");
    let options = json!({ "guid": "r-1", "plan_id": PLAN_ID, "backup_guid": "b-1" });
    let reference = create_resource(
        env.store.as_ref(),
        ResourceType::default_restore(),
        "r-1",
        &options,
        ResourceState::InQueue,
    )
    .await
    .unwrap();
    let controller = env.restore_controller();

    let snapshot = env.store.get(&reference).await.unwrap();
    assert_eq!(controller.handle_event(&snapshot).await.unwrap(), EventOutcome::Processed);
    assert_eq!(env.store.get(&reference).await.unwrap().state(), ResourceState::InProgress);

    let aborting = env.store.update_state(&reference, ResourceState::Abort).await.unwrap();
    assert_eq!(controller.handle_event(&aborting).await.unwrap(), EventOutcome::Processed);

    let names: Vec<_> = env.backups.calls().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["start_restore", "abort_last_restore"]);
    assert_eq!(env.store.get(&reference).await.unwrap().state(), ResourceState::Aborting);
}

#[tokio::test]
async fn bind_returns_credentials_and_schedules_backup() {
    let env = TestBroker::new("broker-a");
    env.provision_segment("i-10").await;
    let options = json!({
        "instance_id": "i-10",
        "plan_id": PLAN_ID,
        "service_id": SERVICE_ID,
        "binding_id": "bind-1",
        "parameters": {},
        "context": { "platform": "cloudfoundry" },
    });
    let reference = create_resource(
        env.store.as_ref(),
        ResourceType::director_bind(),
        "bind-1",
        &options,
        ResourceState::InQueue,
    )
    .await
    .unwrap();
    let controller = env.bind_controller();

    let snapshot = env.store.get(&reference).await.unwrap();
    assert_eq!(controller.handle_event(&snapshot).await.unwrap(), EventOutcome::Processed);

    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Succeeded);
    assert_eq!(stored.status.result.clone().unwrap()["response"]["username"], "admin");
    assert_eq!(env.director.count("create_binding"), 1);
    let job = env
        .scheduler
        .get_schedule("i-10", JobType::ScheduledBackup)
        .await
        .unwrap()
        .expect("backup scheduled");
    assert_eq!(job.repeat_interval, "daily");
    assert_eq!(job.data["instance_id"], "i-10");

    let deleting = env.store.update_state(&reference, ResourceState::Delete).await.unwrap();
    assert_eq!(controller.handle_event(&deleting).await.unwrap(), EventOutcome::Processed);
    assert_eq!(env.director.count("delete_binding"), 1);
    assert!(env.store.get(&reference).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn bind_with_mismatched_service_fails() {
    let env = TestBroker::new("broker-a");
    env.provision_segment("i-11").await;
    let options = json!({
        "instance_id": "i-11",
        "plan_id": PLAN_ID,
        "service_id": "some-other-service",
        "binding_id": "bind-2",
    });
    let reference = create_resource(
        env.store.as_ref(),
        ResourceType::director_bind(),
        "bind-2",
        &options,
        ResourceState::InQueue,
    )
    .await
    .unwrap();

    let snapshot = env.store.get(&reference).await.unwrap();
    assert_eq!(
        env.bind_controller().handle_event(&snapshot).await.unwrap(),
        EventOutcome::Failed
    );
    assert_eq!(env.director.count("create_binding"), 0);
}

#[tokio::test]
async fn concurrent_brokers_start_a_backup_once() {
    let a = TestBroker::new("broker-a");
    let b = TestBroker::sharing(
        a.store.clone(),
        a.director.clone(),
        fabrik_test_utils::test_config("broker-b"),
    );
    let (_, snapshot) = backup_in_queue(&a, "b-12").await;

    let ca = Arc::new(a.backup_controller());
    let cb = Arc::new(b.backup_controller());
    let (sa, sb) = (snapshot.clone(), snapshot);
    let (ra, rb) = tokio::join!(
        tokio::spawn({
            let ca = Arc::clone(&ca);
            async move { ca.handle_event(&sa).await }
        }),
        tokio::spawn({
            let cb = Arc::clone(&cb);
            async move { cb.handle_event(&sb).await }
        }),
    );
    let outcomes = [ra.unwrap().unwrap(), rb.unwrap().unwrap()];

    assert_eq!(
        outcomes.iter().filter(|o| **o == EventOutcome::Processed).count(),
        1
    );
    assert_eq!(a.backups.calls().len() + b.backups.calls().len(), 1);
}

/// Reports a conflict for every resource it is handed.
#[derive(Default)]
struct AlwaysConflicting {
    calls: AtomicUsize,
}

#[async_trait]
impl ResourceHandler for AlwaysConflicting {
    fn name(&self) -> &'static str {
        "always-conflicting"
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::default_backup()
    }

    fn predicate(&self) -> StatePredicate {
        StatePredicate::any_of([ResourceState::InQueue, ResourceState::Delete])
    }

    async fn process(&self, _resource: &Resource) -> fabrik_broker::error::Result<HandlerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(fabrik_core::Error::conflict("deployment busy").into())
    }
}

fn conflicting_controller(
    env: &TestBroker,
    handler: Arc<AlwaysConflicting>,
) -> OperationController<dyn ResourceStore> {
    let store: Arc<dyn ResourceStore> = env.store.clone();
    let lock = ResourceLock::new(Arc::clone(&store), "broker-a", Duration::from_secs(120));
    OperationController::new(store, lock, handler)
}

#[tokio::test]
async fn conflicting_resource_is_parked_until_it_changes() {
    init_test_logging();
    let env = TestBroker::new("broker-a");
    let handler = Arc::new(AlwaysConflicting::default());
    let controller = Arc::new(conflicting_controller(&env, Arc::clone(&handler)));
    let (stop, shutdown) = watch::channel(false);
    let run = tokio::spawn(controller.watcher(DEFAULT_NAMESPACE).run(controller.clone(), shutdown));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (reference, _) = backup_in_queue(&env, "b-busy").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // Nothing keeps writing to the parked resource.
    let parked = env.store.get(&reference).await.unwrap();
    assert!(parked.annotation(LOCK_ANNOTATION).is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let still = env.store.get(&reference).await.unwrap();
    assert_eq!(still.metadata.resource_version, parked.metadata.resource_version);

    // Unrelated writes do not re-drive it either.
    env.store
        .update_key(&reference, KeySection::Annotations, "note", json!("hello"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // A state change does.
    env.store.update_state(&reference, ResourceState::Delete).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    stop.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn parked_resource_is_retried_after_the_delay() {
    let env = TestBroker::new("broker-a");
    let handler = Arc::new(AlwaysConflicting::default());
    let controller = conflicting_controller(&env, Arc::clone(&handler))
        .with_conflict_retry_after(Duration::from_millis(50));
    let (_, snapshot) = backup_in_queue(&env, "b-retry").await;

    assert_eq!(
        controller.handle_event(&snapshot).await.unwrap(),
        EventOutcome::Skipped(SkipReason::Conflict)
    );
    assert_eq!(
        controller.handle_event(&snapshot).await.unwrap(),
        EventOutcome::Skipped(SkipReason::Unchanged)
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        controller.handle_event(&snapshot).await.unwrap(),
        EventOutcome::Skipped(SkipReason::Conflict)
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}
