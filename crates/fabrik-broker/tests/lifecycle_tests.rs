//! Director instance lifecycle tests: dispatch, polling and finalize.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::Utc;
use fabrik_broker::backend::{
    NetworkSegmentAllocator, PLATFORM_CONTEXT_KEY, TaskState, deployment_name,
};
use fabrik_broker::controller::EventOutcome;
use fabrik_broker::lifecycle::operation::{OperationState, OperationStatus};
use fabrik_broker::lifecycle::poller::PollOutcome;
use fabrik_broker::scheduler::{JobType, Scheduler};
use fabrik_broker::sub_operation::FabrikOperation;
use fabrik_core::lock::POLL_ANNOTATION;
use fabrik_core::resource::{ResourceRef, ResourceState, ResourceType};
use fabrik_core::store::ResourceStore;
use fabrik_core::token::{OperationDescriptor, OperationTokenConfig, sign_operation_token};
use fabrik_test_utils::{
    DirectorCall, RecordingPlatformClient, TENANT_ID, TOKEN_SECRET, TestBroker, create_resource,
    instance_options, test_config,
};
use serde_json::{Value, json};

async fn director_resource(
    env: &TestBroker,
    guid: &str,
    options: &Value,
    state: ResourceState,
) -> ResourceRef {
    create_resource(
        env.store.as_ref(),
        ResourceType::director(),
        guid,
        options,
        state,
    )
    .await
    .expect("create director resource")
}

async fn dispatch(env: &TestBroker, reference: &ResourceRef) -> EventOutcome {
    let snapshot = env.store.get(reference).await.expect("get");
    env.deployment_controller()
        .handle_event(&snapshot)
        .await
        .expect("handle event")
}

fn token(name: &str, arguments: Value) -> String {
    let descriptor = OperationDescriptor {
        name: name.to_string(),
        guid: "7f3c6d1e-6c1b-4c5e-9a53-2b4c1f0e9d11".to_string(),
        username: Some("admin".to_string()),
        useremail: Some("admin@example.com".to_string()),
        arguments,
    };
    sign_operation_token(&OperationTokenConfig::new(TOKEN_SECRET), &descriptor, Utc::now())
        .expect("sign token")
}

#[tokio::test]
async fn create_runs_to_success_and_schedules_jobs() {
    let env = TestBroker::new("broker-a");
    env.director.fail_property_writes(2);
    let guid = "i-create";
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({"size": 1})),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);
    let dispatched = env.store.get(&reference).await.unwrap();
    assert_eq!(dispatched.state(), ResourceState::InProgress);
    assert_eq!(dispatched.status.result.as_ref().unwrap()["response"]["type"], "create");

    let outcome = env.context().pollers.wait(guid).await;
    assert_eq!(outcome, Some(PollOutcome::Completed(OperationState::Succeeded)));

    // Two transient failures, then the write that sticks.
    assert_eq!(env.director.count("create_deployment_property"), 3);
    let deployment = deployment_name(1, guid);
    let stored_context: Value =
        serde_json::from_str(&env.director.property(&deployment, PLATFORM_CONTEXT_KEY).unwrap()).unwrap();
    assert_eq!(stored_context["platform"], "cloudfoundry");
    assert_eq!(env.platform.calls(), vec!["post_instance_provision_operations"]);

    let backup = env
        .scheduler
        .get_schedule(guid, JobType::ScheduledBackup)
        .await
        .unwrap()
        .expect("backup job");
    assert_eq!(backup.repeat_interval, "daily");
    assert_eq!(backup.requested_by, "system");
    let update = env
        .scheduler
        .get_schedule(guid, JobType::ServiceInstanceUpdate)
        .await
        .unwrap()
        .expect("update job");
    assert_eq!(update.repeat_interval, "random");
    assert_eq!(update.data["timeZone"], "UTC");

    let finished = env.store.get(&reference).await.unwrap();
    assert_eq!(finished.state(), ResourceState::Succeeded);
    assert!(finished.status.last_operation.clone().unwrap().contains("succeeded"));
    assert_eq!(finished.status.result.clone().unwrap()["response"]["state"], "succeeded");
}

#[tokio::test]
async fn exhausted_finalize_retries_fail_the_create() {
    let env = TestBroker::new("broker-a");
    env.director.fail_property_writes(3);
    let guid = "i-finalize";
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;

    dispatch(&env, &reference).await;
    let outcome = env.context().pollers.wait(guid).await;
    assert_eq!(outcome, Some(PollOutcome::Completed(OperationState::Failed)));

    let finished = env.store.get(&reference).await.unwrap();
    assert_eq!(finished.state(), ResourceState::Failed);
    let description = finished.status.last_operation.clone().unwrap();
    assert_eq!(
        description,
        format!(
            "Create deployment '{}' not yet completely succeeded because \"backend error: director unavailable\"",
            deployment_name(1, guid)
        )
    );
    assert!(env.scheduler.jobs().unwrap().is_empty());
}

#[tokio::test]
async fn failed_task_is_reported_without_scheduling() {
    let env = TestBroker::new("broker-a");
    env.director.set_task_state(TaskState::Error);
    let guid = "i-error";
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;

    dispatch(&env, &reference).await;
    assert_eq!(
        env.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Failed))
    );
    let finished = env.store.get(&reference).await.unwrap();
    assert_eq!(finished.state(), ResourceState::Failed);
    assert!(finished.status.last_operation.clone().unwrap().contains("failed at"));
    assert!(env.scheduler.jobs().unwrap().is_empty());
}

#[tokio::test]
async fn existing_instance_is_recorded_as_failed() {
    let env = TestBroker::new("broker-a");
    env.director.reject_creates_as_existing();
    let reference = director_resource(
        &env,
        "i-exists",
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Failed);
    assert_eq!(
        stored.status.result.clone().unwrap()["error"]["code"],
        "ServiceInstanceAlreadyExists"
    );
    assert!(!env.context().pollers.is_polling("i-exists"));
}

#[tokio::test]
async fn token_update_runs_the_named_sub_operation() {
    let env = TestBroker::new("broker-a");
    let guid = "i-subop";
    env.provision_segment(guid).await;
    env.director.set_sub_operation_response(json!({ "backup_guid": "b-77", "state": "ignored" }));
    let parameters = json!({ "service-fabrik-operation": token("backup", json!({ "a": 1 })) });
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", parameters),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);

    let invoked: Vec<_> = env
        .director
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DirectorCall::InvokeSubOperation(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(invoked.len(), 1);
    assert_eq!(invoked[0].name, "backup");
    assert_eq!(invoked[0].arguments, json!({ "a": 1 }));
    assert_eq!(invoked[0].deployment, deployment_name(1, guid));
    assert_eq!(env.director.count("create_or_update_deployment"), 0);
    assert_eq!(env.director.count("verify_deployment_lock_status"), 1);

    let dispatched = env.store.get(&reference).await.unwrap();
    let response = &dispatched.status.result.as_ref().unwrap()["response"];
    assert_eq!(response["subtype"], "backup");
    assert_eq!(response["backup_guid"], "b-77");
    assert_eq!(response["username"], "admin");

    assert_eq!(
        env.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Succeeded))
    );
    assert!(env.director.count("sub_operation_state") >= 1);
    assert_eq!(env.director.count("get_task"), 0);
}

#[tokio::test]
async fn plain_update_carries_token_arguments() {
    let env = TestBroker::new("broker-a");
    let guid = "i-update";
    env.provision_segment(guid).await;
    let parameters = json!({
        "size": 2,
        "service-fabrik-operation": token("update", json!({ "restart": true })),
    });
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", parameters),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);
    let request = env
        .director
        .calls()
        .into_iter()
        .find_map(|call| match call {
            DirectorCall::CreateOrUpdate { request, .. } => Some(request),
            _ => None,
        })
        .expect("update submitted");
    assert_eq!(request.arguments, Some(json!({ "restart": true })));
    assert_eq!(request.parameters, json!({ "size": 2 }));

    assert_eq!(
        env.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Succeeded))
    );
    assert_eq!(env.platform.calls(), vec!["post_instance_update_operations"]);
}

#[tokio::test]
async fn unlock_skips_the_deployment_lock_check() {
    let env = TestBroker::new("broker-a");
    env.director.lock_deployments("backup b-1");
    let guid = "i-unlock";
    env.provision_segment(guid).await;
    let parameters = json!({ "service-fabrik-operation": token("unlock", json!({})) });
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", parameters),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);
    assert_eq!(env.director.count("verify_deployment_lock_status"), 0);
    assert_eq!(env.director.count("invoke_sub_operation"), 1);
}

#[tokio::test]
async fn locked_deployment_rejects_sub_operation() {
    let env = TestBroker::new("broker-a");
    env.director.lock_deployments("restore r-1");
    let guid = "i-locked";
    env.provision_segment(guid).await;
    let parameters = json!({ "service-fabrik-operation": token("backup", json!({})) });
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", parameters),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Failed);
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Failed);
    assert_eq!(stored.status.error.clone().unwrap()["code"], "DeploymentAlreadyLocked");
    assert_eq!(env.director.count("invoke_sub_operation"), 0);
}

#[tokio::test]
async fn forged_token_is_rejected() {
    let env = TestBroker::new("broker-a");
    let guid = "i-forged";
    env.provision_segment(guid).await;
    let descriptor = OperationDescriptor {
        name: "backup".into(),
        guid: "g".into(),
        username: None,
        useremail: None,
        arguments: json!({}),
    };
    let forged = sign_operation_token(
        &OperationTokenConfig::new("some-other-secret-value-entirely-000"),
        &descriptor,
        Utc::now(),
    )
    .unwrap();
    let parameters = json!({ "service-fabrik-operation": forged });
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", parameters),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Failed);
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.status.error.clone().unwrap()["code"], "InvalidToken");
    assert_eq!(env.director.count("invoke_sub_operation"), 0);
    assert_eq!(env.director.count("create_or_update_deployment"), 0);
}

#[tokio::test]
async fn delete_cleans_up_and_releases_the_segment() {
    let env = TestBroker::new("broker-a");
    let guid = "i-delete";
    env.provision_segment(guid).await;
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({})),
        ResourceState::Delete,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);
    let calls = env.director.calls();
    assert!(calls.contains(&DirectorCall::DeleteRestoreFile {
        tenant_id: TENANT_ID.to_string(),
        instance_guid: guid.to_string(),
    }));
    assert_eq!(env.director.count("delete_deployment"), 1);
    assert!(env.platform.calls().contains(&"pre_instance_delete_operations"));

    assert_eq!(
        env.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Succeeded))
    );
    assert!(env.segments.find(guid).await.unwrap_err().is_not_found());
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.status.result.clone().unwrap()["response"]["context"]["platform"], "cloudfoundry");
}

#[tokio::test]
async fn abort_stops_polling() {
    let env = TestBroker::new("broker-a");
    env.director.set_task_state(TaskState::Processing);
    let guid = "i-abort";
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;

    dispatch(&env, &reference).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    env.store.update_state(&reference, ResourceState::Abort).await.unwrap();

    assert_eq!(env.context().pollers.wait(guid).await, Some(PollOutcome::Cancelled));
    assert!(env.director.count("get_task") >= 1);
}

#[tokio::test]
async fn polling_gives_up_after_max_duration() {
    let mut config = test_config("broker-a");
    config.max_poll_duration_secs = 1;
    let env = TestBroker::with_config(config);
    env.director.set_task_state(TaskState::Processing);
    let guid = "i-timeout";
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;

    dispatch(&env, &reference).await;
    assert_eq!(env.context().pollers.wait(guid).await, Some(PollOutcome::TimedOut));
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Failed);
    assert!(stored.status.last_operation.clone().unwrap().contains("did not complete"));
}

#[tokio::test]
async fn another_broker_resumes_an_orphaned_poll() {
    let mut config = test_config("broker-a");
    config.lock_timeout_secs = 1;
    let a = TestBroker::with_config(config);
    a.director.set_task_state(TaskState::Processing);
    let guid = "i-resume";
    let reference = director_resource(
        &a,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;
    dispatch(&a, &reference).await;
    // Broker A dies mid-poll; its claim stays behind until the lease lapses.
    assert!(a.context().pollers.cancel(guid));

    let mut config = test_config("broker-b");
    config.lock_timeout_secs = 1;
    let b = TestBroker::sharing(a.store.clone(), a.director.clone(), config);
    a.director.set_task_state(TaskState::Done);
    assert_eq!(b.broker.resume_polling().await.unwrap(), 0);
    assert!(!b.context().pollers.is_polling(guid));

    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    assert_eq!(b.broker.resume_polling().await.unwrap(), 1);
    assert_eq!(
        b.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Succeeded))
    );
    let finished = a.store.get(&reference).await.unwrap();
    assert_eq!(finished.state(), ResourceState::Succeeded);
    assert!(finished.annotation(POLL_ANNOTATION).is_none());
}

#[tokio::test]
async fn live_poll_is_not_resumed_elsewhere() {
    let a = TestBroker::new("broker-a");
    a.director.set_task_state(TaskState::Processing);
    let guid = "i-live";
    let reference = director_resource(
        &a,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;
    dispatch(&a, &reference).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // A second broker starting up while A is still polling.
    let b = TestBroker::sharing(a.store.clone(), a.director.clone(), test_config("broker-b"));
    assert_eq!(b.broker.resume_polling().await.unwrap(), 0);
    assert!(!b.context().pollers.is_polling(guid));

    a.director.set_task_state(TaskState::Done);
    assert_eq!(
        a.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Succeeded))
    );
    assert_eq!(b.context().pollers.wait(guid).await, None);

    // Finalize ran exactly once, on the polling broker.
    assert_eq!(a.director.count("create_deployment_property"), 1);
    assert_eq!(a.platform.calls(), vec!["post_instance_provision_operations"]);
    assert!(b.platform.calls().is_empty());
    let finished = a.store.get(&reference).await.unwrap();
    assert_eq!(finished.state(), ResourceState::Succeeded);
    assert!(finished.annotation(POLL_ANNOTATION).is_none());
}

#[tokio::test]
async fn poll_stops_when_its_claim_is_taken_over() {
    let a = TestBroker::new("broker-a");
    a.director.set_task_state(TaskState::Processing);
    let guid = "i-fenced";
    let reference = director_resource(
        &a,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;
    dispatch(&a, &reference).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let b = TestBroker::sharing(a.store.clone(), a.director.clone(), test_config("broker-b"));
    let claim = b
        .context()
        .poll_lock
        .take_over(&reference, Some("update".into()))
        .await
        .unwrap();

    assert_eq!(a.context().pollers.wait(guid).await, Some(PollOutcome::Cancelled));
    let stored = a.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::InProgress);
    // The fenced-out poller left the new holder's claim in place.
    assert_eq!(b.context().poll_lock.holder(&stored), Some(claim));
}

#[tokio::test]
async fn unrecorded_dispatch_keeps_the_task_id() {
    let env = TestBroker::new("broker-a");
    env.store.fail_result_writes(1);
    let guid = "i-unrecorded";
    let reference = director_resource(
        &env,
        guid,
        &instance_options("create", json!({})),
        ResourceState::InQueue,
    )
    .await;

    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Failed);
    assert_eq!(env.director.count("create_or_update_deployment"), 1);
    assert!(!env.context().pollers.is_polling(guid));

    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Failed);
    let error = stored.status.error.clone().expect("error recorded");
    assert_eq!(error["code"], "BackendError");
    let message = error["message"].as_str().unwrap();
    assert!(message.contains("task 'task-1'"), "{message}");
    assert!(message.contains(&deployment_name(1, guid)), "{message}");
    assert!(message.contains("injected write failure"), "{message}");
    assert!(stored.annotation(POLL_ANNOTATION).is_none());
}

#[tokio::test]
async fn sub_operation_failure_is_reported() {
    let env = TestBroker::new("broker-a");
    env.director.set_sub_operation_status(OperationStatus {
        state: OperationState::Failed,
        description: "backup failed: disk full".into(),
    });
    let guid = "i-subfail";
    env.provision_segment(guid).await;
    let parameters = json!({ "service-fabrik-operation": token("backup", json!({})) });
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", parameters),
        ResourceState::InQueue,
    )
    .await;

    dispatch(&env, &reference).await;
    assert_eq!(
        env.context().pollers.wait(guid).await,
        Some(PollOutcome::Completed(OperationState::Failed))
    );
    let stored = env.store.get(&reference).await.unwrap();
    assert_eq!(stored.state(), ResourceState::Failed);
    assert_eq!(stored.status.last_operation.as_deref(), Some("backup failed: disk full"));
}

#[tokio::test]
async fn requested_sub_operation_reaches_the_director() {
    let env = TestBroker::new("broker-a");
    let guid = "i-requested";
    let index = env.provision_segment(guid).await;
    let client = RecordingPlatformClient::new();
    let config = test_config("broker-a").operation_token;

    let mut request = FabrikOperation::for_deployment("backup", &deployment_name(index, guid))
        .unwrap()
        .with_user("admin", "admin@example.com")
        .with_arguments(json!({ "type": "online" }))
        .with_bearer("user-token");
    let response = request.invoke(&client, &config).await.unwrap();
    assert_eq!(response["name"], "backup");

    let updates = client.updates();
    assert_eq!(updates.len(), 1);
    let (instance_id, update, bearer) = &updates[0];
    assert_eq!(instance_id, guid);
    assert_eq!(bearer.as_deref(), Some("user-token"));
    assert!(!update.synchronous);

    // The platform forwards the update parameters to the broker unchanged.
    let reference = director_resource(
        &env,
        guid,
        &instance_options("update", update.parameters.clone()),
        ResourceState::InQueue,
    )
    .await;
    assert_eq!(dispatch(&env, &reference).await, EventOutcome::Processed);
    let invoked = env
        .director
        .calls()
        .into_iter()
        .find_map(|call| match call {
            DirectorCall::InvokeSubOperation(request) => Some(request),
            _ => None,
        })
        .expect("sub-operation invoked");
    assert_eq!(Some(invoked.guid.as_str()), request.guid());
    assert_eq!(invoked.arguments, json!({ "type": "online" }));
    assert_eq!(invoked.useremail.as_deref(), Some("admin@example.com"));
}

#[tokio::test]
async fn busy_instance_rejects_the_request_as_conflict() {
    let client = RecordingPlatformClient::new();
    client.reject_as_in_progress();
    let config = test_config("broker-a").operation_token;

    let mut request = FabrikOperation::new("unlock", "i-busy");
    let err = request.invoke(&client, &config).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(client.updates().len(), 1);
}
