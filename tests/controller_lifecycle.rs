//! End-to-end tests driving factory-built controllers through the in-memory fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;

use kube_operator_runtime::conditions::{
    find_operator_condition, handle_error_conditions, ConditionStatus, OperatorStatus,
    REASON_AS_EXPECTED,
};
use kube_operator_runtime::config::ControllerManagerConfig;
use kube_operator_runtime::controller::{CancellationToken, Controller};
use kube_operator_runtime::controller_manager::ControllerManager;
use kube_operator_runtime::errors::{ConditionError, SyncError};
use kube_operator_runtime::factory::Factory;
use kube_operator_runtime::informer::{DeletedFinalStateUnknown, DynObject, Informer};
use kube_operator_runtime::sync_context::{SyncContext, DEFAULT_QUEUE_KEY};
use kube_operator_runtime::testing::{EventType, FakeInformer, FakeOperatorClient, InMemoryRecorder};

const KNOWN_CONDITIONS: [&str; 2] = ["ConfigMapDegraded", "PayloadAvailable"];

fn config_map(name: &str, payload: &str) -> DynObject {
    Arc::new(ConfigMap {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some([("payload".to_string(), payload.to_string())].into()),
        ..Default::default()
    })
}

fn namespace(name: &str) -> DynObject {
    Arc::new(Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Fails with a typed Available error while the payload is "broken".
fn check_payload(ctx: &SyncContext) -> Result<(), SyncError> {
    let Some(config_map) = ctx
        .queue_object()
        .and_then(|obj| obj.downcast_ref::<ConfigMap>())
    else {
        return Ok(());
    };

    let payload = config_map
        .data
        .as_ref()
        .and_then(|data| data.get("payload"))
        .map(String::as_str)
        .unwrap_or_default();
    if payload == "broken" {
        return Err(ConditionError::unavailable(
            "PayloadAvailable",
            "Broken",
            format!("{} has a broken payload", ctx.queue_key()),
        )
        .into());
    }

    ctx.recorder()
        .event("PayloadObserved", &format!("{} payload {payload}", ctx.queue_key()));
    Ok(())
}

async fn wait_for_status(
    client: &FakeOperatorClient,
    done: impl Fn(&OperatorStatus) -> bool,
) -> OperatorStatus {
    for _ in 0..1000 {
        let status = client.status();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never converged: {:?}", client.status());
}

fn condition_is(status: &OperatorStatus, condition_type: &str, expected: ConditionStatus) -> bool {
    find_operator_condition(&status.conditions, condition_type)
        .is_some_and(|condition| condition.status == expected)
}

#[tokio::test(start_paused = true)]
async fn test_queued_objects_drive_operator_conditions() {
    let informer = Arc::new(FakeInformer::new());
    let client = Arc::new(FakeOperatorClient::new());
    let recorder = Arc::new(InMemoryRecorder::new());

    let status_client = Arc::clone(&client);
    let controller = Factory::new()
        .with_queued_objects()
        .with_informers([informer.clone() as Arc<dyn Informer>])
        .with_sync(move |_cancel, ctx: SyncContext| {
            let client = Arc::clone(&status_client);
            async move {
                let result = check_payload(&ctx);
                handle_error_conditions(client.as_ref(), "ConfigMap", &KNOWN_CONDITIONS, result)
                    .await
            }
        })
        .to_controller("ConfigMap", recorder.clone());

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.run(2, cancel).await }
    });

    let healthy = config_map("app", "v1");
    informer.add(healthy.clone());
    let status = wait_for_status(&client, |s| {
        condition_is(s, "PayloadAvailable", ConditionStatus::True)
    })
    .await;
    let degraded = find_operator_condition(&status.conditions, "ConfigMapDegraded").unwrap();
    assert_eq!(degraded.status, ConditionStatus::False);
    assert_eq!(degraded.reason, REASON_AS_EXPECTED);

    let broken = config_map("app", "broken");
    informer.update(healthy, broken.clone());
    let status = wait_for_status(&client, |s| {
        condition_is(s, "PayloadAvailable", ConditionStatus::False)
    })
    .await;
    let available = find_operator_condition(&status.conditions, "PayloadAvailable").unwrap();
    assert_eq!(available.reason, "Broken");
    assert_eq!(available.message, "default/app has a broken payload");

    informer.update(broken, config_map("app", "v2"));
    wait_for_status(&client, |s| {
        condition_is(s, "PayloadAvailable", ConditionStatus::True)
    })
    .await;

    cancel.cancel();
    run.await.unwrap().unwrap();

    let observed: Vec<String> = recorder
        .events()
        .into_iter()
        .filter(|event| event.event_type == EventType::Normal)
        .map(|event| event.message)
        .collect();
    assert!(observed.contains(&"default/app payload v1".to_string()), "{observed:?}");
    assert!(observed.contains(&"default/app payload v2".to_string()), "{observed:?}");
    assert!(controller.sync_context().queue().shutting_down());
}

#[tokio::test(start_paused = true)]
async fn test_namespace_tombstone_triggers_sync() {
    let informer = Arc::new(FakeInformer::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let controller = Factory::new()
        .with_namespace_informer(informer.clone(), ["openshift-etcd"])
        .with_sync(move |_cancel, ctx: SyncContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.queue_key().to_string());
                Ok::<_, SyncError>(())
            }
        })
        .to_controller("Namespaces", Arc::new(InMemoryRecorder::new()));

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.run(1, cancel).await }
    });

    informer.delete_final_state_unknown(DeletedFinalStateUnknown::new(namespace("other")));
    informer.delete_final_state_unknown(DeletedFinalStateUnknown::new(namespace("openshift-etcd")));

    let key = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, DEFAULT_QUEUE_KEY);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_manager_runs_factory_controllers_until_shutdown() {
    let config = ControllerManagerConfig::from_yaml("workers: 2\nresyncInterval: 1s\n").unwrap();
    let mut manager = ControllerManager::new(&config);

    let mut counters = Vec::new();
    for name in ["First", "Second"] {
        let syncs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&syncs);
        let controller = Factory::new()
            .with_sync(move |_cancel, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, SyncError>(()) }
            })
            .resync_every(config.resync_interval)
            .to_controller(name, Arc::new(InMemoryRecorder::new()));
        manager.add_controller(Arc::new(controller), config.workers);
        counters.push(syncs);
    }

    let token = manager.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        token.cancel();
    });
    manager.run().await.unwrap();

    for syncs in counters {
        assert!(syncs.load(Ordering::SeqCst) >= 3);
    }
}
