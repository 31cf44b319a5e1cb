//! Worker sandbox bridge: correlation, deadlines, teardown and capability
//! gating of host API calls.

mod common;

use common::{Binder, BrokenInit, Probe, pid};
use futures::future::join_all;
use holofoil_plugin_host::sandbox::{HandlerServices, PluginApiHandlers, create_plugin_api_handlers};
use holofoil_plugin_host::{
    AutoApprove, Capability, PermissionManager, PluginHostError, PolicyEngine, SandboxEvent, SandboxOptions,
    WorkerSandbox, create_worker_sandbox,
};
use holofoil_plugin_sdk::{WorkerInMessage, WorkerOutMessage};
use holofoil_storage::{MemoryKvStore, PluginStorage};
use holofoil_types::TrustTier;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    permissions: Arc<PermissionManager>,
    handlers: Arc<PluginApiHandlers>,
}

impl Fixture {
    fn new() -> Self {
        let handlers = create_plugin_api_handlers(HandlerServices {
            storage: Some(Arc::new(PluginStorage::new(Arc::new(MemoryKvStore::new())))),
            ..Default::default()
        });
        handlers.set_collection_provider(Arc::new(Binder::with_cards(3)));
        Self {
            permissions: Arc::new(PermissionManager::new(
                Arc::new(PolicyEngine::unrestricted()),
                Arc::new(AutoApprove),
            )),
            handlers,
        }
    }

    /// Starts a curated sandbox with `granted` both granted and installed.
    async fn start(&self, id: &str, granted: &[Capability]) -> WorkerSandbox {
        let plugin_id = pid(id);
        self.permissions.register_plugin(&plugin_id, TrustTier::Curated);
        for cap in granted {
            self.permissions.grant_plugin_capability(&plugin_id, *cap).unwrap();
        }
        let options = SandboxOptions::new(plugin_id, TrustTier::Curated)
            .with_capabilities(granted.iter().copied())
            .with_handlers(Arc::clone(&self.handlers));
        create_worker_sandbox(options, Box::new(Probe), Arc::clone(&self.permissions))
            .await
            .unwrap()
    }
}

fn reply_value(message: WorkerOutMessage) -> Value {
    match message {
        WorkerOutMessage::Response { reply, .. } => reply.into_result().unwrap(),
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_requests_get_their_own_replies() {
    let fx = Fixture::new();
    let sandbox = fx.start("curated.probe", &[]).await;

    let calls = (0..32).map(|i| {
        let sandbox = sandbox.clone();
        async move { (i, sandbox.request("echo", json!({ "n": i })).await.unwrap()) }
    });
    for (i, reply) in join_all(calls).await {
        assert_eq!(reply, json!({ "n": i }));
    }
    assert_eq!(sandbox.pending_count(), 0);
    sandbox.terminate();
}

#[tokio::test]
async fn duplicate_id_is_rejected_while_in_flight() {
    let fx = Fixture::new();
    let sandbox = fx.start("curated.probe", &[]).await;

    let slow = sandbox.send(WorkerInMessage::request(9_000, "sleep", json!({ "ms": 200 })));
    let dup = sandbox.send(WorkerInMessage::request(9_000, "echo", json!("second")));
    let (slow, dup) = tokio::join!(slow, dup);

    assert!(matches!(dup, Err(PluginHostError::DuplicateCorrelationId(9_000))));
    assert_eq!(reply_value(slow.unwrap())["ms"], 200);

    // Once answered, the id may be reused.
    let again = sandbox
        .send(WorkerInMessage::request(9_000, "echo", json!("third")))
        .await
        .unwrap();
    assert_eq!(reply_value(again), json!("third"));
    sandbox.terminate();
}

#[tokio::test]
async fn timed_out_id_stays_retired_until_its_late_reply() {
    let fx = Fixture::new();
    let plugin_id = pid("curated.slow");
    fx.permissions.register_plugin(&plugin_id, TrustTier::Curated);
    let mut options = SandboxOptions::new(plugin_id, TrustTier::Curated);
    options.rpc_timeout = Duration::from_millis(50);
    let sandbox = create_worker_sandbox(options, Box::new(Probe), Arc::clone(&fx.permissions))
        .await
        .unwrap();

    let err = sandbox
        .send(WorkerInMessage::request(7, "sleep", json!({ "ms": 300 })))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxTimeout { .. }), "{err:?}");

    let reused = sandbox
        .send(WorkerInMessage::request(7, "echo", json!(null)))
        .await
        .unwrap_err();
    assert!(matches!(reused, PluginHostError::DuplicateCorrelationId(7)));

    // The session survives; the next request is served after the late reply
    // has been discarded.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(sandbox.request("echo", json!("alive")).await.unwrap(), json!("alive"));
    let after = sandbox
        .send(WorkerInMessage::request(7, "echo", json!("reused")))
        .await
        .unwrap();
    assert_eq!(reply_value(after), json!("reused"));
    sandbox.terminate();
}

#[tokio::test]
async fn terminate_rejects_outstanding_calls_and_is_idempotent() {
    let fx = Fixture::new();
    let sandbox = fx.start("curated.probe", &[]).await;
    let mut events = sandbox.subscribe();

    let pending = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.request("sleep", json!({ "ms": 500 })).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sandbox.pending_count(), 1);

    sandbox.terminate();
    sandbox.terminate();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxTerminated(_)), "{err:?}");
    assert!(sandbox.is_terminated());
    assert_eq!(sandbox.pending_count(), 0);
    assert_eq!(events.recv().await.unwrap(), SandboxEvent::Terminated);
    assert!(events.try_recv().is_err());

    let err = sandbox.request("echo", Value::Null).await.unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxTerminated(_)));
}

#[tokio::test]
async fn uninstalled_capability_is_denied() {
    let fx = Fixture::new();
    let sandbox = fx.start("curated.probe", &[Capability::Storage]).await;
    // Granted in the manager but never installed in this sandbox.
    fx.permissions
        .grant_plugin_capability(sandbox.plugin_id(), Capability::CollectionRead)
        .unwrap();

    let err = sandbox.request("list", Value::Null).await.unwrap_err();
    match err {
        PluginHostError::PermissionDenied { capability, .. } => assert_eq!(capability, "collection-read"),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
    sandbox.request("store", json!(1)).await.unwrap();
    assert_eq!(sandbox.request("load", Value::Null).await.unwrap(), json!(1));
    sandbox.terminate();
}

#[tokio::test]
async fn revocation_applies_to_the_next_call() {
    let fx = Fixture::new();
    let sandbox = fx
        .start("curated.probe", &[Capability::Storage, Capability::CollectionRead])
        .await;

    let cards = sandbox.request("list", Value::Null).await.unwrap();
    assert_eq!(cards.as_array().unwrap().len(), 3);

    fx.permissions
        .revoke_plugin_capability(sandbox.plugin_id(), Capability::CollectionRead);
    let err = sandbox.request("list", Value::Null).await.unwrap_err();
    assert!(matches!(err, PluginHostError::PermissionDenied { .. }), "{err:?}");

    assert!(!sandbox.is_terminated());
    sandbox.request("store", json!("still works")).await.unwrap();
    sandbox.terminate();
}

#[tokio::test]
async fn sandbox_without_handlers_denies_every_api() {
    let fx = Fixture::new();
    let plugin_id = pid("curated.bare");
    fx.permissions.register_plugin(&plugin_id, TrustTier::Curated);
    fx.permissions
        .grant_plugin_capability(&plugin_id, Capability::Storage)
        .unwrap();
    let options = SandboxOptions::new(plugin_id, TrustTier::Curated).with_capabilities([Capability::Storage]);
    let sandbox = create_worker_sandbox(options, Box::new(Probe), Arc::clone(&fx.permissions))
        .await
        .unwrap();
    let err = sandbox.request("store", json!(1)).await.unwrap_err();
    assert!(matches!(err, PluginHostError::PermissionDenied { .. }), "{err:?}");
    sandbox.terminate();
}

#[tokio::test]
async fn events_reach_subscribers() {
    let fx = Fixture::new();
    let sandbox = fx.start("curated.probe", &[]).await;
    let mut events = sandbox.subscribe();

    sandbox.request("emit", json!({ "score": 12 })).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        SandboxEvent::Emitted {
            name: "probe.event".into(),
            payload: json!({ "score": 12 }),
        }
    );
    sandbox.terminate();
}

#[tokio::test]
async fn config_is_handed_over_at_init() {
    let fx = Fixture::new();
    let plugin_id = pid("curated.configured");
    fx.permissions.register_plugin(&plugin_id, TrustTier::Curated);
    let options = SandboxOptions::new(plugin_id, TrustTier::Curated).with_config(json!({ "columns": 4 }));
    let sandbox = create_worker_sandbox(options, Box::new(Probe), Arc::clone(&fx.permissions))
        .await
        .unwrap();
    assert_eq!(sandbox.request("config", Value::Null).await.unwrap(), json!({ "columns": 4 }));
    sandbox.terminate();
}

#[tokio::test]
async fn failed_init_is_a_start_error() {
    let fx = Fixture::new();
    let plugin_id = pid("curated.broken");
    fx.permissions.register_plugin(&plugin_id, TrustTier::Curated);
    let options = SandboxOptions::new(plugin_id, TrustTier::Curated);
    let err = create_worker_sandbox(options, Box::new(BrokenInit), Arc::clone(&fx.permissions))
        .await
        .err()
        .unwrap();
    assert!(err.is_retryable());
    match err {
        PluginHostError::SandboxInit { message, .. } => assert!(message.contains("missing resource"), "{message}"),
        other => panic!("expected SandboxInit, got {other:?}"),
    }
}
