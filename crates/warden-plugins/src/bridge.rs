use std::sync::{Arc, Weak};

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_security::{Capability, PermissionGuard};

use crate::protocol::WorkerMessage;
use crate::worker::{PluginWorker, WorkerEvent};

/// Message type of the host's answer to a `permission:request`.
pub const PERMISSION_RESPONSE: &str = "permission:response";

/// Answer a worker's permission requests through `guard`.
///
/// Each request is decided on its own task so a slow approval does not hold
/// up the others. The returned task ends when the worker is dropped.
pub fn serve_permission_requests(
    worker: &Arc<PluginWorker>,
    guard: Arc<PermissionGuard>,
) -> JoinHandle<()> {
    let mut events = worker.subscribe();
    let worker = Arc::downgrade(worker);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::PermissionRequest {
                    id,
                    capability,
                    reason,
                }) => {
                    tokio::spawn(answer(
                        Weak::clone(&worker),
                        Arc::clone(&guard),
                        id,
                        capability,
                        reason,
                    ));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        plugin = %guard.plugin_name(),
                        "permission bridge skipped {skipped} worker events"
                    );
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

async fn answer(
    worker: Weak<PluginWorker>,
    guard: Arc<PermissionGuard>,
    id: Option<String>,
    tag: String,
    reason: String,
) {
    let (granted, error) = match tag.parse::<Capability>() {
        Ok(capability) => (guard.request(capability, reason).await, None),
        Err(e) => (false, Some(e.to_string())),
    };
    debug!(
        plugin = %guard.plugin_name(),
        "permission {tag} {}",
        if granted { "granted" } else { "denied" }
    );

    let mut response = WorkerMessage::custom(
        PERMISSION_RESPONSE,
        json!({ "capability": tag, "granted": granted }),
    );
    response.id = id;
    response.error = error;

    if let Some(worker) = worker.upgrade() {
        worker.send_message(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_plugins::{self, fast_settings};
    use crate::worker::WorkerConfig;
    use serde_json::Value;
    use warden_security::{ApprovalBroker, UnsupervisedPolicy};

    async fn echo_worker() -> Arc<PluginWorker> {
        let worker = Arc::new(PluginWorker::new(
            WorkerConfig::new("echo-plugin", "echo"),
            Arc::new(test_plugins::backend()),
            fast_settings(),
        ));
        worker.start().await.unwrap();
        worker
    }

    async fn ask(worker: &PluginWorker, capability: &str) -> Value {
        worker
            .call("ask", json!({ "capability": capability, "reason": "test" }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unsupervised_requests_follow_policy() {
        let worker = echo_worker().await;
        let guard = Arc::new(PermissionGuard::new(
            "echo-plugin",
            [Capability::DataMemory],
            ApprovalBroker::new(),
        ));
        let bridge = serve_permission_requests(&worker, Arc::clone(&guard));

        assert_eq!(ask(&worker, "data:memory").await["granted"], json!(true));
        assert_eq!(ask(&worker, "ai:inference").await["granted"], json!(true));
        assert_eq!(ask(&worker, "data:secrets").await["granted"], json!(false));
        assert!(guard.has(Capability::AiInference));
        assert!(guard.is_denied(Capability::DataSecrets));

        worker.stop().await;
        bridge.abort();
    }

    #[tokio::test]
    async fn unknown_capability_is_refused_with_error() {
        let worker = echo_worker().await;
        let guard = Arc::new(PermissionGuard::new(
            "echo-plugin",
            Vec::<Capability>::new(),
            ApprovalBroker::new(),
        ));
        let bridge = serve_permission_requests(&worker, guard);

        let answer = ask(&worker, "bogus:cap").await;
        assert_eq!(answer["granted"], json!(false));
        assert!(answer["error"].as_str().unwrap().contains("bogus:cap"));

        worker.stop().await;
        bridge.abort();
    }

    #[tokio::test]
    async fn listener_decides_dangerous_requests() {
        let worker = echo_worker().await;
        let broker = ApprovalBroker::new();
        let mut approvals = broker.subscribe();
        let guard = Arc::new(
            PermissionGuard::new("echo-plugin", Vec::<Capability>::new(), broker)
                .with_unsupervised_policy(UnsupervisedPolicy::DenyAll),
        );
        let bridge = serve_permission_requests(&worker, Arc::clone(&guard));

        let approver = tokio::spawn(async move {
            let pending = approvals.recv().await.unwrap();
            assert_eq!(pending.request.capability, Capability::ProcessShell);
            assert!(pending.request.dangerous);
            pending.responder.approve();
        });

        assert_eq!(ask(&worker, "process:shell").await["granted"], json!(true));
        approver.await.unwrap();
        assert!(guard.has(Capability::ProcessShell));

        worker.stop().await;
        bridge.abort();
    }
}
