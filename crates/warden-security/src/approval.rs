use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::capability::Capability;

/// A plugin asking for a capability it was not granted up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub plugin_name: String,
    pub capability: Capability,
    pub reason: String,
    pub dangerous: bool,
}

/// What a guard does when nobody is subscribed to approval requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupervisedPolicy {
    /// Approve non-dangerous capabilities, deny dangerous ones.
    #[default]
    AllowSafe,
    /// Deny everything.
    DenyAll,
}

impl UnsupervisedPolicy {
    pub fn decide(self, capability: Capability) -> bool {
        match self {
            Self::AllowSafe => !capability.is_dangerous(),
            Self::DenyAll => false,
        }
    }
}

/// Answers one [`PermissionRequest`]. Clones share the same slot, so only
/// the first `approve`/`deny` across all clones has any effect.
#[derive(Debug, Clone)]
pub struct ApprovalResponder {
    slot: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
}

impl ApprovalResponder {
    fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns `false` if the request was already decided or timed out.
    pub fn approve(&self) -> bool {
        self.resolve(true)
    }

    pub fn deny(&self) -> bool {
        self.resolve(false)
    }

    pub fn resolve(&self, granted: bool) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        sender.is_some_and(|tx| tx.send(granted).is_ok())
    }

    pub fn is_resolved(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.as_ref().is_none_or(|tx| tx.is_closed()))
            .unwrap_or(true)
    }
}

/// A request broadcast to approval listeners together with its responder.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub request: PermissionRequest,
    pub responder: ApprovalResponder,
}

/// Shared channel on which guards publish permission requests.
///
/// Whether anyone is listening is observable through
/// [`ApprovalBroker::has_listeners`]; guards fall back to their
/// [`UnsupervisedPolicy`] when it returns `false`.
#[derive(Debug, Clone)]
pub struct ApprovalBroker {
    tx: broadcast::Sender<PendingApproval>,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PendingApproval> {
        self.tx.subscribe()
    }

    pub fn has_listeners(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a request. Returns `None` when there is no listener to
    /// deliver it to.
    pub fn publish(&self, request: PermissionRequest) -> Option<oneshot::Receiver<bool>> {
        let (responder, rx) = ApprovalResponder::new();
        self.tx.send(PendingApproval { request, responder }).ok()?;
        Some(rx)
    }
}
