use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::approval::{ApprovalBroker, PendingApproval, UnsupervisedPolicy};
use crate::capability::Capability;
use crate::guard::{DEFAULT_APPROVAL_TIMEOUT, PermissionGuard};

/// Host-owned table of plugin name → [`PermissionGuard`].
///
/// All guards created here publish to the same [`ApprovalBroker`], so a
/// single approval listener (a UI prompt, a policy engine) serves every
/// plugin.
pub struct PermissionRegistry {
    broker: ApprovalBroker,
    guards: RwLock<HashMap<String, Arc<PermissionGuard>>>,
    approval_timeout: Duration,
    unsupervised: UnsupervisedPolicy,
}

impl Default for PermissionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_APPROVAL_TIMEOUT, UnsupervisedPolicy::default())
    }

    pub fn with_settings(approval_timeout: Duration, unsupervised: UnsupervisedPolicy) -> Self {
        Self {
            broker: ApprovalBroker::new(),
            guards: RwLock::new(HashMap::new()),
            approval_timeout,
            unsupervised,
        }
    }

    pub fn broker(&self) -> &ApprovalBroker {
        &self.broker
    }

    /// Subscribe to permission requests from every plugin in this registry.
    pub fn subscribe(&self) -> broadcast::Receiver<PendingApproval> {
        self.broker.subscribe()
    }

    /// Return the guard for `plugin_name`, creating it with `initial` grants
    /// if it does not exist yet. `initial` is ignored for existing guards.
    pub fn get_or_create(&self, plugin_name: &str, initial: &[Capability]) -> Arc<PermissionGuard> {
        if let Some(existing) = self.get(plugin_name) {
            return existing;
        }

        let mut guards = match self.guards.write() {
            Ok(guards) => guards,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(guards.entry(plugin_name.to_string()).or_insert_with(|| {
            debug!(
                "creating permission guard for '{plugin_name}' with {} initial grant(s)",
                initial.len()
            );
            Arc::new(
                PermissionGuard::new(plugin_name, initial.iter().copied(), self.broker.clone())
                    .with_approval_timeout(self.approval_timeout)
                    .with_unsupervised_policy(self.unsupervised),
            )
        }))
    }

    pub fn get(&self, plugin_name: &str) -> Option<Arc<PermissionGuard>> {
        self.guards
            .read()
            .ok()
            .and_then(|guards| guards.get(plugin_name).cloned())
    }

    /// Drop a plugin's guard on unload. Returns `true` if one existed.
    pub fn remove(&self, plugin_name: &str) -> bool {
        let removed = match self.guards.write() {
            Ok(mut guards) => guards.remove(plugin_name).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(plugin_name).is_some(),
        };
        if removed {
            info!("removed permission guard for '{plugin_name}'");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .guards
            .read()
            .map(|guards| guards.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
