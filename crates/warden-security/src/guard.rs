use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};
use warden_common::{Error, Result};

use crate::approval::{ApprovalBroker, PermissionRequest, UnsupervisedPolicy};
use crate::capability::Capability;

/// How long an approval request waits for a decision before it is denied.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct GuardState {
    granted: HashSet<Capability>,
    denied: HashSet<Capability>,
}

/// Per-plugin authorization gate.
///
/// Holds the capabilities granted to one plugin and the ones denied during
/// this session. `check` is the synchronous, fail-closed primitive sensitive
/// operations call before proceeding; `request` is the escalation path for
/// capabilities that were not granted up front.
#[derive(Debug)]
pub struct PermissionGuard {
    plugin_name: String,
    state: Mutex<GuardState>,
    broker: ApprovalBroker,
    approval_timeout: Duration,
    unsupervised: UnsupervisedPolicy,
}

impl PermissionGuard {
    pub fn new(
        plugin_name: impl Into<String>,
        initial: impl IntoIterator<Item = Capability>,
        broker: ApprovalBroker,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            state: Mutex::new(GuardState {
                granted: initial.into_iter().collect(),
                denied: HashSet::new(),
            }),
            broker,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            unsupervised: UnsupervisedPolicy::default(),
        }
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_unsupervised_policy(mut self, policy: UnsupervisedPolicy) -> Self {
        self.unsupervised = policy;
        self
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Fails with [`Error::PermissionDenied`] unless `capability` is granted.
    pub fn check(&self, capability: Capability) -> Result<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(Error::permission_denied(&self.plugin_name, capability))
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.with_state(|state| state.granted.contains(&capability))
    }

    pub fn has_any(&self, capabilities: &[Capability]) -> bool {
        self.with_state(|state| capabilities.iter().any(|c| state.granted.contains(c)))
    }

    pub fn has_all(&self, capabilities: &[Capability]) -> bool {
        self.with_state(|state| capabilities.iter().all(|c| state.granted.contains(c)))
    }

    /// Ask for `capability` at runtime.
    ///
    /// Resolves immediately for capabilities already granted or already
    /// denied this session. Otherwise the request goes to approval listeners
    /// and is denied if no decision arrives within the approval timeout.
    /// With no listener at all the unsupervised policy decides.
    pub async fn request(&self, capability: Capability, reason: impl Into<String>) -> bool {
        let known = self.with_state(|state| {
            if state.granted.contains(&capability) {
                Some(true)
            } else if state.denied.contains(&capability) {
                Some(false)
            } else {
                None
            }
        });
        if let Some(decision) = known {
            return decision;
        }

        let request = PermissionRequest {
            plugin_name: self.plugin_name.clone(),
            capability,
            reason: reason.into(),
            dangerous: capability.is_dangerous(),
        };

        let granted = match self.broker.publish(request) {
            Some(rx) => match tokio::time::timeout(self.approval_timeout, rx).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(_)) => {
                    warn!(
                        plugin = %self.plugin_name,
                        "approval for {capability} dropped without a decision; denying"
                    );
                    false
                }
                Err(_) => {
                    warn!(
                        plugin = %self.plugin_name,
                        "approval for {capability} timed out after {}ms; denying",
                        self.approval_timeout.as_millis()
                    );
                    false
                }
            },
            None => {
                let decision = self.unsupervised.decide(capability);
                info!(
                    plugin = %self.plugin_name,
                    "no approval listener for {capability}; policy {:?} {}",
                    self.unsupervised,
                    if decision { "approved" } else { "denied" }
                );
                decision
            }
        };

        self.with_state(|state| {
            if granted {
                state.denied.remove(&capability);
                state.granted.insert(capability);
            } else {
                state.denied.insert(capability);
            }
        });
        granted
    }

    /// Grant without going through approval. Clears a session denial.
    pub fn grant(&self, capability: Capability) {
        self.with_state(|state| {
            state.denied.remove(&capability);
            state.granted.insert(capability);
        });
    }

    pub fn revoke(&self, capability: Capability) {
        self.with_state(|state| {
            state.granted.remove(&capability);
        });
    }

    pub fn granted_permissions(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> =
            self.with_state(|state| state.granted.iter().copied().collect());
        caps.sort();
        caps
    }

    pub fn is_denied(&self, capability: Capability) -> bool {
        self.with_state(|state| state.denied.contains(&capability))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut GuardState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
