use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use warden_common::Result;
use warden_security::Capability;

use crate::protocol::WorkerMessage;

/// Environment variable carrying [`InitData`] as JSON.
pub const INIT_ENV_VAR: &str = "WARDEN_PLUGIN_INIT";

/// What the isolated unit is told about itself at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    pub entry_path: PathBuf,
    pub plugin_name: String,
    pub permissions: Vec<Capability>,
}

/// Everything a backend needs to bring up one isolated unit.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub plugin_name: String,
    pub entry_path: PathBuf,
    pub permissions: Vec<Capability>,
    /// The complete environment of the unit. Nothing else is inherited.
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn init_data(&self) -> InitData {
        InitData {
            entry_path: self.entry_path.clone(),
            plugin_name: self.plugin_name.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

/// Signals coming out of a running unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    Message(WorkerMessage),
    /// The plugin raised an error it did not handle.
    Error(String),
    /// The unit is gone. `None` means it was killed or died from a signal.
    Exit(Option<i32>),
}

/// Host side of a launched unit.
pub struct UnitHandle {
    pub outbound: mpsc::UnboundedSender<WorkerMessage>,
    pub events: mpsc::UnboundedReceiver<UnitEvent>,
    pub kill: oneshot::Sender<()>,
}

/// Something that can run a plugin in isolation from the host.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, spec: LaunchSpec) -> Result<UnitHandle>;
}
