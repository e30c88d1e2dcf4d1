use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use warden_common::{Error, Result};
use warden_security::Capability;

use crate::backend::{IsolationBackend, LaunchSpec, UnitEvent, UnitHandle};
use crate::protocol::WorkerMessage;

/// Exit code reported when an in-process plugin panics.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Outcome of a plugin entry function: an exit code or an unhandled error.
pub type PluginResult = std::result::Result<i32, String>;

type PluginEntry = Arc<dyn Fn(PluginContext) -> LocalBoxFuture<'static, PluginResult> + Send + Sync>;

/// The plugin's view of its host connection.
pub struct PluginContext {
    plugin_name: String,
    permissions: Vec<Capability>,
    env: HashMap<String, String>,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    outbox: mpsc::UnboundedSender<UnitEvent>,
}

impl PluginContext {
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn permissions(&self) -> &[Capability] {
        &self.permissions
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.permissions.contains(&capability)
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Next message from the host. `None` once the host has let go.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.inbox.recv().await
    }

    pub fn send(&self, msg: WorkerMessage) -> bool {
        self.outbox.send(UnitEvent::Message(msg)).is_ok()
    }

    pub fn ready(&self) -> bool {
        self.send(WorkerMessage::ready())
    }

    pub fn heartbeat(&self) -> bool {
        self.send(WorkerMessage::heartbeat())
    }

    pub fn respond(&self, id: impl Into<String>, payload: Value) -> bool {
        self.send(WorkerMessage::response(id, payload))
    }

    pub fn log(&self, level: &str, message: impl Into<String>) -> bool {
        self.send(WorkerMessage::log(level, message))
    }
}

/// Runs Rust plugin functions on dedicated OS threads, each with its own
/// single-threaded runtime. Plugins are looked up by entry path.
#[derive(Clone, Default)]
pub struct InProcessBackend {
    entries: HashMap<PathBuf, PluginEntry>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `entry` launchable under the entry path `path`.
    pub fn register<F, Fut>(mut self, path: impl Into<PathBuf>, entry: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PluginResult> + 'static,
    {
        let entry: PluginEntry = Arc::new(move |ctx| entry(ctx).boxed_local());
        self.entries.insert(path.into(), entry);
        self
    }

    pub fn is_registered(&self, path: &std::path::Path) -> bool {
        self.entries.contains_key(path)
    }
}

#[async_trait]
impl IsolationBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<UnitHandle> {
        let entry = self
            .entries
            .get(&spec.entry_path)
            .cloned()
            .ok_or_else(|| Error::StartFailed {
                plugin: spec.plugin_name.clone(),
                reason: format!(
                    "no in-process plugin registered for {}",
                    spec.entry_path.display()
                ),
            })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let ctx = PluginContext {
            plugin_name: spec.plugin_name.clone(),
            permissions: spec.permissions.clone(),
            env: spec.env.clone(),
            inbox: outbound_rx,
            outbox: events_tx.clone(),
        };

        let plugin = spec.plugin_name.clone();
        std::thread::Builder::new()
            .name(format!("plugin-{}", spec.plugin_name))
            .spawn(move || {
                let code = run_plugin(&plugin, entry, ctx, kill_rx, &events_tx);
                let _ = events_tx.send(UnitEvent::Exit(code));
            })
            .map_err(|e| Error::StartFailed {
                plugin: spec.plugin_name.clone(),
                reason: format!("failed to spawn plugin thread: {e}"),
            })?;

        Ok(UnitHandle {
            outbound: outbound_tx,
            events: events_rx,
            kill: kill_tx,
        })
    }
}

fn run_plugin(
    plugin: &str,
    entry: PluginEntry,
    ctx: PluginContext,
    kill: oneshot::Receiver<()>,
    events: &mpsc::UnboundedSender<UnitEvent>,
) -> Option<i32> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = events.send(UnitEvent::Error(format!("failed to build plugin runtime: {e}")));
            return Some(1);
        }
    };

    runtime.block_on(async move {
        tokio::select! {
            outcome = AssertUnwindSafe(entry(ctx)).catch_unwind() => match outcome {
                Ok(Ok(code)) => Some(code),
                Ok(Err(e)) => {
                    let _ = events.send(UnitEvent::Error(e));
                    Some(1)
                }
                Err(_) => {
                    let _ = events.send(UnitEvent::Error("plugin panicked".to_string()));
                    Some(PANIC_EXIT_CODE)
                }
            },
            _ = kill => {
                debug!(plugin = %plugin, "in-process plugin terminated");
                None
            }
        }
    })
}
