use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use warden_common::{CorrelationId, Error, Result};
use warden_security::{Capability, PluginManifest, ResourceLimits};

pub use warden_config::WorkerTimings as WorkerSettings;

use crate::backend::{INIT_ENV_VAR, IsolationBackend, LaunchSpec, UnitEvent, UnitHandle};
use crate::env::build_safe_env;
use crate::limits::{effective_call_timeout, resource_env};
use crate::protocol::{MessageKind, WorkerMessage};

const EVENT_CAPACITY: usize = 256;

/// Where a worker is in its lifecycle. Health is tracked separately while
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Everything a worker reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Ready,
    /// The plugin raised an unhandled error.
    Error(String),
    /// The isolated unit went away. `requested` is set when it followed `stop()`.
    Exit { code: Option<i32>, requested: bool },
    /// No heartbeat within the heartbeat timeout.
    Unhealthy,
    /// The restart budget is exhausted; the worker stays stopped.
    MaxRestarts,
    PermissionRequest {
        id: Option<String>,
        capability: String,
        reason: String,
    },
    /// Any message type the worker does not interpret itself.
    Message(WorkerMessage),
}

/// A failure that should go through the owner's recovery policy. At most one
/// is reported per run of the isolated unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub plugin_name: String,
    pub error: String,
}

/// What to run and with which grants. Immutable once handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub entry_path: PathBuf,
    pub plugin_name: String,
    pub permissions: Vec<Capability>,
    pub resource_limits: Option<ResourceLimits>,
    pub env: HashMap<String, String>,
}

impl WorkerConfig {
    pub fn new(plugin_name: impl Into<String>, entry_path: impl Into<PathBuf>) -> Self {
        Self {
            entry_path: entry_path.into(),
            plugin_name: plugin_name.into(),
            permissions: Vec::new(),
            resource_limits: None,
            env: HashMap::new(),
        }
    }

    /// Grant the manifest's required capabilities and adopt its limits.
    pub fn from_manifest(manifest: &PluginManifest, entry_path: impl Into<PathBuf>) -> Self {
        Self {
            permissions: manifest.permissions.required.clone(),
            resource_limits: manifest.resource_limits,
            ..Self::new(manifest.name.clone(), entry_path)
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Capability>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginWorkerStats {
    pub name: String,
    pub running: bool,
    pub restart_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pending_messages: usize,
}

type CallOutcome = std::result::Result<Value, String>;

struct Inner {
    state: WorkerState,
    /// Bumped on every launch; events from older units are ignored.
    run: u64,
    outbound: Option<mpsc::UnboundedSender<WorkerMessage>>,
    kill: Option<oneshot::Sender<()>>,
    ready: Option<oneshot::Sender<()>>,
    startup_failure: Option<String>,
    exit_waiters: Vec<oneshot::Sender<Option<i32>>>,
    pending: HashMap<String, oneshot::Sender<CallOutcome>>,
    restart_count: u32,
    start_time: Option<DateTime<Utc>>,
    running_since: Option<Instant>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<Instant>,
    unhealthy: bool,
    failure_reported: bool,
    failure_sink: Option<mpsc::UnboundedSender<WorkerFailure>>,
    heartbeat_task: Option<JoinHandle<()>>,
    /// Set by `retire()`; the worker never starts again.
    retired: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: WorkerState::Stopped,
            run: 0,
            outbound: None,
            kill: None,
            ready: None,
            startup_failure: None,
            exit_waiters: Vec::new(),
            pending: HashMap::new(),
            restart_count: 0,
            start_time: None,
            running_since: None,
            last_heartbeat: None,
            last_heartbeat_at: None,
            unhealthy: false,
            failure_reported: false,
            failure_sink: None,
            heartbeat_task: None,
            retired: false,
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }

    fn in_handshake(&self) -> bool {
        self.ready.is_some() || self.state == WorkerState::Starting
    }
}

struct Shared {
    name: String,
    settings: WorkerSettings,
    inner: Mutex<Inner>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn report_failure(&self, inner: &mut Inner, error: String) {
        if inner.failure_reported {
            return;
        }
        inner.failure_reported = true;
        if let Some(sink) = &inner.failure_sink {
            let _ = sink.send(WorkerFailure {
                plugin_name: self.name.clone(),
                error,
            });
        }
    }

    fn is_current(&self, run: u64) -> bool {
        self.lock().run == run
    }

    fn dispatch(&self, run: u64, msg: WorkerMessage) {
        if !self.is_current(run) {
            trace!(plugin = %self.name, "ignoring message from a previous run");
            return;
        }

        match msg.kind {
            MessageKind::Heartbeat => {
                let mut inner = self.lock();
                inner.last_heartbeat = Some(Utc::now());
                inner.last_heartbeat_at = Some(Instant::now());
                inner.unhealthy = false;
                trace!(plugin = %self.name, "heartbeat");
            }
            MessageKind::Ready => {
                let ready = self.lock().ready.take();
                match ready {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => debug!(plugin = %self.name, "ignoring duplicate ready"),
                }
            }
            MessageKind::Response => {
                let Some(id) = msg.id else {
                    warn!(plugin = %self.name, "response without id");
                    return;
                };
                let sender = self.lock().pending.remove(&id);
                match sender {
                    Some(tx) => {
                        let outcome = match msg.error {
                            Some(e) => Err(e),
                            None => Ok(msg.payload.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!(plugin = %self.name, "response for unknown or expired call {id}"),
                }
            }
            MessageKind::Log => self.forward_log(msg.payload.as_ref()),
            MessageKind::PermissionRequest => {
                let payload = msg.payload.unwrap_or(Value::Null);
                let field = |key: &str| {
                    payload
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                self.emit(WorkerEvent::PermissionRequest {
                    id: msg.id,
                    capability: field("capability"),
                    reason: field("reason"),
                });
            }
            _ => self.emit(WorkerEvent::Message(msg)),
        }
    }

    fn forward_log(&self, payload: Option<&Value>) {
        let Some(payload) = payload else {
            return;
        };
        let level = payload.get("level").and_then(Value::as_str).unwrap_or("info");
        let message = match payload.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let plugin = self.name.as_str();
        match level {
            "error" => error!(plugin, "{message}"),
            "warn" | "warning" => warn!(plugin, "{message}"),
            "debug" => debug!(plugin, "{message}"),
            "trace" => trace!(plugin, "{message}"),
            _ => info!(plugin, "{message}"),
        }
    }

    fn on_unit_error(&self, run: u64, message: String) {
        let mut inner = self.lock();
        if inner.run != run {
            return;
        }
        warn!(plugin = %self.name, "worker error: {message}");
        if inner.in_handshake() {
            inner.startup_failure = Some(message);
            return;
        }
        self.report_failure(&mut inner, message.clone());
        drop(inner);
        self.emit(WorkerEvent::Error(message));
    }

    fn on_unit_exit(&self, run: u64, code: Option<i32>) {
        let mut inner = self.lock();
        if inner.run != run {
            return;
        }
        inner.outbound = None;
        inner.kill = None;
        inner.stop_heartbeat();
        // Dropping the senders fails every in-flight call.
        inner.pending.clear();
        for waiter in inner.exit_waiters.drain(..) {
            let _ = waiter.send(code);
        }

        if inner.in_handshake() {
            let reason = match inner.startup_failure.take() {
                Some(e) => format!("{e} ({})", describe_exit(code)),
                None => format!("exited before ready ({})", describe_exit(code)),
            };
            inner.startup_failure = Some(reason);
            inner.ready = None;
            inner.state = WorkerState::Stopped;
            return;
        }

        let requested = inner.state == WorkerState::Stopping;
        if !requested {
            inner.state = WorkerState::Stopped;
            if code != Some(0) {
                self.report_failure(&mut inner, format!("exited with {}", describe_exit(code)));
            }
        }
        drop(inner);

        if requested {
            debug!(plugin = %self.name, "worker exited after shutdown");
        } else if code == Some(0) {
            info!(plugin = %self.name, "worker exited cleanly");
        } else {
            warn!(plugin = %self.name, "worker exited unexpectedly with {}", describe_exit(code));
        }
        self.emit(WorkerEvent::Exit { code, requested });
    }

    fn check_heartbeat(&self, run: u64) -> bool {
        let mut inner = self.lock();
        if inner.run != run || inner.state != WorkerState::Running {
            return false;
        }
        let stale = inner
            .last_heartbeat_at
            .is_some_and(|at| at.elapsed() >= self.settings.heartbeat_timeout());
        if stale && !inner.unhealthy {
            inner.unhealthy = true;
            self.report_failure(&mut inner, "heartbeat timeout".to_string());
            drop(inner);
            warn!(
                plugin = %self.name,
                "no heartbeat for {}ms",
                self.settings.heartbeat_timeout_ms
            );
            self.emit(WorkerEvent::Unhealthy);
        }
        true
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

async fn dispatch_loop(
    shared: Weak<Shared>,
    run: u64,
    mut events: mpsc::UnboundedReceiver<UnitEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(worker) = shared.upgrade() else {
            return;
        };
        match event {
            UnitEvent::Message(msg) => worker.dispatch(run, msg),
            UnitEvent::Error(e) => worker.on_unit_error(run, e),
            UnitEvent::Exit(code) => {
                worker.on_unit_exit(run, code);
                return;
            }
        }
    }
    if let Some(worker) = shared.upgrade() {
        worker.on_unit_exit(run, None);
    }
}

async fn heartbeat_monitor(shared: Weak<Shared>, run: u64, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(worker) = shared.upgrade() else {
            return;
        };
        if !worker.check_heartbeat(run) {
            return;
        }
    }
}

/// Removes a call's pending entry however the call ends.
struct PendingCall<'a> {
    shared: &'a Shared,
    id: &'a str,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(self.id);
    }
}

/// Runs one plugin in an isolated unit and exposes calls, events and health.
pub struct PluginWorker {
    config: WorkerConfig,
    backend: Arc<dyn IsolationBackend>,
    shared: Arc<Shared>,
    /// Serializes start, stop and restart.
    lifecycle: tokio::sync::Mutex<()>,
}

impl PluginWorker {
    pub fn new(
        config: WorkerConfig,
        backend: Arc<dyn IsolationBackend>,
        settings: WorkerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            name: config.plugin_name.clone(),
            settings,
            inner: Mutex::new(Inner::new()),
            events,
        });
        Self {
            config,
            backend,
            shared,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.plugin_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Route failures (unhandled errors, crashes, missed heartbeats) to `sink`.
    pub fn set_failure_sink(&self, sink: mpsc::UnboundedSender<WorkerFailure>) {
        self.shared.lock().failure_sink = Some(sink);
    }

    /// Launch the isolated unit and wait for its `ready` handshake.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_not_retired()?;
        self.start_unit().await
    }

    /// Ask the unit to shut down, terminating it if it does not exit within
    /// the shutdown grace period. No-op when nothing is running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_unit().await;
    }

    /// Stop for good. A restart already waiting on this worker gives up
    /// instead of bringing it back.
    pub async fn retire(&self) {
        self.shared.lock().retired = true;
        self.stop().await;
    }

    /// Stop, back off, and start again.
    ///
    /// Fails with [`Error::MaxRestarts`] and leaves the worker stopped once
    /// more than `max_restart_attempts` restarts happen without a run lasting
    /// the stable window.
    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_not_retired()?;
        let settings = &self.shared.settings;

        let attempt = {
            let mut inner = self.shared.lock();
            if inner
                .running_since
                .is_some_and(|since| since.elapsed() >= settings.stable_window())
            {
                inner.restart_count = 0;
            }
            inner.restart_count += 1;
            inner.restart_count
        };

        if attempt > settings.max_restart_attempts {
            error!(
                plugin = %self.name(),
                "giving up after {} restart attempts",
                settings.max_restart_attempts
            );
            self.stop_unit().await;
            self.shared.emit(WorkerEvent::MaxRestarts);
            return Err(Error::MaxRestarts {
                plugin: self.name().to_string(),
                attempts: settings.max_restart_attempts,
            });
        }

        let delay = backoff_delay(settings.restart_base_delay(), attempt);
        info!(
            plugin = %self.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "restarting worker"
        );
        self.stop_unit().await;
        self.shared.lock().state = WorkerState::Restarting;
        tokio::time::sleep(delay).await;
        if let Err(e) = self.ensure_not_retired() {
            self.shared.lock().state = WorkerState::Stopped;
            return Err(e);
        }
        self.start_unit().await
    }

    /// Invoke `method` in the plugin with the default call timeout.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        self.call_with_timeout(method, args, self.shared.settings.call_timeout())
            .await
    }

    /// Invoke `method` in the plugin. The timeout is capped by the worker's
    /// `max_execution_time_ms`, if any.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let timeout = effective_call_timeout(timeout, self.config.resource_limits.as_ref());
        let id = CorrelationId::new().into_string();
        let (tx, rx) = oneshot::channel();

        let outbound = {
            let mut inner = self.shared.lock();
            let outbound = match (&inner.state, &inner.outbound) {
                (WorkerState::Running, Some(outbound)) => outbound.clone(),
                _ => return Err(Error::NotRunning(self.name().to_string())),
            };
            inner.pending.insert(id.clone(), tx);
            outbound
        };
        let _pending = PendingCall {
            shared: &self.shared,
            id: &id,
        };

        outbound
            .send(WorkerMessage::call(id.as_str(), method, args))
            .map_err(|_| Error::Transport(format!("worker '{}' is not accepting messages", self.name())))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(reason))) => Err(Error::CallFailed {
                method: method.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(Error::CallFailed {
                method: method.to_string(),
                reason: "worker stopped before responding".to_string(),
            }),
            Err(_) => {
                warn!(plugin = %self.name(), "call '{method}' timed out");
                Err(Error::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget. Returns `false` and drops the message if the worker
    /// is not running.
    pub fn send_message(&self, msg: WorkerMessage) -> bool {
        let outbound = {
            let inner = self.shared.lock();
            match (&inner.state, &inner.outbound) {
                (WorkerState::Running, Some(outbound)) => Some(outbound.clone()),
                _ => None,
            }
        };
        match outbound {
            Some(outbound) => outbound.send(msg).is_ok(),
            None => {
                warn!(
                    plugin = %self.name(),
                    "worker not running; dropping '{}' message",
                    msg.kind
                );
                false
            }
        }
    }

    pub fn stats(&self) -> PluginWorkerStats {
        let inner = self.shared.lock();
        PluginWorkerStats {
            name: self.name().to_string(),
            running: inner.state == WorkerState::Running,
            restart_count: inner.restart_count,
            start_time: inner.start_time,
            last_heartbeat: inner.last_heartbeat,
            pending_messages: inner.pending.len(),
        }
    }

    /// Running, and either still waiting for its first heartbeat or heard
    /// from within the heartbeat timeout.
    pub fn is_healthy(&self) -> bool {
        let inner = self.shared.lock();
        inner.state == WorkerState::Running
            && inner
                .last_heartbeat_at
                .is_none_or(|at| at.elapsed() < self.shared.settings.heartbeat_timeout())
    }

    fn launch_spec(&self) -> Result<LaunchSpec> {
        let mut env = build_safe_env(std::env::vars(), &self.config.permissions, &self.config.env);
        if let Some(limits) = &self.config.resource_limits {
            env.extend(resource_env(limits));
        }
        let mut spec = LaunchSpec {
            plugin_name: self.config.plugin_name.clone(),
            entry_path: self.config.entry_path.clone(),
            permissions: self.config.permissions.clone(),
            env,
        };
        let init = serde_json::to_string(&spec.init_data())?;
        spec.env.insert(INIT_ENV_VAR.to_string(), init);
        Ok(spec)
    }

    fn ensure_not_retired(&self) -> Result<()> {
        if self.shared.lock().retired {
            return Err(Error::NotRunning(self.name().to_string()));
        }
        Ok(())
    }

    async fn start_unit(&self) -> Result<()> {
        let spec = self.launch_spec()?;
        let (ready_tx, ready_rx) = oneshot::channel();

        let run = {
            let mut inner = self.shared.lock();
            if !matches!(inner.state, WorkerState::Stopped | WorkerState::Restarting) {
                return Err(Error::AlreadyRunning(self.name().to_string()));
            }
            inner.state = WorkerState::Starting;
            inner.run += 1;
            inner.ready = Some(ready_tx);
            inner.startup_failure = None;
            inner.failure_reported = false;
            inner.unhealthy = false;
            inner.last_heartbeat = None;
            inner.last_heartbeat_at = None;
            inner.run
        };

        info!(plugin = %self.name(), backend = self.backend.name(), "starting worker");
        let UnitHandle {
            outbound,
            events,
            kill,
        } = match self.backend.launch(spec).await {
            Ok(unit) => unit,
            Err(e) => {
                let mut inner = self.shared.lock();
                inner.ready = None;
                inner.state = WorkerState::Stopped;
                return Err(e);
            }
        };

        {
            let mut inner = self.shared.lock();
            inner.outbound = Some(outbound);
            inner.kill = Some(kill);
        }
        tokio::spawn(dispatch_loop(Arc::downgrade(&self.shared), run, events));

        let ready_timeout = self.shared.settings.ready_timeout();
        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(())) => {
                let mut inner = self.shared.lock();
                if inner.run != run || inner.state != WorkerState::Starting {
                    let reason = inner
                        .startup_failure
                        .take()
                        .unwrap_or_else(|| "exited right after ready".to_string());
                    return Err(Error::StartFailed {
                        plugin: self.name().to_string(),
                        reason,
                    });
                }
                inner.state = WorkerState::Running;
                inner.start_time = Some(Utc::now());
                inner.running_since = Some(Instant::now());
                inner.heartbeat_task = Some(tokio::spawn(heartbeat_monitor(
                    Arc::downgrade(&self.shared),
                    run,
                    self.shared.settings.heartbeat_interval(),
                )));
                drop(inner);

                info!(plugin = %self.name(), "worker ready");
                self.shared.emit(WorkerEvent::Ready);
                Ok(())
            }
            Ok(Err(_)) => {
                let reason = self
                    .shared
                    .lock()
                    .startup_failure
                    .take()
                    .unwrap_or_else(|| "exited before ready".to_string());
                warn!(plugin = %self.name(), "worker failed to start: {reason}");
                Err(Error::StartFailed {
                    plugin: self.name().to_string(),
                    reason,
                })
            }
            Err(_) => {
                warn!(
                    plugin = %self.name(),
                    "no ready message within {}ms; terminating",
                    self.shared.settings.ready_timeout_ms
                );
                let kill = {
                    let mut inner = self.shared.lock();
                    inner.run += 1;
                    inner.state = WorkerState::Stopped;
                    inner.ready = None;
                    inner.outbound = None;
                    inner.kill.take()
                };
                if let Some(kill) = kill {
                    let _ = kill.send(());
                }
                Err(Error::ReadyTimeout {
                    plugin: self.name().to_string(),
                    timeout_ms: self.shared.settings.ready_timeout_ms,
                })
            }
        }
    }

    async fn stop_unit(&self) {
        let (mut exited, outbound, kill) = {
            let mut inner = self.shared.lock();
            inner.stop_heartbeat();
            inner.start_time = None;
            inner.running_since = None;
            if inner.outbound.is_none() && inner.kill.is_none() {
                inner.state = WorkerState::Stopped;
                return;
            }
            inner.state = WorkerState::Stopping;
            let (tx, rx) = oneshot::channel();
            inner.exit_waiters.push(tx);
            (rx, inner.outbound.clone(), inner.kill.take())
        };

        info!(plugin = %self.name(), "stopping worker");
        if let Some(outbound) = outbound {
            let _ = outbound.send(WorkerMessage::shutdown());
        }

        let grace = self.shared.settings.shutdown_grace();
        let mut confirmed = tokio::time::timeout(grace, &mut exited).await.is_ok();
        if !confirmed {
            warn!(
                plugin = %self.name(),
                "no exit within {}ms; terminating",
                self.shared.settings.shutdown_grace_ms
            );
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            confirmed = tokio::time::timeout(grace, &mut exited).await.is_ok();
            if !confirmed {
                error!(plugin = %self.name(), "worker did not report exit after termination");
            }
        }

        let mut inner = self.shared.lock();
        if !confirmed {
            inner.run += 1;
        }
        inner.state = WorkerState::Stopped;
        inner.outbound = None;
        inner.kill = None;
        inner.pending.clear();
        inner.exit_waiters.clear();
        drop(inner);
        info!(plugin = %self.name(), "worker stopped");
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_process::InProcessBackend;
    use crate::test_plugins::{self, fast_settings, next_event};
    use serde_json::json;

    fn worker(entry: &str) -> PluginWorker {
        worker_with(WorkerConfig::new("echo-plugin", entry), fast_settings())
    }

    fn worker_with(config: WorkerConfig, settings: WorkerSettings) -> PluginWorker {
        PluginWorker::new(config, Arc::new(test_plugins::backend()), settings)
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
    }

    #[test]
    fn config_from_manifest_grants_required_only() {
        let manifest = PluginManifest::from_value(json!({
            "name": "notes",
            "version": "1.0.0",
            "permissions": { "required": ["data:memory"], "optional": ["net:outbound:https"] },
            "resourceLimits": { "maxMemoryMb": 64 }
        }))
        .unwrap();
        let config = WorkerConfig::from_manifest(&manifest, "/plugins/notes/main");
        assert_eq!(config.plugin_name, "notes");
        assert_eq!(config.permissions, vec![Capability::DataMemory]);
        assert_eq!(config.resource_limits.unwrap().max_memory_mb, Some(64));
    }

    #[tokio::test]
    async fn start_call_stop() {
        let worker = worker("echo");
        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        let result = worker.call("echo", json!({ "x": 1 })).await.unwrap();
        assert_eq!(result, json!({ "x": 1 }));

        let stats = worker.stats();
        assert!(stats.running);
        assert!(stats.start_time.is_some());
        assert_eq!(stats.pending_messages, 0);

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.stats().start_time.is_none());
        assert!(!worker.stats().running);
    }

    #[tokio::test]
    async fn second_start_fails_fast() {
        let worker = worker("echo");
        worker.start().await.unwrap();
        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        worker.stop().await;
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_clears_pending() {
        let worker = worker("echo");
        worker.start().await.unwrap();

        let err = worker
            .call_with_timeout("ping", Value::Null, Duration::from_millis(1000))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(worker.stats().pending_messages, 0);
        worker.stop().await;
    }

    #[tokio::test]
    async fn error_response_rejects_call() {
        let worker = worker("echo");
        worker.start().await.unwrap();
        let err = worker.call("fail", json!("nope")).await.unwrap_err();
        match err {
            Error::CallFailed { method, reason } => {
                assert_eq!(method, "fail");
                assert_eq!(reason, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
        worker.stop().await;
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        let worker = worker("echo");
        worker.start().await.unwrap();

        let calls = (0..5).map(|i| worker.call("echo", json!(i)));
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i));
        }
        assert_eq!(worker.stats().pending_messages, 0);
        worker.stop().await;
    }

    #[tokio::test]
    async fn calls_and_messages_need_a_running_worker() {
        let worker = worker("echo");
        let err = worker.call("echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning(_)));
        assert!(!worker.send_message(WorkerMessage::custom("poke", Value::Null)));
    }

    #[tokio::test]
    async fn execution_cap_shortens_call_timeout() {
        let config = WorkerConfig::new("capped", "echo").with_resource_limits(ResourceLimits {
            max_execution_time_ms: Some(100),
            ..Default::default()
        });
        let worker = worker_with(config, fast_settings());
        worker.start().await.unwrap();

        let started = Instant::now();
        let err = worker.call("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::CallTimeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        worker.stop().await;
    }

    #[tokio::test]
    async fn missing_ready_times_out() {
        let settings = WorkerSettings {
            ready_timeout_ms: 100,
            ..fast_settings()
        };
        let worker = worker_with(WorkerConfig::new("mute", "silent"), settings);
        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, Error::ReadyTimeout { timeout_ms: 100, .. }));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn exit_before_ready_fails_start_immediately() {
        let settings = WorkerSettings {
            ready_timeout_ms: 10_000,
            ..fast_settings()
        };
        let worker = worker_with(WorkerConfig::new("broken", "crash-on-start"), settings);
        let started = Instant::now();
        let err = worker.start().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            Error::StartFailed { reason, .. } => assert!(reason.contains("bad config")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn healthy_before_first_heartbeat() {
        let worker = worker("echo");
        assert!(!worker.is_healthy());
        worker.start().await.unwrap();
        assert!(worker.is_healthy());
        assert!(worker.stats().last_heartbeat.is_none());
        worker.stop().await;
    }

    #[tokio::test]
    async fn heartbeats_are_recorded() {
        let worker = worker("heartbeat");
        worker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(worker.stats().last_heartbeat.is_some());
        assert!(worker.is_healthy());
        worker.stop().await;
    }

    #[tokio::test]
    async fn missed_heartbeats_mark_worker_unhealthy() {
        let worker = worker("flatline");
        let (sink, mut failures) = mpsc::unbounded_channel();
        worker.set_failure_sink(sink);
        let mut events = worker.subscribe();
        worker.start().await.unwrap();

        loop {
            if next_event(&mut events).await == WorkerEvent::Unhealthy {
                break;
            }
        }
        assert!(!worker.is_healthy());
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.error, "heartbeat timeout");
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_a_worker_that_ignores_shutdown() {
        let worker = worker("stubborn");
        let mut events = worker.subscribe();
        worker.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, WorkerEvent::Ready);

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::Exit {
                code: None,
                requested: true
            }
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let worker = worker("echo");
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.start().await.unwrap();
        worker.stop().await;
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn crash_reports_one_failure() {
        let worker = worker("echo");
        let (sink, mut failures) = mpsc::unbounded_channel();
        worker.set_failure_sink(sink);
        let mut events = worker.subscribe();
        worker.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, WorkerEvent::Ready);

        assert!(worker.send_message(WorkerMessage::call("c", "crash", Value::Null)));
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::Error("asked to crash".into())
        );
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::Exit {
                code: Some(1),
                requested: false
            }
        );
        assert_eq!(worker.state(), WorkerState::Stopped);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.plugin_name, "echo-plugin");
        assert_eq!(failure.error, "asked to crash");
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn clean_exit_is_not_a_failure() {
        let worker = worker("echo");
        let (sink, mut failures) = mpsc::unbounded_channel();
        worker.set_failure_sink(sink);
        let mut events = worker.subscribe();
        worker.start().await.unwrap();
        next_event(&mut events).await;

        worker.send_message(WorkerMessage::call("c", "exit", json!(0)));
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::Exit {
                code: Some(0),
                requested: false
            }
        );
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_budget_is_bounded() {
        let worker = worker("echo");
        let mut events = worker.subscribe();
        worker.start().await.unwrap();

        for attempt in 1..=3 {
            worker.restart().await.unwrap();
            assert_eq!(worker.state(), WorkerState::Running);
            assert_eq!(worker.stats().restart_count, attempt);
        }

        let err = worker.restart().await.unwrap_err();
        assert!(matches!(err, Error::MaxRestarts { attempts: 3, .. }));
        assert_eq!(worker.state(), WorkerState::Stopped);

        let mut saw_max = false;
        while let Ok(event) = events.try_recv() {
            saw_max |= event == WorkerEvent::MaxRestarts;
        }
        assert!(saw_max);
    }

    #[tokio::test]
    async fn calls_during_restart_backoff_are_refused() {
        let settings = WorkerSettings {
            restart_base_delay_ms: 300,
            ..fast_settings()
        };
        let worker = Arc::new(worker_with(WorkerConfig::new("echo-plugin", "echo"), settings));
        worker.start().await.unwrap();

        let restarting = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.restart().await }
        });
        for _ in 0..100 {
            if worker.state() == WorkerState::Restarting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.state(), WorkerState::Restarting);

        let err = worker.call("echo", json!("early")).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning(_)));
        assert!(!worker.send_message(WorkerMessage::call("m", "echo", Value::Null)));
        assert_eq!(worker.stats().pending_messages, 0);

        restarting.await.unwrap().unwrap();
        assert_eq!(worker.call("echo", json!("late")).await.unwrap(), json!("late"));
        worker.stop().await;
    }

    #[tokio::test]
    async fn retired_worker_cannot_start_again() {
        let worker = worker("echo");
        worker.start().await.unwrap();
        worker.retire().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(matches!(worker.start().await, Err(Error::NotRunning(_))));
        assert!(matches!(worker.restart().await, Err(Error::NotRunning(_))));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn stable_run_resets_restart_counter() {
        let settings = WorkerSettings {
            stable_window_ms: 50,
            ..fast_settings()
        };
        let worker = worker_with(WorkerConfig::new("echo-plugin", "echo"), settings);
        worker.start().await.unwrap();
        worker.restart().await.unwrap();
        worker.restart().await.unwrap();
        assert_eq!(worker.stats().restart_count, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.restart().await.unwrap();
        assert_eq!(worker.stats().restart_count, 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn plugin_messages_are_dispatched_by_type() {
        let worker = worker("echo");
        let mut events = worker.subscribe();
        worker.start().await.unwrap();
        next_event(&mut events).await;

        worker.send_message(WorkerMessage::call("c1", "log", json!("hello")));
        worker.send_message(WorkerMessage::call(
            "c2",
            "ask",
            json!({ "capability": "data:secrets", "reason": "read api key" }),
        ));
        worker.send_message(WorkerMessage::call("c3", "notify", json!({ "pct": 40 })));

        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::PermissionRequest {
                id: Some("c2".into()),
                capability: "data:secrets".into(),
                reason: "read api key".into(),
            }
        );
        match next_event(&mut events).await {
            WorkerEvent::Message(msg) => {
                assert_eq!(msg.kind, MessageKind::Custom("progress".into()));
                assert_eq!(msg.payload, Some(json!({ "pct": 40 })));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        worker.stop().await;
    }

    #[tokio::test]
    async fn unit_sees_filtered_env_and_init_data() {
        let config = WorkerConfig::new("env-plugin", "echo")
            .with_permissions([Capability::DataMemory])
            .with_resource_limits(ResourceLimits {
                max_memory_mb: Some(128),
                ..Default::default()
            })
            .with_env("PLUGIN_TOKEN", "abc");
        let worker = worker_with(config, fast_settings());
        worker.start().await.unwrap();

        let env = worker.call("env", Value::Null).await.unwrap();
        assert_eq!(env["WARDEN_RUNTIME_MODE"], "production");
        assert_eq!(env["PLUGIN_TOKEN"], "abc");
        assert_eq!(env["WARDEN_MAX_YOUNG_GEN_MB"], "32");
        assert_eq!(env["WARDEN_MAX_OLD_GEN_MB"], "96");
        assert!(env.get("PATH").is_none());

        let init: crate::backend::InitData =
            serde_json::from_str(env[INIT_ENV_VAR].as_str().unwrap()).unwrap();
        assert_eq!(init.plugin_name, "env-plugin");
        assert_eq!(init.entry_path, PathBuf::from("echo"));
        assert_eq!(init.permissions, vec![Capability::DataMemory]);
        worker.stop().await;
    }

    #[tokio::test]
    async fn dropping_a_worker_releases_its_state() {
        let backend = InProcessBackend::new().register("watch", test_plugins::stubborn);
        let worker = PluginWorker::new(
            WorkerConfig::new("watched", "watch"),
            Arc::new(backend),
            fast_settings(),
        );
        worker.start().await.unwrap();
        let weak = Arc::downgrade(&worker.shared);
        drop(worker);
        assert!(weak.upgrade().is_none());
    }
}
