use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use warden_common::{Error, Result};
use warden_config::RunnerConfig;

use crate::backend::{IsolationBackend, LaunchSpec, UnitEvent, UnitHandle};
use crate::protocol::WorkerMessage;

/// How long the exit notification waits for stdout to drain.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

/// Runs every plugin in its own OS process speaking newline-delimited JSON
/// over stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    runner: Option<RunnerConfig>,
}

impl ProcessBackend {
    /// Execute each plugin's entry path directly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every plugin through `runner`, which gets the entry path as its
    /// last argument.
    pub fn with_runner(runner: RunnerConfig) -> Self {
        Self {
            runner: Some(runner),
        }
    }

    fn program(&self, entry: &Path) -> PathBuf {
        match &self.runner {
            Some(runner) => runner.command.clone(),
            None => entry.to_path_buf(),
        }
    }

    /// `entry` must be absolute: a relative program path would be resolved
    /// against the plugin directory after the chdir.
    fn command(&self, spec: &LaunchSpec, entry: &Path) -> Command {
        let mut cmd = match &self.runner {
            Some(runner) => {
                let mut cmd = Command::new(&runner.command);
                cmd.args(&runner.args).arg(entry);
                cmd
            }
            None => Command::new(entry),
        };

        cmd.env_clear()
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = entry.parent().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<UnitHandle> {
        let entry = std::path::absolute(&spec.entry_path).map_err(|e| Error::StartFailed {
            plugin: spec.plugin_name.clone(),
            reason: format!("invalid entry path {}: {e}", spec.entry_path.display()),
        })?;
        let mut child = self
            .command(&spec, &entry)
            .spawn()
            .map_err(|e| Error::StartFailed {
                plugin: spec.plugin_name.clone(),
                reason: format!("failed to spawn {}: {e}", self.program(&entry).display()),
            })?;

        let transport = |what: &str| Error::StartFailed {
            plugin: spec.plugin_name.clone(),
            reason: format!("child {what} was not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| transport("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| transport("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| transport("stderr"))?;

        debug!(
            plugin = %spec.plugin_name,
            pid = child.id().unwrap_or_default(),
            "spawned plugin process"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_loop(spec.plugin_name.clone(), stdin, outbound_rx));
        tokio::spawn(stderr_loop(spec.plugin_name.clone(), stderr));
        let reader = tokio::spawn(read_loop(spec.plugin_name.clone(), stdout, events_tx.clone()));
        tokio::spawn(async move {
            let status = wait_or_kill(&mut child, kill_rx).await;
            // Deliver whatever the plugin printed before it went away.
            let _ = tokio::time::timeout(STDOUT_DRAIN, reader).await;
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    let _ = events_tx.send(UnitEvent::Error(format!("wait failed: {e}")));
                    None
                }
            };
            let _ = events_tx.send(UnitEvent::Exit(code));
        });

        Ok(UnitHandle {
            outbound: outbound_tx,
            events: events_rx,
            kill: kill_tx,
        })
    }
}

async fn wait_or_kill(
    child: &mut Child,
    kill: oneshot::Receiver<()>,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill plugin process: {e}");
            }
            child.wait().await
        }
    }
}

async fn write_loop(
    plugin: String,
    mut stdin: tokio::process::ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        let mut line = match msg.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(plugin = %plugin, "dropping unserializable message: {e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(plugin = %plugin, "plugin stdin closed: {e}");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(plugin = %plugin, "plugin stdin flush failed: {e}");
            break;
        }
    }
}

async fn read_loop(
    plugin: String,
    stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match WorkerMessage::from_line(&line) {
                Ok(msg) => {
                    if events.send(UnitEvent::Message(msg)).is_err() {
                        break;
                    }
                }
                Err(_) => debug!(plugin = %plugin, "stdout: {line}"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = %plugin, "failed to read plugin stdout: {e}");
                break;
            }
        }
    }
}

async fn stderr_loop(plugin: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %plugin, "stderr: {line}");
    }
}
