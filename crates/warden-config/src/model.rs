use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use warden_security::UnsupervisedPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub log_level: Option<String>,

    /// Where plugin directories (manifest + entry point) live.
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,

    /// Command that hosts plugin entry points. When unset, entry points are
    /// executed directly.
    #[serde(default)]
    pub runner: Option<RunnerConfig>,

    #[serde(default)]
    pub workers: WorkerTimings,

    #[serde(default)]
    pub permissions: PermissionSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            plugins_dir: None,
            runner: None,
            workers: WorkerTimings::default(),
            permissions: PermissionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Worker lifecycle timings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTimings {
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,

    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// A run that lasts this long resets the restart counter.
    #[serde(default = "default_stable_window_ms")]
    pub stable_window_ms: u64,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            restart_base_delay_ms: default_restart_base_delay_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            stable_window_ms: default_stable_window_ms(),
        }
    }
}

impl WorkerTimings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_millis(self.restart_base_delay_ms)
    }

    pub fn stable_window(&self) -> Duration {
        Duration::from_millis(self.stable_window_ms)
    }
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_restart_base_delay_ms() -> u64 {
    1_000
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_stable_window_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSettings {
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,

    #[serde(default)]
    pub unsupervised_policy: UnsupervisedPolicy,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            approval_timeout_ms: default_approval_timeout_ms(),
            unsupervised_policy: UnsupervisedPolicy::default(),
        }
    }
}

impl PermissionSettings {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }
}

fn default_approval_timeout_ms() -> u64 {
    30_000
}
