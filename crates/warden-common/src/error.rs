use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("permission denied: plugin '{plugin}' lacks capability '{capability}'")]
    PermissionDenied { plugin: String, capability: String },

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("worker '{0}' is already running")]
    AlreadyRunning(String),

    #[error("worker '{0}' is not running")]
    NotRunning(String),

    #[error("a worker for plugin '{0}' already exists")]
    DuplicateWorker(String),

    #[error("worker '{plugin}' failed to start: {reason}")]
    StartFailed { plugin: String, reason: String },

    #[error("worker '{plugin}' did not become ready within {timeout_ms}ms")]
    ReadyTimeout { plugin: String, timeout_ms: u64 },

    #[error("call '{method}' timed out after {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("call '{method}' failed: {reason}")]
    CallFailed { method: String, reason: String },

    #[error("worker '{plugin}' exceeded {attempts} restart attempts")]
    MaxRestarts { plugin: String, attempts: u32 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn permission_denied(plugin: impl Into<String>, capability: impl ToString) -> Self {
        Self::PermissionDenied {
            plugin: plugin.into(),
            capability: capability.to_string(),
        }
    }

    /// Whether this error was produced by `PermissionGuard::check`.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn call_timeout_message_mentions_timed_out() {
        let err = Error::CallTimeout {
            method: "ping".into(),
            timeout_ms: 1000,
        };
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("ping"));
    }

    #[test]
    fn permission_denied_carries_plugin_and_capability() {
        let err = Error::permission_denied("echo-plugin", "data:secrets");
        assert!(err.is_permission_denied());
        let text = err.to_string();
        assert!(text.contains("echo-plugin"));
        assert!(text.contains("data:secrets"));
    }
}
