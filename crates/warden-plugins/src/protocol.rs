use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `type` tag of a [`WorkerMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ready,
    Heartbeat,
    Call,
    Response,
    Log,
    Shutdown,
    PermissionRequest,
    /// Any tag the host does not interpret itself.
    Custom(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::Heartbeat => "heartbeat",
            Self::Call => "call",
            Self::Response => "response",
            Self::Log => "log",
            Self::Shutdown => "shutdown",
            Self::PermissionRequest => "permission:request",
            Self::Custom(tag) => tag.as_str(),
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ready" => Self::Ready,
            "heartbeat" => Self::Heartbeat,
            "call" => Self::Call,
            "response" => Self::Response,
            "log" => Self::Log,
            "shutdown" => Self::Shutdown,
            "permission:request" => Self::PermissionRequest,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// Wire envelope exchanged with an isolated worker: `{type, id?, payload?, error?}`.
///
/// Sent as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            id: None,
            payload: None,
            error: None,
        }
    }

    pub fn ready() -> Self {
        Self::new(MessageKind::Ready)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat)
    }

    pub fn shutdown() -> Self {
        Self::new(MessageKind::Shutdown)
    }

    pub fn call(id: impl Into<String>, method: &str, args: Value) -> Self {
        Self {
            id: Some(id.into()),
            payload: Some(serde_json::json!({ "method": method, "args": args })),
            ..Self::new(MessageKind::Call)
        }
    }

    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            payload: Some(payload),
            ..Self::new(MessageKind::Response)
        }
    }

    pub fn error_response(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error.into()),
            ..Self::new(MessageKind::Response)
        }
    }

    pub fn log(level: &str, message: impl Into<String>) -> Self {
        Self {
            payload: Some(serde_json::json!({ "level": level, "message": message.into() })),
            ..Self::new(MessageKind::Log)
        }
    }

    pub fn permission_request(id: impl Into<String>, capability: &str, reason: &str) -> Self {
        Self {
            id: Some(id.into()),
            payload: Some(serde_json::json!({ "capability": capability, "reason": reason })),
            ..Self::new(MessageKind::PermissionRequest)
        }
    }

    pub fn custom(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(MessageKind::Custom(tag.into()))
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// `(method, args)` of a `call` message.
    pub fn call_parts(&self) -> Option<(&str, &Value)> {
        if self.kind != MessageKind::Call {
            return None;
        }
        let payload = self.payload.as_ref()?;
        let method = payload.get("method")?.as_str()?;
        let args = payload.get("args").unwrap_or(&Value::Null);
        Some((method, args))
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
