use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use warden_common::Error;

/// The six groups every capability belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Filesystem,
    Network,
    Process,
    System,
    Ai,
    Data,
}

impl CapabilityCategory {
    pub const ALL: [CapabilityCategory; 6] = [
        Self::Filesystem,
        Self::Network,
        Self::Process,
        Self::System,
        Self::Ai,
        Self::Data,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Process => "process",
            Self::System => "system",
            Self::Ai => "ai",
            Self::Data => "data",
        }
    }

    /// Every capability in this category, in catalog order.
    pub fn capabilities(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .iter()
            .copied()
            .filter(move |cap| cap.category() == self)
    }
}

impl fmt::Display for CapabilityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! capabilities {
    ($( $variant:ident => $tag:literal, $category:ident, $dangerous:literal, $desc:literal; )*) => {
        /// An atomic, namespaced permission token (`domain:action[:scope]`).
        ///
        /// The catalog is closed: adding a capability means adding a variant
        /// here, and every `match` over capabilities has to account for it.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Capability {
            $($variant,)*
        }

        impl Capability {
            pub const ALL: &'static [Capability] = &[$(Capability::$variant,)*];

            /// The wire form of this capability.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Capability::$variant => $tag,)*
                }
            }

            pub const fn category(self) -> CapabilityCategory {
                match self {
                    $(Capability::$variant => CapabilityCategory::$category,)*
                }
            }

            /// Dangerous capabilities always need an explicit interactive
            /// approval and are never granted silently.
            pub const fn is_dangerous(self) -> bool {
                match self {
                    $(Capability::$variant => $dangerous,)*
                }
            }

            pub const fn description(self) -> &'static str {
                match self {
                    $(Capability::$variant => $desc,)*
                }
            }

            /// Look up a capability by its wire form.
            pub fn parse(tag: &str) -> Option<Self> {
                match tag {
                    $($tag => Some(Capability::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

capabilities! {
    FsReadWorkspace => "fs:read:workspace", Filesystem, false, "Read files inside the plugin workspace";
    FsWriteWorkspace => "fs:write:workspace", Filesystem, false, "Write files inside the plugin workspace";
    FsReadHome => "fs:read:home", Filesystem, false, "Read files in the user's home directory";
    FsWriteHome => "fs:write:home", Filesystem, true, "Write files in the user's home directory";
    FsReadSystem => "fs:read:system", Filesystem, true, "Read files anywhere on the system";
    FsWriteAny => "fs:write:any", Filesystem, true, "Write files anywhere on the system";

    NetOutboundHttps => "net:outbound:https", Network, false, "Make outbound HTTPS requests";
    NetOutboundHttp => "net:outbound:http", Network, false, "Make outbound plain HTTP requests";
    NetOutboundWebsocket => "net:outbound:websocket", Network, false, "Open outbound WebSocket connections";
    NetLocalhost => "net:localhost", Network, false, "Connect to services on localhost";
    NetInboundListen => "net:inbound:listen", Network, true, "Listen for inbound network connections";

    ProcessEnvRead => "process:env:read", Process, false, "Read safe host environment variables";
    ProcessSpawn => "process:spawn", Process, true, "Spawn child processes";
    ProcessShell => "process:shell", Process, true, "Run arbitrary shell commands";

    SystemInfo => "system:info", System, false, "Read OS information, hostname and uptime";
    SystemNotifications => "system:notifications", System, false, "Show desktop notifications";
    SystemClipboardRead => "system:clipboard:read", System, false, "Read the clipboard";
    SystemClipboardWrite => "system:clipboard:write", System, false, "Write to the clipboard";
    SystemScreenCapture => "system:screen:capture", System, true, "Capture the screen";
    SystemKeychain => "system:keychain", System, true, "Access the system keychain";

    AiInference => "ai:inference", Ai, false, "Run model inference through the host";
    AiEmbedding => "ai:embedding", Ai, false, "Compute embeddings through the host";
    AiModelDownload => "ai:model:download", Ai, false, "Download model weights";

    DataMemory => "data:memory", Data, false, "Read and write the plugin's own memory store";
    DataConversationsRead => "data:conversations:read", Data, false, "Read conversation history";
    DataConversationsWrite => "data:conversations:write", Data, false, "Append to conversation history";
    DataSecrets => "data:secrets", Data, true, "Read stored secrets and API keys";
    DataWalletSign => "data:wallet:sign", Data, true, "Sign wallet transactions";
}

impl Capability {
    /// Every capability flagged dangerous.
    pub fn dangerous() -> impl Iterator<Item = Capability> {
        Self::ALL.iter().copied().filter(|cap| cap.is_dangerous())
    }

    pub fn is_known(tag: &str) -> bool {
        Self::parse(tag).is_some()
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| Error::UnknownCapability(s.to_string()))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Capability {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown capability '{s}'")))
    }
}
