use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use warden_common::{Error, Result};

use crate::capability::Capability;

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// A plugin's declared identity, capabilities, and isolation preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entry file, relative to the plugin directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    pub permissions: ManifestPermissions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_config: Option<IsolationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityMetadata>,
    /// Names of host environment variables the plugin expects. Never values.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub required_env: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestPermissions {
    pub required: Vec<Capability>,
    pub optional: Vec<Capability>,
}

/// Resource caps for an isolated worker. Absent fields mean "no cap".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_network_bytes_per_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_handles: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: IsolationLevel,
    #[serde(default, deserialize_with = "null_as_default")]
    pub network: NetworkMode,
    #[serde(default, deserialize_with = "null_as_default")]
    pub filesystem: FilesystemMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    None,
    #[default]
    Process,
    Container,
    Vm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Host,
    #[default]
    Restricted,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemMode {
    Full,
    #[default]
    Workspace,
    Readonly,
    None,
}

/// Per-file SHA-256 checksums plus an optional detached signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityMetadata {
    /// Relative path → lowercase hex SHA-256.
    #[serde(default, deserialize_with = "null_as_default")]
    pub checksums: BTreeMap<String, String>,
    /// Base64 Ed25519 signature over the canonical checksum listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_fingerprint: Option<String>,
}

/// Explicit `null` reads as the field's default, the same as an absent key.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Outcome of [`validate_manifest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl PluginManifest {
    /// Validate and deserialize a raw manifest value.
    pub fn from_value(raw: Value) -> Result<Self> {
        let result = validate_manifest(&raw);
        if !result.valid {
            return Err(Error::Manifest(result.errors.join("; ")));
        }
        serde_json::from_value(raw).map_err(|e| Error::Manifest(format!("invalid manifest: {e}")))
    }

    /// Load a manifest from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = read_raw_manifest(path)?;
        debug!("loaded manifest from {}", path.display());
        Self::from_value(raw)
    }

    /// Required capabilities followed by optional ones, without duplicates.
    pub fn declared_capabilities(&self) -> Vec<Capability> {
        let mut caps = self.permissions.required.clone();
        for cap in &self.permissions.optional {
            if !caps.contains(cap) {
                caps.push(*cap);
            }
        }
        caps
    }

    pub fn declares(&self, capability: Capability) -> bool {
        self.permissions.required.contains(&capability)
            || self.permissions.optional.contains(&capability)
    }
}

/// Read a manifest file into an untyped value without validating it.
pub fn read_raw_manifest(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(&contents)
            .map_err(|e| Error::Manifest(format!("failed to parse TOML manifest: {e}")))
    } else {
        serde_json::from_str(&contents)
            .map_err(|e| Error::Manifest(format!("failed to parse JSON manifest: {e}")))
    }
}

/// Structural and semantic checks over an untyped manifest.
///
/// Never fails: every problem is collected into [`ValidationResult::errors`]
/// and the caller decides whether to reject, quarantine, or warn.
pub fn validate_manifest(raw: &Value) -> ValidationResult {
    let mut errors = Vec::new();

    let Some(obj) = raw.as_object() else {
        return ValidationResult {
            valid: false,
            errors: vec!["manifest must be an object".to_string()],
        };
    };

    for field in ["name", "version"] {
        match obj.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            _ => errors.push(format!("manifest.{field} must be a non-empty string")),
        }
    }

    if let Some(description) = obj.get("description") {
        if !description.is_string() && !description.is_null() {
            errors.push("manifest.description must be a string".to_string());
        }
    }

    if let Some(main) = present(obj, "main") {
        match main.as_str() {
            Some(path) if !path.trim().is_empty() && stays_inside(Path::new(path)) => {}
            _ => errors.push(
                "manifest.main must be a relative path inside the plugin directory".to_string(),
            ),
        }
    }

    match obj.get("permissions") {
        Some(Value::Object(perms)) => {
            check_capability_list(perms, "required", &mut errors);
            check_capability_list(perms, "optional", &mut errors);
        }
        _ => errors.push("manifest.permissions must be an object".to_string()),
    }

    if let Some(limits) = present(obj, "resourceLimits") {
        check_resource_limits(limits, &mut errors);
    }
    if let Some(isolation) = present(obj, "isolationConfig") {
        check_isolation_config(isolation, &mut errors);
    }
    if let Some(integrity) = present(obj, "integrity") {
        check_integrity(integrity, &mut errors);
    }
    if let Some(env) = present(obj, "requiredEnv") {
        check_required_env(env, &mut errors);
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

/// True for a relative path with no `..` component.
pub(crate) fn stays_inside(path: &Path) -> bool {
    !path.has_root()
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir | Component::Prefix(_)))
}

fn present<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn check_capability_list(perms: &Map<String, Value>, key: &str, errors: &mut Vec<String>) {
    let Some(Value::Array(items)) = perms.get(key) else {
        errors.push(format!("manifest.permissions.{key} must be an array"));
        return;
    };

    for (index, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(tag) if Capability::is_known(tag) => {}
            Some(tag) => errors.push(format!("unknown capability '{tag}' in permissions.{key}")),
            None => errors.push(format!("permissions.{key}[{index}] must be a string")),
        }
    }
}

fn check_resource_limits(limits: &Value, errors: &mut Vec<String>) {
    let Some(limits) = limits.as_object() else {
        errors.push("manifest.resourceLimits must be an object".to_string());
        return;
    };

    for key in [
        "maxMemoryMb",
        "maxCpuPercent",
        "maxNetworkBytesPerSec",
        "maxFileHandles",
        "maxExecutionTimeMs",
    ] {
        let Some(value) = present(limits, key) else {
            continue;
        };
        if value.as_u64().is_none() {
            errors.push(format!(
                "resourceLimits.{key} must be a non-negative integer"
            ));
        }
    }

    if let Some(cpu) = present(limits, "maxCpuPercent").and_then(Value::as_u64) {
        if cpu == 0 || cpu > 100 {
            errors.push("resourceLimits.maxCpuPercent must be between 1 and 100".to_string());
        }
    }
}

fn check_isolation_config(isolation: &Value, errors: &mut Vec<String>) {
    let Some(isolation) = isolation.as_object() else {
        errors.push("manifest.isolationConfig must be an object".to_string());
        return;
    };

    let allowed: [(&str, &[&str]); 3] = [
        ("level", &["none", "process", "container", "vm"]),
        ("network", &["host", "restricted", "none"]),
        ("filesystem", &["full", "workspace", "readonly", "none"]),
    ];

    for (key, values) in allowed {
        let Some(value) = present(isolation, key) else {
            continue;
        };
        match value.as_str() {
            Some(v) if values.contains(&v) => {}
            _ => errors.push(format!(
                "isolationConfig.{key} must be one of: {}",
                values.join(", ")
            )),
        }
    }
}

fn check_integrity(integrity: &Value, errors: &mut Vec<String>) {
    let Some(integrity) = integrity.as_object() else {
        errors.push("manifest.integrity must be an object".to_string());
        return;
    };

    if let Some(checksums) = present(integrity, "checksums") {
        match checksums.as_object() {
            Some(map) => {
                for (file, digest) in map {
                    if !digest.is_string() {
                        errors.push(format!("integrity.checksums['{file}'] must be a string"));
                    }
                }
            }
            None => errors.push("integrity.checksums must be an object".to_string()),
        }
    }

    for key in ["signature", "signerFingerprint"] {
        if let Some(value) = present(integrity, key) {
            if !value.is_string() {
                errors.push(format!("integrity.{key} must be a string"));
            }
        }
    }
}

fn check_required_env(env: &Value, errors: &mut Vec<String>) {
    let Some(names) = env.as_array() else {
        errors.push("manifest.requiredEnv must be an array".to_string());
        return;
    };

    for (index, name) in names.iter().enumerate() {
        match name.as_str() {
            Some(n) if ENV_NAME.is_match(n) => {}
            Some(n) => errors.push(format!("requiredEnv '{n}' is not a valid variable name")),
            None => errors.push(format!("requiredEnv[{index}] must be a string")),
        }
    }
}
