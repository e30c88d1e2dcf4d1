use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use warden_security::Capability;

/// Always present in a worker's environment.
pub const RUNTIME_MODE_VAR: &str = "WARDEN_RUNTIME_MODE";
pub const RUNTIME_MODE: &str = "production";

/// Host variables a plugin may see when it holds `process:env:read`.
static SAFE_HOST_VARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(LOG_LEVEL|RUST_LOG|DEBUG|TZ|LANG|LANGUAGE|LC_[A-Z_]+)$").expect("static regex")
});

pub fn is_safe_host_var(name: &str) -> bool {
    SAFE_HOST_VARS.is_match(name)
}

/// Build the environment an isolated worker starts with.
///
/// Starts from the baseline, adds allow-listed host variables only if the
/// plugin holds `process:env:read`, then layers `overrides` on top
/// unconditionally. Nothing else from the host leaks through.
pub fn build_safe_env(
    host_env: impl IntoIterator<Item = (String, String)>,
    permissions: &[Capability],
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(RUNTIME_MODE_VAR.to_string(), RUNTIME_MODE.to_string());

    if permissions.contains(&Capability::ProcessEnvRead) {
        env.extend(host_env.into_iter().filter(|(key, _)| is_safe_host_var(key)));
    }

    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Vec<(String, String)> {
        [
            ("PATH", "/usr/bin"),
            ("HOME", "/home/me"),
            ("AWS_SECRET_ACCESS_KEY", "hunter2"),
            ("LOG_LEVEL", "debug"),
            ("TZ", "UTC"),
            ("LC_ALL", "C.UTF-8"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn without_env_read_only_baseline_and_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("PLUGIN_TOKEN".to_string(), "abc".to_string());

        let env = build_safe_env(host(), &[Capability::DataMemory], &overrides);
        assert_eq!(env.len(), 2);
        assert_eq!(env[RUNTIME_MODE_VAR], RUNTIME_MODE);
        assert_eq!(env["PLUGIN_TOKEN"], "abc");
    }

    #[test]
    fn env_read_forwards_only_safe_patterns() {
        let env = build_safe_env(host(), &[Capability::ProcessEnvRead], &HashMap::new());
        assert_eq!(env["LOG_LEVEL"], "debug");
        assert_eq!(env["TZ"], "UTC");
        assert_eq!(env["LC_ALL"], "C.UTF-8");
        assert!(!env.contains_key("PATH"));
        assert!(!env.contains_key("HOME"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn overrides_win_over_host_values() {
        let mut overrides = HashMap::new();
        overrides.insert("LOG_LEVEL".to_string(), "trace".to_string());
        overrides.insert(RUNTIME_MODE_VAR.to_string(), "test".to_string());

        let env = build_safe_env(host(), &[Capability::ProcessEnvRead], &overrides);
        assert_eq!(env["LOG_LEVEL"], "trace");
        assert_eq!(env[RUNTIME_MODE_VAR], "test");
    }

    #[test]
    fn safe_pattern_is_anchored() {
        assert!(is_safe_host_var("LANG"));
        assert!(!is_safe_host_var("LANGUAGE_SERVER_TOKEN"));
        assert!(!is_safe_host_var("MY_LOG_LEVEL"));
        assert!(!is_safe_host_var("DEBUGGER"));
    }
}
