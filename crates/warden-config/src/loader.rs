use std::path::{Path, PathBuf};

use tracing::info;
use warden_common::{Error, Result};

use crate::model::HostConfig;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".warden"));
        let xdg_config = dirs::config_dir().map(|c| c.join("warden"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                if xdg.exists() {
                    xdg
                } else if home.exists() {
                    home
                } else {
                    xdg
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".warden"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Returns true if a config file (YAML or TOML) exists on disk.
    pub fn config_file_exists(&self) -> bool {
        self.config_dir.join("config.yml").exists() || self.config_dir.join("config.toml").exists()
    }

    pub fn load(&self) -> Result<HostConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))
        } else {
            info!("no config file found, using defaults");
            Ok(HostConfig::default())
        }
    }

    /// The configured plugins directory, or `<config_dir>/plugins`.
    pub fn plugins_dir(&self, config: &HostConfig) -> PathBuf {
        config
            .plugins_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("plugins"))
    }

    pub fn ensure_dirs(&self, config: &HostConfig) -> Result<()> {
        for dir in [self.config_dir.clone(), self.plugins_dir(config)] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigLoader;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use warden_security::UnsupervisedPolicy;

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "warden-config-test-{}-{}-{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn load_returns_default_when_no_config_exists() {
        let dir = temp_dir("default");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.workers.ready_timeout_ms, 10_000);
        assert_eq!(config.workers.heartbeat_timeout_ms, 15_000);
        assert_eq!(config.workers.max_restart_attempts, 3);
        assert_eq!(config.permissions.approval_timeout_ms, 30_000);
        assert_eq!(
            config.permissions.unsupervised_policy,
            UnsupervisedPolicy::AllowSafe
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_prefers_yaml_over_toml_when_both_exist() {
        let dir = temp_dir("yaml-precedence");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.yml"),
            "workers:\n  call_timeout_ms: 1000\npermissions:\n  unsupervised_policy: deny_all\n",
        )
        .expect("failed to write yaml config");
        fs::write(dir.join("config.toml"), "[workers]\ncall_timeout_ms = 9999\n")
            .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.workers.call_timeout_ms, 1000);
        assert_eq!(config.workers.shutdown_grace_ms, 5_000);
        assert_eq!(
            config.permissions.unsupervised_policy,
            UnsupervisedPolicy::DenyAll
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reads_toml_when_yaml_missing() {
        let dir = temp_dir("toml");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.toml"),
            "log_level = \"debug\"\n\n[runner]\ncommand = \"/usr/bin/node\"\nargs = [\"--no-warnings\"]\n\n[workers]\nmax_restart_attempts = 5\n",
        )
        .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.workers.max_restart_attempts, 5);
        let runner = config.runner.expect("runner should be set");
        assert_eq!(runner.command, PathBuf::from("/usr/bin/node"));
        assert_eq!(runner.args, vec!["--no-warnings".to_string()]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let dir = temp_dir("invalid");
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        fs::write(dir.join("config.yml"), "workers: [unclosed").expect("write");

        let loader = ConfigLoader::with_dir(&dir);
        let err = loader.load().expect_err("load should fail");
        assert!(err.to_string().contains("YAML"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ensure_dirs_creates_plugins_directory() {
        let dir = temp_dir("ensure-dirs");
        let loader = ConfigLoader::with_dir(&dir);
        let config = crate::model::HostConfig::default();

        loader.ensure_dirs(&config).expect("ensure_dirs should succeed");

        assert!(dir.exists());
        assert!(dir.join("plugins").exists());
        assert!(!loader.config_file_exists());

        let _ = fs::remove_dir_all(dir);
    }
}
