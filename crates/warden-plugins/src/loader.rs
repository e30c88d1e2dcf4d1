use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use warden_common::Result;
use warden_security::{PluginManifest, verify_integrity};

use crate::worker::WorkerConfig;

/// Manifest file names, in lookup order.
pub const MANIFEST_FILES: [&str; 2] = ["plugin.json", "plugin.toml"];

/// A plugin directory with a valid manifest.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub root: PathBuf,
    pub manifest_path: PathBuf,
}

impl DiscoveredPlugin {
    /// The manifest's `main`, or else a file named after the plugin or
    /// `plugin` in its directory.
    pub fn entry_path(&self) -> Option<PathBuf> {
        if let Some(main) = &self.manifest.main {
            return Some(self.root.join(main));
        }
        [self.manifest.name.as_str(), "plugin"]
            .into_iter()
            .map(|candidate| self.root.join(candidate))
            .find(|path| path.is_file())
    }

    /// Worker configuration granting the manifest's required capabilities.
    pub fn worker_config(&self) -> Option<WorkerConfig> {
        self.entry_path()
            .map(|entry| WorkerConfig::from_manifest(&self.manifest, entry))
    }
}

/// Discovers plugins from the plugins directory.
#[derive(Debug, Clone)]
pub struct PluginLoader {
    plugins_dir: PathBuf,
    trusted_key: Option<Vec<u8>>,
}

impl PluginLoader {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            trusted_key: None,
        }
    }

    /// Only accept plugins signed by this Ed25519 public key.
    pub fn with_trusted_key(mut self, public_key: impl Into<Vec<u8>>) -> Self {
        self.trusted_key = Some(public_key.into());
        self
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Scan the plugins directory. Directories without a manifest are
    /// skipped silently; invalid or tampered plugins are skipped with a warning.
    pub fn discover(&self) -> Result<Vec<DiscoveredPlugin>> {
        if !self.plugins_dir.exists() {
            return Ok(Vec::new());
        }

        let mut plugins = Vec::new();
        let mut seen = HashSet::new();

        for entry in std::fs::read_dir(&self.plugins_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match self.load_plugin(&path) {
                Ok(Some(plugin)) => {
                    if !seen.insert(plugin.manifest.name.clone()) {
                        warn!(
                            "duplicate plugin name '{}' at {}; skipping",
                            plugin.manifest.name,
                            path.display()
                        );
                        continue;
                    }
                    info!(
                        "discovered plugin: {} {}",
                        plugin.manifest.name, plugin.manifest.version
                    );
                    plugins.push(plugin);
                }
                Ok(None) => {}
                Err(e) => warn!("failed to load plugin at {}: {e}", path.display()),
            }
        }

        plugins.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        Ok(plugins)
    }

    /// Look up one discovered plugin by manifest name.
    pub fn find(&self, name: &str) -> Result<Option<DiscoveredPlugin>> {
        Ok(self
            .discover()?
            .into_iter()
            .find(|plugin| plugin.manifest.name == name))
    }

    fn load_plugin(&self, plugin_dir: &Path) -> Result<Option<DiscoveredPlugin>> {
        let Some(manifest_path) = MANIFEST_FILES
            .iter()
            .map(|file| plugin_dir.join(file))
            .find(|path| path.is_file())
        else {
            return Ok(None);
        };

        let manifest = PluginManifest::from_file(&manifest_path)?;
        verify_integrity(&manifest, plugin_dir, self.trusted_key.as_deref())?;

        Ok(Some(DiscoveredPlugin {
            manifest,
            root: plugin_dir.to_path_buf(),
            manifest_path,
        }))
    }
}
