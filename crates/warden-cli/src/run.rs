use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tracing::info;
use warden_config::{ConfigLoader, HostConfig, RunnerConfig};
use warden_plugins::loader::MANIFEST_FILES;
use warden_plugins::{
    DiscoveredPlugin, IsolationBackend, PluginLoader, PluginWorkerPool, ProcessBackend,
    WorkerConfig, serve_permission_requests,
};
use warden_security::{PermissionRegistry, PluginManifest, verify_integrity};

use crate::approval;

#[derive(Args)]
pub struct RunArgs {
    /// Plugin name in the plugins directory, a plugin directory, or a manifest file
    pub plugin: String,

    /// Entry point to execute instead of the manifest's `main`
    #[arg(long)]
    pub entry: Option<PathBuf>,

    /// Command that hosts the entry point (receives it as its last argument)
    #[arg(long)]
    pub runner: Option<PathBuf>,

    /// Method to call once the plugin is ready
    #[arg(long)]
    pub call: Option<String>,

    /// JSON arguments for --call
    #[arg(long, default_value = "null")]
    pub args: String,
}

pub async fn run(args: RunArgs, config: &HostConfig, config_loader: &ConfigLoader) -> Result<()> {
    let plugin = resolve_plugin(&args.plugin, &config_loader.plugins_dir(config))?;
    let entry = args
        .entry
        .clone()
        .or_else(|| plugin.entry_path())
        .context("no entry point: pass --entry or set `main` in the manifest")?;

    let runner = args
        .runner
        .map(|command| RunnerConfig {
            command,
            args: Vec::new(),
        })
        .or_else(|| config.runner.clone());
    let backend: Arc<dyn IsolationBackend> = match runner {
        Some(runner) => Arc::new(ProcessBackend::with_runner(runner)),
        None => Arc::new(ProcessBackend::new()),
    };

    let registry = PermissionRegistry::with_settings(
        config.permissions.approval_timeout(),
        config.permissions.unsupervised_policy,
    );
    let prompts = std::io::stdin()
        .is_terminal()
        .then(|| tokio::spawn(approval::prompt_loop(registry.subscribe())));

    let worker_config = WorkerConfig::from_manifest(&plugin.manifest, entry);
    let name = worker_config.plugin_name.clone();
    let guard = registry.get_or_create(&name, &worker_config.permissions);

    let pool = PluginWorkerPool::new(backend, config.workers.clone());
    let worker = pool
        .spawn(worker_config)
        .await
        .with_context(|| format!("failed to start plugin '{name}'"))?;
    let bridge = serve_permission_requests(&worker, guard);
    info!("plugin '{name}' is running");

    let outcome = async {
        if let Some(method) = &args.call {
            let call_args: Value =
                serde_json::from_str(&args.args).context("--args must be valid JSON")?;
            let result = worker.call(method, call_args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        println!("Plugin '{name}' running. Press Ctrl-C to stop.");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        anyhow::Ok(())
    }
    .await;

    pool.stop_all().await;
    bridge.abort();
    registry.remove(&name);
    if let Some(prompts) = prompts {
        prompts.abort();
    }
    outcome
}

/// Resolve a plugin by manifest path, plugin directory, or name.
fn resolve_plugin(target: &str, plugins_dir: &Path) -> Result<DiscoveredPlugin> {
    let path = Path::new(target);
    if path.is_file() {
        return load_manifest_file(path);
    }
    if path.is_dir() {
        let manifest_path = MANIFEST_FILES
            .iter()
            .map(|file| path.join(file))
            .find(|candidate| candidate.is_file())
            .with_context(|| format!("no plugin manifest in {}", path.display()))?;
        return load_manifest_file(&manifest_path);
    }

    PluginLoader::new(plugins_dir)
        .find(target)?
        .with_context(|| format!("no plugin named '{target}' in {}", plugins_dir.display()))
}

fn load_manifest_file(path: &Path) -> Result<DiscoveredPlugin> {
    let manifest = PluginManifest::from_file(path)
        .with_context(|| format!("invalid manifest {}", path.display()))?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    verify_integrity(&manifest, &root, None)?;
    Ok(DiscoveredPlugin {
        manifest,
        root,
        manifest_path: path.to_path_buf(),
    })
}
