mod approval;
mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;
use warden_config::ConfigLoader;
use warden_plugins::PluginLoader;
use warden_security::manifest::read_raw_manifest;
use warden_security::{CapabilityCategory, PluginManifest, validate_manifest, verify_integrity};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Warden - run untrusted plugins in isolated workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Configuration directory
    #[arg(long, global = true, env = "WARDEN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a plugin manifest against the capability catalog
    Validate {
        /// Path to plugin.json or plugin.toml
        manifest: PathBuf,
    },

    /// List every capability a plugin can request
    Capabilities,

    /// List plugins in the plugins directory
    List,

    /// Run a plugin in an isolated worker until Ctrl-C
    Run(run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = config_loader.load()?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)))
        .init();

    match cli.command {
        Commands::Validate { manifest } => validate(&manifest)?,
        Commands::Capabilities => print_capabilities(),
        Commands::List => {
            config_loader.ensure_dirs(&config)?;
            let loader = PluginLoader::new(config_loader.plugins_dir(&config));
            let plugins = loader.discover()?;
            println!("Plugins in {}:", loader.plugins_dir().display());
            if plugins.is_empty() {
                println!("  (none)");
            }
            for plugin in plugins {
                let entry = plugin
                    .entry_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "no entry".to_string());
                println!(
                    "  {} v{} - {} [{}]",
                    plugin.manifest.name,
                    plugin.manifest.version,
                    plugin.manifest.description.unwrap_or_default(),
                    entry
                );
            }
        }
        Commands::Run(args) => {
            config_loader.ensure_dirs(&config)?;
            run::run(args, &config, &config_loader).await?;
        }
    }

    Ok(())
}

fn validate(path: &std::path::Path) -> Result<()> {
    let raw = read_raw_manifest(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let result = validate_manifest(&raw);
    if !result.valid {
        println!("{} {}", "invalid".red().bold(), path.display());
        for error in &result.errors {
            println!("  - {error}");
        }
        anyhow::bail!("manifest has {} error(s)", result.errors.len());
    }

    let manifest = PluginManifest::from_value(raw)?;
    if manifest.integrity.is_some() {
        let root = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        verify_integrity(&manifest, root, None)?;
    }

    println!(
        "{} {} v{}",
        "valid".green().bold(),
        manifest.name,
        manifest.version
    );
    for capability in manifest.declared_capabilities() {
        let kind = if manifest.permissions.required.contains(&capability) {
            "required"
        } else {
            "optional"
        };
        let danger = if capability.is_dangerous() {
            " (dangerous)".red().to_string()
        } else {
            String::new()
        };
        println!("  {capability} [{kind}]{danger}");
    }
    Ok(())
}

fn print_capabilities() {
    for category in CapabilityCategory::ALL {
        println!("{}", category.as_str().bold());
        for capability in category.capabilities() {
            let marker = if capability.is_dangerous() {
                "!".red().bold().to_string()
            } else {
                " ".to_string()
            };
            println!(
                "  {marker} {:<26} {}",
                capability.as_str(),
                capability.description()
            );
        }
    }
    println!();
    println!("{} requires explicit approval at runtime", "!".red().bold());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_call() {
        let cli = Cli::try_parse_from([
            "warden",
            "--log-level",
            "debug",
            "run",
            "notes",
            "--entry",
            "/tmp/notes.sh",
            "--call",
            "ping",
            "--args",
            "[1]",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.plugin, "notes");
                assert_eq!(args.entry, Some(PathBuf::from("/tmp/notes.sh")));
                assert_eq!(args.call.as_deref(), Some("ping"));
                assert_eq!(args.args, "[1]");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn args_default_to_null() {
        let cli = Cli::try_parse_from(["warden", "run", "notes"]).unwrap();
        match cli.command {
            Commands::Run(args) => assert_eq!(args.args, "null"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn validate_reports_unknown_capability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        std::fs::write(
            &path,
            r#"{"name":"x","version":"1","permissions":{"required":["fs:teleport"],"optional":[]}}"#,
        )
        .unwrap();
        let err = validate(&path).unwrap_err();
        assert!(err.to_string().contains("1 error"));
    }

    #[test]
    fn validate_accepts_good_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.toml");
        std::fs::write(
            &path,
            "name = \"notes\"\nversion = \"1.0.0\"\n\n[permissions]\nrequired = [\"data:memory\"]\noptional = [\"data:secrets\"]\n",
        )
        .unwrap();
        validate(&path).unwrap();
    }
}
