pub mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use pg_domain::config::Config;

/// Polyglot: keeps node servers running and bridges them to the controller.
#[derive(Debug, Parser)]
#[command(name = "polyglot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the supervisor (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `POLYGLOT_CONFIG` (or
/// `polyglot.toml` by default). A missing file yields the defaults.
pub fn load_config() -> anyhow::Result<(Config, PathBuf)> {
    let config_path =
        PathBuf::from(std::env::var("POLYGLOT_CONFIG").unwrap_or_else(|_| "polyglot.toml".into()));

    let config = if config_path.exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };

    Ok((config, config_path))
}
