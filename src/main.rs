//! Main module for the `ledger` CLI.
//!
//! Parses the command line, installs the tracing subscriber, resolves the
//! configuration and dispatches the subcommand.
//!
//! # Examples
//!
//! Creating the default configuration and database:
//!
//! ```sh
//! ledger init
//! ```
//!
//! Inspecting an agent trace as JSON against a specific database:
//!
//! ```sh
//! LEDGER_DATABASE_URL=/tmp/ledger.db ledger trace 5f0c… --json
//! ```

use clap::Parser;
use once_cell::sync::OnceCell;
use std::{error::Error, path::Path};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use convo_ledger::commands::{Cli, Commands, execute};
use convo_ledger::config::{self, LedgerConfig};
use convo_ledger::config_dir;
use convo_ledger::ledger::Ledger;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });

    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_dir()?.join("config.yaml"),
    };

    if let Commands::Init { force } = cli.command {
        return init(&config_path, cli.database_url, force);
    }

    let config = resolve_config(&config_path, cli.database_url)?;
    debug!("Config loaded: {:?}", config);

    let mut ledger = Ledger::open(&config)?;
    execute(&cli.command, &mut ledger, cli.json, &mut std::io::stdout())?;

    Ok(())
}

/// Use the config file when present; a database url from the command line
/// or environment wins over the file's.
fn resolve_config(
    config_path: &Path,
    database_url: Option<String>,
) -> Result<LedgerConfig, Box<dyn Error>> {
    match (config_path.exists(), database_url) {
        (true, Some(url)) => Ok(LedgerConfig {
            database_url: url,
            ..config::load_config(config_path)?
        }),
        (true, None) => config::load_config(config_path),
        (false, Some(url)) => Ok(LedgerConfig::new(url)),
        (false, None) => Err(format!(
            "no config at {}; run `ledger init` or pass --database-url",
            config_path.display()
        )
        .into()),
    }
}

/// Writes a default config next to a `ledger.db` in the config directory and
/// creates the database schema.
fn init(
    config_path: &Path,
    database_url: Option<String>,
    force: bool,
) -> Result<(), Box<dyn Error>> {
    let database_url = match database_url {
        Some(url) => url,
        None => config_dir()?.join("ledger.db").display().to_string(),
    };
    let config = config::init_config(config_path, database_url, force)?;

    info!("Initialized ledger at {}", config.database_url);
    println!("config:   {}", config_path.display());
    println!("database: {}", config.database_url);
    Ok(())
}
