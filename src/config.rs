//! This module provides functionality for loading the ledger's configuration
//! and for opening database connections with it.
//!
//! It defines the `LedgerConfig` struct, a `load_config` function to read it
//! from a YAML file, and `establish_connection`, which opens a SQLite
//! connection, applies the connection pragmas and makes sure the schema exists.
//!
//! # Examples
//!
//! Loading the configuration from a file and connecting:
//!
//! ```no_run
//! use convo_ledger::config::{establish_connection, load_config};
//!
//! let config = load_config("/path/to/config.yaml").unwrap();
//! let mut conn = establish_connection(&config).unwrap();
//! ```

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::Path};
use tracing::*;

use crate::error::LedgerResult;

const CREATE_TABLES: &str =
    include_str!("../migrations/2025-07-22-000000_create_conversation_tables/up.sql");

/// Represents the ledger's configuration.
///
/// The file only needs `database_url`; everything else has a default.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct LedgerConfig {
    /// SQLite database path, or `:memory:`.
    pub database_url: String,

    /// How long a connection waits for another writer's lock, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

fn default_busy_timeout_ms() -> u32 {
    5_000
}

impl LedgerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    /// A private in-memory database. Every connection gets its own.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    fn is_in_memory(&self) -> bool {
        self.database_url == ":memory:" || self.database_url.starts_with("file::memory:")
    }
}

/// Loads the ledger's configuration from a YAML file.
///
/// # Parameters
///
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
///
/// - `Ok(LedgerConfig)`: The loaded configuration.
/// - `Err(Box<dyn Error>)`: An error occurred while reading the file or parsing the YAML.
pub fn load_config(file: impl AsRef<Path>) -> Result<LedgerConfig, Box<dyn Error>> {
    let file = file.as_ref();
    debug!("Loading config: {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: LedgerConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Writes `config` as YAML to `file`, creating parent directories.
pub fn save_config(config: &LedgerConfig, file: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(file, serde_yaml::to_string(config)?)?;
    info!("Wrote config file: {}", file.display());
    Ok(())
}

/// Write a fresh config pointing at `database_url` and create that database.
///
/// An existing config file is left alone unless `force` is set, so a stray
/// `init` cannot repoint an operator's ledger.
pub fn init_config(
    file: impl AsRef<Path>,
    database_url: impl Into<String>,
    force: bool,
) -> Result<LedgerConfig, Box<dyn Error>> {
    let file = file.as_ref();
    if file.exists() && !force {
        warn!("Refusing to overwrite config file: {}", file.display());
        return Err(format!(
            "{} already exists; pass --force to replace it",
            file.display()
        )
        .into());
    }

    let config = LedgerConfig::new(database_url);
    if !config.is_in_memory() {
        if let Some(parent) = Path::new(&config.database_url).parent() {
            fs::create_dir_all(parent)?;
        }
    }
    save_config(&config, file)?;
    establish_connection(&config)?;

    Ok(config)
}

/// Open a SQLite connection for `config`, ready for ledger operations.
///
/// Turns on foreign keys, sets the busy timeout, switches file databases to
/// WAL journaling and creates any missing tables and indexes.
pub fn establish_connection(config: &LedgerConfig) -> LedgerResult<SqliteConnection> {
    let mut conn = SqliteConnection::establish(&config.database_url)?;

    conn.batch_execute(&format!(
        "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
        config.busy_timeout_ms
    ))?;
    if !config.is_in_memory() {
        conn.batch_execute("PRAGMA journal_mode = WAL;")?;
    }

    run_migrations(&mut conn)?;
    debug!("Connected to {}", config.database_url);

    Ok(conn)
}

/// Create the ledger tables and indexes if they do not exist yet.
pub fn run_migrations(conn: &mut SqliteConnection) -> LedgerResult<()> {
    conn.batch_execute(CREATE_TABLES)?;
    Ok(())
}
