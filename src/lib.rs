//! # Convo Ledger (library root)
//!
//! Persistence core for LLM application conversations. It records:
//!
//! - **Conversations** ([`conversation_store`]): sessions inside an app,
//!   soft-deleted rather than removed.
//! - **Messages** ([`message_store`]): one query/answer exchange each, with
//!   token, price and latency accounting and a
//!   `pending → running → succeeded | failed` lifecycle.
//! - **Agent thoughts** ([`agent_thought_log`]): the ordered, gap-free steps
//!   an agent took to produce an answer.
//!
//! All three live in one SQLite database accessed through Diesel
//! ([`schema`], [`models`]). Monetary columns are exact fixed-point values
//! ([`types::UnitPrice`], [`types::PriceUnit`], [`types::Price`]) so sums never
//! pick up rounding drift.
//!
//! [`ledger::Ledger`] opens a connection from a [`config::LedgerConfig`] and
//! hands out the stores. The `ledger` binary ([`commands`], [`pretty`]) is a
//! thin operator view on top.
//!
//! ## Configuration
//! The CLI reads `config.yaml` from the per-platform configuration directory:
//!
//! - macOS: `~/Library/Application Support/com.convo-ledger.ledger/config.yaml`
//! - Linux (XDG): `~/.config/ledger/config.yaml`
//! - Windows: `C:\Users\<you>\AppData\Roaming\convo-ledger\ledger\config\config.yaml`

use directories::ProjectDirs;
use std::error::Error;
use std::path::PathBuf;

pub mod agent_thought_log;
pub mod commands;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod ledger;
pub mod message_store;
pub mod models;
pub mod pretty;
pub mod schema;
pub mod types;

/// Return the per-platform configuration directory used by the ledger CLI.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "convo-ledger", "ledger")`. The directory is **not** created here.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```no_run
/// let cfg = convo_ledger::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "convo-ledger", "ledger")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_ends_with_app_name() {
        if let Ok(dir) = config_dir() {
            let name = dir.to_string_lossy();
            assert!(name.contains("ledger"));
        }
    }
}
