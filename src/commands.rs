//! This module defines the command-line interface of the `ledger` binary using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! a `Commands` enum with the available subcommands, and [`execute`], which runs
//! every subcommand except `init` against an open [`Ledger`].
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use convo_ledger::commands::{Cli, execute};
//! use convo_ledger::ledger::Ledger;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cli = Cli::parse();
//! let mut ledger = Ledger::in_memory()?;
//! execute(&cli.command, &mut ledger, cli.json, &mut std::io::stdout())?;
//! # Ok(()) }
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

use crate::ledger::Ledger;
use crate::models::ConversationChanges;
use crate::pretty;
use crate::types::Visibility;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Auto)]
pub struct Cli {
    /// SQLite database to use instead of the one in the config file.
    #[arg(long, global = true, env = "LEDGER_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Config file to read instead of `<config dir>/config.yaml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print records as JSON instead of coloured text.
    #[arg(long, global = true)]
    pub json: bool,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Write a default config file and create the database.
    Init {
        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// List the conversations of an application.
    #[clap(alias = "c")]
    Conversations {
        /// Application id.
        app: String,

        /// Include archived conversations.
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// List the messages of a conversation in order.
    #[clap(alias = "m")]
    Messages {
        conversation: String,

        /// Include archived messages.
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Show a message with its agent steps.
    #[clap(alias = "t")]
    Trace {
        message: String,

        /// Also show archived messages.
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Token, price and latency totals of a conversation.
    Usage {
        conversation: String,

        /// Also report on an archived conversation.
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Set the display name of a conversation.
    Rename { conversation: String, name: String },

    Pin { conversation: String },

    Unpin { conversation: String },

    /// Soft-delete a conversation. Its messages are kept.
    Archive { conversation: String },
}

/// Run `command` against `ledger`, writing the result to `out`.
///
/// `Init` touches the filesystem and is handled by the binary itself; here it
/// is a no-op.
pub fn execute<W: Write>(
    command: &Commands,
    ledger: &mut Ledger,
    json: bool,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    debug!(?command, json, "Executing command");

    match command {
        Commands::Init { .. } => {}
        Commands::Conversations { app, all } => {
            let conversations = ledger.conversations().list(app, visibility(*all))?;
            if json {
                write_json(out, &conversations)?;
            } else {
                pretty::print_conversations(out, &conversations)?;
            }
        }
        Commands::Messages { conversation, all } => {
            let messages = ledger.messages().list(conversation, visibility(*all))?;
            if json {
                write_json(out, &messages)?;
            } else {
                pretty::print_messages(out, &messages)?;
            }
        }
        Commands::Trace { message, all } => {
            let trace = ledger.agent_thoughts().trace(message, visibility(*all))?;
            if json {
                write_json(out, &trace)?;
            } else {
                pretty::print_trace(out, &trace)?;
            }
        }
        Commands::Usage { conversation, all } => {
            let usage = ledger
                .conversations()
                .usage(conversation, visibility(*all))?;
            if json {
                write_json(out, &usage)?;
            } else {
                pretty::print_usage(out, &usage)?;
            }
        }
        Commands::Rename { conversation, name } => {
            update(ledger, conversation, ConversationChanges::rename(name), json, out)?;
        }
        Commands::Pin { conversation } => {
            update(ledger, conversation, ConversationChanges::pin(true), json, out)?;
        }
        Commands::Unpin { conversation } => {
            update(ledger, conversation, ConversationChanges::pin(false), json, out)?;
        }
        Commands::Archive { conversation } => {
            ledger.conversations().soft_delete(conversation)?;
            writeln!(out, "archived {conversation}")?;
        }
    }

    Ok(())
}

fn update<W: Write>(
    ledger: &mut Ledger,
    id: &str,
    changes: ConversationChanges,
    json: bool,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let updated = ledger.conversations().update(id, &changes)?;
    if json {
        write_json(out, &updated)
    } else {
        pretty::print_conversations(out, std::slice::from_ref(&updated))
    }
}

fn visibility(all: bool) -> Visibility {
    if all {
        Visibility::IncludeArchived
    } else {
        Visibility::Active
    }
}

fn write_json<W: Write, T: Serialize + ?Sized>(
    out: &mut W,
    value: &T,
) -> Result<(), Box<dyn Error>> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
