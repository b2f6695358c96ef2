//! Owner of one database connection and entry point to the three stores.
//!
//! A [`Ledger`] is cheap to open and is meant to live for the duration of a
//! request or a CLI invocation. Stores borrow its connection mutably, so only
//! one store is in use at a time:
//!
//! ```no_run
//! use convo_ledger::config::LedgerConfig;
//! use convo_ledger::ledger::Ledger;
//! use convo_ledger::message_store::NewMessage;
//! use convo_ledger::types::InvokeFrom;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ledger = Ledger::open(&LedgerConfig::new("ledger.db"))?;
//! let convo = ledger.conversations().create("A1", InvokeFrom::WebApp, "acct-1")?;
//! let msg = ledger.messages().create(NewMessage::new(&convo.id, "acct-1", "hello"))?;
//! assert!(ledger.conversations().is_new(&convo.id)?);
//! # let _ = msg;
//! # Ok(()) }
//! ```

use diesel::SqliteConnection;
use tracing::debug;

use crate::agent_thought_log::AgentThoughtLog;
use crate::config::{LedgerConfig, establish_connection};
use crate::conversation_store::ConversationStore;
use crate::error::LedgerResult;
use crate::message_store::MessageStore;

pub struct Ledger {
    connection: SqliteConnection,
}

impl Ledger {
    /// Connect using `config`, creating the schema when needed.
    pub fn open(config: &LedgerConfig) -> LedgerResult<Self> {
        let connection = establish_connection(config)?;
        debug!(database_url = %config.database_url, "Opened ledger");
        Ok(Self { connection })
    }

    /// A throwaway ledger backed by a private in-memory database.
    pub fn in_memory() -> LedgerResult<Self> {
        Self::open(&LedgerConfig::in_memory())
    }

    pub fn conversations(&mut self) -> ConversationStore<'_> {
        ConversationStore::new(&mut self.connection)
    }

    pub fn messages(&mut self) -> MessageStore<'_> {
        MessageStore::new(&mut self.connection)
    }

    pub fn agent_thoughts(&mut self) -> AgentThoughtLog<'_> {
        AgentThoughtLog::new(&mut self.connection)
    }

    /// Direct access to the connection for queries the stores do not cover.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_thought_log::NewAgentThought;
    use crate::message_store::{NewMessage, Outcome, Settlement};
    use crate::types::{InvokeFrom, MessageStatus, ThoughtEvent, TokenUsage, Visibility};

    #[test]
    fn test_full_exchange_lifecycle() {
        let mut ledger = Ledger::in_memory().unwrap();

        let convo = ledger
            .conversations()
            .create("A1", InvokeFrom::Debugger, "acct-1")
            .unwrap();
        let msg = ledger
            .messages()
            .create(NewMessage::new(&convo.id, "acct-1", "summarise this page"))
            .unwrap();
        assert_eq!(msg.invoke_from, InvokeFrom::Debugger);

        ledger
            .agent_thoughts()
            .append_next(
                NewAgentThought::new(&msg.id, ThoughtEvent::DatasetRetrieval)
                    .with_observation("3 chunks"),
            )
            .unwrap();
        ledger
            .messages()
            .append_answer_chunk(&msg.id, "The page ")
            .unwrap();
        let done = ledger
            .messages()
            .finalize(
                &msg.id,
                Settlement {
                    answer: "The page explains diesel.".into(),
                    message_usage: Some(TokenUsage::new(
                        40,
                        "0.0000010".parse().unwrap(),
                        "0.0010".parse().unwrap(),
                    )),
                    answer_usage: TokenUsage::new(
                        8,
                        "0.0000020".parse().unwrap(),
                        "0.0010".parse().unwrap(),
                    ),
                    latency: 1.25,
                    outcome: Outcome::Succeeded,
                },
            )
            .unwrap();
        assert_eq!(done.status, MessageStatus::Succeeded);
        assert_eq!(done.total_token_count, 48);

        let usage = ledger.conversations().usage(&convo.id, Visibility::Active).unwrap();
        assert_eq!(usage.message_count, 1);
        assert_eq!(usage.total_price, done.total_price);

        let trace = ledger.agent_thoughts().trace(&msg.id, Visibility::Active).unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.message, done);

        ledger.conversations().soft_delete(&convo.id).unwrap();
        assert!(ledger
            .conversations()
            .list("A1", Visibility::Active)
            .unwrap()
            .is_empty());
        assert_eq!(
            ledger
                .messages()
                .list(&convo.id, Visibility::Active)
                .unwrap()
                .len(),
            1
        );
    }
}
