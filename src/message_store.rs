//! # Message store
//!
//! Repository for [`Message`] rows and the owner of the message lifecycle:
//!
//! ```text
//! pending ──► running ──► succeeded
//!    │           │
//!    └───────────┴──────► failed
//! ```
//!
//! - `create` inserts a `pending` message with zero counters.
//! - `record_prompt` and `append_answer_chunk` fill the record in while the
//!   answer is produced; the first streamed chunk (or the first agent step,
//!   see [`crate::agent_thought_log`]) moves it to `running`.
//! - `finalize` is the only way into `succeeded`/`failed` and may happen once.
//!
//! Every mutation goes through [`Message::settle_totals`] before it is
//! written, inside the same write transaction as the counters it reads.

use chrono::Utc;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation_store;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{MAX_ID_LEN, Message, check_latency, check_usage, limit_len, require_id};
use crate::schema::message;
use crate::types::{
    ImageUrls, InvokeFrom, MessageStatus, Payload, Price, PriceUnit, TokenUsage, UnitPrice,
    Visibility,
};

const ENTITY: &str = "message";

/// Input for [`MessageStore::create`].
///
/// `app_id` is taken from the owning conversation and `invoke_from` defaults
/// to the conversation's provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub invoke_from: Option<InvokeFrom>,
    pub created_by: String,
    pub query: String,
    pub image_urls: Vec<String>,
}

impl NewMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        created_by: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            invoke_from: None,
            created_by: created_by.into(),
            query: query.into(),
            image_urls: Vec::new(),
        }
    }

    pub fn with_invoke_from(mut self, invoke_from: InvokeFrom) -> Self {
        self.invoke_from = Some(invoke_from);
        self
    }

    pub fn with_image_urls(mut self, image_urls: Vec<String>) -> Self {
        self.image_urls = image_urls;
        self
    }

    fn validate(&self) -> LedgerResult<()> {
        require_id("conversation_id", &self.conversation_id)?;
        limit_len("created_by", &self.created_by, MAX_ID_LEN)?;
        if self.query.trim().is_empty() && self.image_urls.is_empty() {
            return Err(LedgerError::validation(
                "a message needs a query or at least one image url",
            ));
        }
        Ok(())
    }
}

/// How a message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
}

impl Outcome {
    fn status(&self) -> MessageStatus {
        match self {
            Outcome::Succeeded => MessageStatus::Succeeded,
            Outcome::Failed { .. } => MessageStatus::Failed,
        }
    }
}

/// Everything [`MessageStore::finalize`] writes in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// Complete answer text; replaces anything streamed so far.
    pub answer: String,
    /// Prompt-side accounting. `None` keeps what `record_prompt` stored.
    pub message_usage: Option<TokenUsage>,
    pub answer_usage: TokenUsage,
    /// Seconds.
    pub latency: f64,
    pub outcome: Outcome,
}

impl Settlement {
    fn validate(&self) -> LedgerResult<()> {
        if let Some(usage) = &self.message_usage {
            check_usage("message", usage)?;
        }
        check_usage("answer", &self.answer_usage)?;
        check_latency(self.latency)?;
        if let Outcome::Failed { error } = &self.outcome {
            if error.trim().is_empty() {
                return Err(LedgerError::validation("a failed message needs error text"));
            }
        }
        Ok(())
    }
}

/// Message repository bound to one connection.
pub struct MessageStore<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> MessageStore<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Record a new user turn under an active conversation.
    ///
    /// # Errors
    /// - `Validation` for a missing conversation id, an empty query without
    ///   images, or an over-long `created_by`.
    /// - `NotFound` when the conversation is missing or archived.
    pub fn create(&mut self, new: NewMessage) -> LedgerResult<Message> {
        new.validate()?;

        let created = self.conn.immediate_transaction(|conn| {
            let parent = conversation_store::find(conn, &new.conversation_id, Visibility::Active)?;
            let now = Utc::now().naive_utc();
            let row = Message {
                id: Uuid::new_v4().to_string(),
                app_id: parent.app_id,
                conversation_id: parent.id,
                invoke_from: new.invoke_from.unwrap_or(parent.invoke_from),
                created_by: new.created_by,
                query: new.query,
                image_urls: ImageUrls(new.image_urls),
                prompt: Payload::default(),
                message_token_count: 0,
                message_unit_price: UnitPrice::ZERO,
                message_price_unit: PriceUnit::ZERO,
                answer: String::new(),
                answer_token_count: 0,
                answer_unit_price: UnitPrice::ZERO,
                answer_price_unit: PriceUnit::ZERO,
                latency: 0.0,
                is_deleted: false,
                status: MessageStatus::Pending,
                error: String::new(),
                total_token_count: 0,
                total_price: Price::ZERO,
                updated_at: now,
                created_at: now,
            };

            let created: Message = diesel::insert_into(message::table)
                .values(&row)
                .returning(Message::as_returning())
                .get_result(conn)?;
            Ok::<_, LedgerError>(created)
        })?;

        info!(
            message_id = %created.id,
            conversation_id = %created.conversation_id,
            "Created message"
        );
        Ok(created)
    }

    /// Fetch one message by id.
    pub fn get(&mut self, id: &str, visibility: Visibility) -> LedgerResult<Message> {
        find(self.conn, id, visibility)
    }

    /// Messages of a conversation in creation order.
    ///
    /// Works for archived conversations too; hiding those is the caller's call.
    pub fn list(
        &mut self,
        conversation_id: &str,
        visibility: Visibility,
    ) -> LedgerResult<Vec<Message>> {
        conversation_store::find(self.conn, conversation_id, Visibility::IncludeArchived)?;

        let mut query = message::table
            .filter(message::conversation_id.eq(conversation_id))
            .select(Message::as_select())
            .into_boxed();
        if !visibility.includes_archived() {
            query = query.filter(message::is_deleted.eq(false));
        }

        let messages = query
            .order(message::created_at.asc())
            .then_order_by(sql::<BigInt>("message.rowid"))
            .load(self.conn)?;

        debug!(conversation_id, count = messages.len(), "Listed messages");
        Ok(messages)
    }

    /// Store the prompt sent to the model and its accounting.
    ///
    /// # Errors
    /// `Validation` on a finalized message or negative counters.
    pub fn record_prompt(
        &mut self,
        id: &str,
        prompt: Payload,
        usage: TokenUsage,
    ) -> LedgerResult<Message> {
        check_usage("message", &usage)?;

        self.mutate(id, |row| {
            ensure_open(row)?;
            row.prompt = prompt;
            row.set_message_usage(usage);
            Ok(())
        })
    }

    /// Append streamed answer text, moving a pending message to `running`.
    pub fn append_answer_chunk(&mut self, id: &str, chunk: &str) -> LedgerResult<Message> {
        self.mutate(id, |row| {
            ensure_open(row)?;
            row.answer.push_str(chunk);
            if row.status == MessageStatus::Pending {
                row.status = MessageStatus::Running;
            }
            Ok(())
        })
    }

    /// Settle a message into `succeeded` or `failed`.
    ///
    /// Must be called at most once per message.
    ///
    /// # Errors
    /// - `DoubleFinalize` when the message is already terminal; the stored
    ///   values from the first call are left as they were.
    /// - `Validation` for negative counters, an invalid latency or a failure
    ///   without error text.
    pub fn finalize(&mut self, id: &str, settlement: Settlement) -> LedgerResult<Message> {
        let finalized = self.mutate(id, |row| {
            if row.status.is_terminal() {
                warn!(message_id = %row.id, status = %row.status, "Message finalized twice");
                return Err(LedgerError::DoubleFinalize {
                    message_id: row.id.clone(),
                    status: row.status,
                });
            }
            settlement.validate()?;

            row.status = settlement.outcome.status();
            row.error = match settlement.outcome {
                Outcome::Succeeded => String::new(),
                Outcome::Failed { error } => error,
            };
            row.answer = settlement.answer;
            if let Some(usage) = settlement.message_usage {
                row.set_message_usage(usage);
            }
            row.set_answer_usage(settlement.answer_usage);
            row.latency = settlement.latency;
            Ok(())
        })?;

        info!(
            message_id = %finalized.id,
            status = %finalized.status,
            total_token_count = finalized.total_token_count,
            total_price = %finalized.total_price,
            "Finalized message"
        );
        Ok(finalized)
    }

    /// Archive one message. Its agent steps stay in place.
    pub fn soft_delete(&mut self, id: &str) -> LedgerResult<()> {
        self.mutate(id, |row| {
            row.is_deleted = true;
            Ok(())
        })?;
        info!(message_id = id, "Archived message");
        Ok(())
    }

    /// Load an active message, apply `change`, re-settle totals and write it
    /// back, all inside one write transaction.
    fn mutate<F>(&mut self, id: &str, change: F) -> LedgerResult<Message>
    where
        F: FnOnce(&mut Message) -> LedgerResult<()>,
    {
        self.conn.immediate_transaction(|conn| {
            let mut row = find(conn, id, Visibility::Active)?;
            change(&mut row)?;
            row.settle_totals()?;
            row.updated_at = Utc::now().naive_utc();

            diesel::update(&row).set(&row).execute(conn)?;
            Ok(row)
        })
    }
}

pub(crate) fn find(
    conn: &mut SqliteConnection,
    id: &str,
    visibility: Visibility,
) -> LedgerResult<Message> {
    let found = message::table
        .find(id)
        .select(Message::as_select())
        .first(conn)
        .optional()?;

    match found {
        Some(row) if !row.is_deleted || visibility.includes_archived() => Ok(row),
        _ => Err(LedgerError::not_found(ENTITY, id)),
    }
}

fn ensure_open(row: &Message) -> LedgerResult<()> {
    if row.status.is_terminal() {
        return Err(LedgerError::validation(format!(
            "message `{}` is already {}",
            row.id, row.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, establish_connection};
    use crate::conversation_store::ConversationStore;

    fn connection() -> SqliteConnection {
        establish_connection(&LedgerConfig::in_memory()).expect("in-memory database")
    }

    fn conversation(conn: &mut SqliteConnection) -> String {
        ConversationStore::new(conn)
            .create("A1", InvokeFrom::WebApp, "acct-1")
            .unwrap()
            .id
    }

    fn usage(tokens: i32, unit_price: &str) -> TokenUsage {
        TokenUsage::new(
            tokens,
            unit_price.parse().unwrap(),
            "0.0010".parse().unwrap(),
        )
    }

    fn settlement() -> Settlement {
        Settlement {
            answer: "hello there".into(),
            message_usage: Some(usage(5, "0.0000020")),
            answer_usage: usage(10, "0.0000030"),
            latency: 1.25,
            outcome: Outcome::Succeeded,
        }
    }

    #[test]
    fn test_create_starts_pending_with_zero_counters() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);

        let msg = MessageStore::new(&mut conn)
            .create(
                NewMessage::new(&convo_id, "acct-1", "hi")
                    .with_image_urls(vec!["https://img.example/cat.png".into()]),
            )
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.app_id, "A1");
        assert_eq!(msg.invoke_from, InvokeFrom::WebApp);
        assert_eq!(msg.query, "hi");
        assert_eq!(msg.image_urls.0, vec!["https://img.example/cat.png".to_string()]);
        assert_eq!(msg.total_token_count, 0);
        assert_eq!(msg.total_price, Price::ZERO);
        assert_eq!(msg.error, "");
    }

    #[test]
    fn test_create_under_missing_or_archived_conversation() {
        let mut conn = connection();
        let err = MessageStore::new(&mut conn)
            .create(NewMessage::new("nope", "acct-1", "hi"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "conversation", .. }));

        let convo_id = conversation(&mut conn);
        ConversationStore::new(&mut conn)
            .soft_delete(&convo_id)
            .unwrap();
        let err = MessageStore::new(&mut conn)
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[test]
    fn test_create_requires_query_or_images() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let err = MessageStore::new(&mut conn)
            .create(NewMessage::new(&convo_id, "acct-1", "   "))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = MessageStore::new(&mut conn)
            .create(NewMessage::new(&convo_id, "a".repeat(37), "hi"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_finalize_settles_totals_exactly() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let msg = store
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap();

        let done = store.finalize(&msg.id, settlement()).unwrap();

        assert_eq!(done.status, MessageStatus::Succeeded);
        assert_eq!(done.total_token_count, 15);
        let expected = usage(5, "0.0000020")
            .price()
            .unwrap()
            .checked_add(usage(10, "0.0000030").price().unwrap())
            .unwrap();
        assert_eq!(done.total_price, expected);
        assert_eq!(done.total_price, "0.000000005".parse::<Price>().unwrap());

        // What was written is what comes back.
        let stored = store.get(&msg.id, Visibility::Active).unwrap();
        assert_eq!(stored, done);
    }

    #[test]
    fn test_equal_inputs_give_identical_totals() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);

        let totals: Vec<Price> = (0..5)
            .map(|_| {
                let msg = store
                    .create(NewMessage::new(&convo_id, "acct-1", "hi"))
                    .unwrap();
                store.finalize(&msg.id, settlement()).unwrap().total_price
            })
            .collect();

        assert!(totals.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_double_finalize_keeps_first_values() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let msg = store
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap();
        let first = store.finalize(&msg.id, settlement()).unwrap();

        let second = Settlement {
            answer: "something else".into(),
            message_usage: Some(usage(500, "0.0000100")),
            answer_usage: usage(900, "0.0000100"),
            latency: 9.0,
            outcome: Outcome::Failed {
                error: "late failure".into(),
            },
        };
        let err = store.finalize(&msg.id, second).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::DoubleFinalize { status: MessageStatus::Succeeded, .. }
        ));
        assert_eq!(store.get(&msg.id, Visibility::Active).unwrap(), first);
    }

    #[test]
    fn test_double_finalize_wins_over_malformed_settlement() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let msg = store
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap();
        let first = store.finalize(&msg.id, settlement()).unwrap();

        let malformed = Settlement {
            latency: f64::NAN,
            outcome: Outcome::Failed {
                error: String::new(),
            },
            ..settlement()
        };
        let err = store.finalize(&msg.id, malformed).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::DoubleFinalize { status: MessageStatus::Succeeded, .. }
        ));
        assert_eq!(store.get(&msg.id, Visibility::Active).unwrap(), first);
    }

    #[test]
    fn test_failed_outcome_records_error() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let msg = store
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap();

        let failed = store
            .finalize(
                &msg.id,
                Settlement {
                    outcome: Outcome::Failed {
                        error: "provider timed out".into(),
                    },
                    ..settlement()
                },
            )
            .unwrap();

        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.error, "provider timed out");

        let err = store
            .finalize(
                &msg.id,
                Settlement {
                    outcome: Outcome::Failed { error: " ".into() },
                    ..settlement()
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_streaming_then_finalize() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let msg = store
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap();

        let prompted = store
            .record_prompt(
                &msg.id,
                Payload(serde_json::json!([{"role": "user", "content": "hi"}])),
                usage(5, "0.0000020"),
            )
            .unwrap();
        assert_eq!(prompted.status, MessageStatus::Pending);
        assert_eq!(prompted.total_token_count, 5);
        assert_eq!(prompted.total_price, Price::from_raw(200));

        store.append_answer_chunk(&msg.id, "hel").unwrap();
        let streamed = store.append_answer_chunk(&msg.id, "lo").unwrap();
        assert_eq!(streamed.status, MessageStatus::Running);
        assert_eq!(streamed.answer, "hello");

        let done = store
            .finalize(
                &msg.id,
                Settlement {
                    answer: "hello".into(),
                    message_usage: None,
                    ..settlement()
                },
            )
            .unwrap();
        assert_eq!(done.message_token_count, 5);
        assert_eq!(done.total_token_count, 15);
        assert_eq!(done.prompt, prompted.prompt);

        let err = store.append_answer_chunk(&msg.id, "!").unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_list_orders_by_creation_and_hides_deleted() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let ids: Vec<String> = ["one", "two", "three"]
            .iter()
            .map(|q| {
                store
                    .create(NewMessage::new(&convo_id, "acct-1", *q))
                    .unwrap()
                    .id
            })
            .collect();

        store.soft_delete(&ids[1]).unwrap();

        let active: Vec<String> = store
            .list(&convo_id, Visibility::Active)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(active, vec![ids[0].clone(), ids[2].clone()]);

        let all: Vec<String> = store
            .list(&convo_id, Visibility::IncludeArchived)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(all, ids);

        assert!(matches!(
            store.get(&ids[1], Visibility::Active),
            Err(LedgerError::NotFound { entity: "message", .. })
        ));
        assert!(store.get(&ids[1], Visibility::IncludeArchived).unwrap().is_deleted);
    }

    #[test]
    fn test_finalize_rejects_bad_inputs() {
        let mut conn = connection();
        let convo_id = conversation(&mut conn);
        let mut store = MessageStore::new(&mut conn);
        let msg = store
            .create(NewMessage::new(&convo_id, "acct-1", "hi"))
            .unwrap();

        let negative = Settlement {
            answer_usage: TokenUsage::new(-3, UnitPrice::ZERO, PriceUnit::ZERO),
            ..settlement()
        };
        assert!(matches!(
            store.finalize(&msg.id, negative),
            Err(LedgerError::Validation(_))
        ));

        let slow = Settlement {
            latency: f64::INFINITY,
            ..settlement()
        };
        assert!(matches!(
            store.finalize(&msg.id, slow),
            Err(LedgerError::Validation(_))
        ));

        assert_eq!(
            store.get(&msg.id, Visibility::Active).unwrap().status,
            MessageStatus::Pending
        );
        assert!(matches!(
            store.finalize("missing", settlement()),
            Err(LedgerError::NotFound { .. })
        ));
    }
}
