//! # Conversation store
//!
//! Repository for [`Conversation`] rows.
//!
//! Conversations are created on the first user turn of a session and are never
//! physically removed: [`ConversationStore::soft_delete`] flips `is_deleted`,
//! default reads skip such rows, and the messages underneath stay queryable by
//! id for audit and billing.
//!
//! ## Typical flow
//! 1. `create(app_id, invoke_from, created_by)` when a session starts.
//! 2. After each exchange, `is_new(id)` tells the caller whether a title still
//!    needs to be generated; `update(id, ConversationChanges::rename(..))` stores it.
//! 3. `usage(id, visibility)` reports the billing aggregate for the whole session.

use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Conversation, ConversationChanges, MAX_ID_LEN, limit_len, require_id};
use crate::schema::{conversation, message};
use crate::types::{InvokeFrom, Price, Visibility};

const ENTITY: &str = "conversation";

/// Billing aggregate over the active messages of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationUsage {
    pub conversation_id: String,
    pub message_count: i64,
    pub total_token_count: i64,
    pub total_price: Price,
    /// Sum of message latencies, in seconds.
    pub total_latency: f64,
}

/// Conversation repository bound to one connection.
///
/// Every write runs in its own immediate (write-locking) transaction.
pub struct ConversationStore<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ConversationStore<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Start a new conversation with an empty name and summary, not pinned.
    ///
    /// # Errors
    /// `Validation` when `app_id` is missing or `created_by` is too long.
    pub fn create(
        &mut self,
        app_id: &str,
        invoke_from: InvokeFrom,
        created_by: &str,
    ) -> LedgerResult<Conversation> {
        require_id("app_id", app_id)?;
        limit_len("created_by", created_by, MAX_ID_LEN)?;

        let now = Utc::now().naive_utc();
        let row = Conversation {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            name: String::new(),
            summary: String::new(),
            is_pinned: false,
            is_deleted: false,
            invoke_from,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };

        let created: Conversation = self.conn.immediate_transaction(|conn| {
            diesel::insert_into(conversation::table)
                .values(&row)
                .returning(Conversation::as_returning())
                .get_result(conn)
        })?;

        info!(
            conversation_id = %created.id,
            app_id = %created.app_id,
            invoke_from = %created.invoke_from,
            "Created conversation"
        );
        Ok(created)
    }

    /// Fetch one conversation.
    ///
    /// # Errors
    /// `NotFound` when the id does not exist, or is archived and `visibility`
    /// is [`Visibility::Active`].
    pub fn get(&mut self, id: &str, visibility: Visibility) -> LedgerResult<Conversation> {
        find(self.conn, id, visibility)
    }

    /// Conversations of one app: pinned first, then most recently updated.
    pub fn list(
        &mut self,
        app_id: &str,
        visibility: Visibility,
    ) -> LedgerResult<Vec<Conversation>> {
        let mut query = conversation::table
            .filter(conversation::app_id.eq(app_id))
            .select(Conversation::as_select())
            .into_boxed();
        if !visibility.includes_archived() {
            query = query.filter(conversation::is_deleted.eq(false));
        }

        let conversations = query
            .order((
                conversation::is_pinned.desc(),
                conversation::updated_at.desc(),
                conversation::created_at.desc(),
            ))
            .load(self.conn)?;

        debug!(app_id, count = conversations.len(), "Listed conversations");
        Ok(conversations)
    }

    /// Change name, summary or pinned flag. Nothing else is writable.
    ///
    /// # Errors
    /// `Validation` for an empty change set or an over-long name, `NotFound`
    /// for a missing or archived conversation.
    pub fn update(
        &mut self,
        id: &str,
        changes: &ConversationChanges,
    ) -> LedgerResult<Conversation> {
        changes.validate()?;

        let updated = self.conn.immediate_transaction(|conn| {
            find(conn, id, Visibility::Active)?;
            let updated: Conversation = diesel::update(conversation::table.find(id))
                .set((changes, conversation::updated_at.eq(Utc::now().naive_utc())))
                .returning(Conversation::as_returning())
                .get_result(conn)?;
            Ok::<_, LedgerError>(updated)
        })?;

        info!(conversation_id = id, ?changes, "Updated conversation");
        Ok(updated)
    }

    /// Archive a conversation. Its messages and agent steps are left in place.
    pub fn soft_delete(&mut self, id: &str) -> LedgerResult<()> {
        self.conn.immediate_transaction(|conn| {
            find(conn, id, Visibility::Active)?;
            diesel::update(conversation::table.find(id))
                .set((
                    conversation::is_deleted.eq(true),
                    conversation::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            Ok::<_, LedgerError>(())
        })?;

        info!(conversation_id = id, "Archived conversation");
        Ok(())
    }

    /// `true` until the conversation holds more than one active message.
    ///
    /// Callers use this to decide whether a title still has to be generated.
    /// The threshold is inclusive: zero or one message still counts as new.
    pub fn is_new(&mut self, id: &str) -> LedgerResult<bool> {
        find(self.conn, id, Visibility::Active)?;
        let message_count = active_message_count(self.conn, id)?;
        Ok(message_count <= 1)
    }

    /// Token, price and latency totals over the conversation's active messages.
    ///
    /// `visibility` applies to the conversation itself; archived messages
    /// never count.
    pub fn usage(
        &mut self,
        id: &str,
        visibility: Visibility,
    ) -> LedgerResult<ConversationUsage> {
        find(self.conn, id, visibility)?;

        let rows: Vec<(i32, Price, f64)> = message::table
            .filter(message::conversation_id.eq(id))
            .filter(message::is_deleted.eq(false))
            .select((
                message::total_token_count,
                message::total_price,
                message::latency,
            ))
            .load(self.conn)?;

        let mut usage = ConversationUsage {
            conversation_id: id.to_string(),
            message_count: rows.len() as i64,
            total_token_count: 0,
            total_price: Price::ZERO,
            total_latency: 0.0,
        };
        for (tokens, price, latency) in rows {
            usage.total_token_count += i64::from(tokens);
            usage.total_price = usage
                .total_price
                .checked_add(price)
                .ok_or_else(|| LedgerError::validation("conversation price total overflows"))?;
            usage.total_latency += latency;
        }

        Ok(usage)
    }
}

pub(crate) fn find(
    conn: &mut SqliteConnection,
    id: &str,
    visibility: Visibility,
) -> LedgerResult<Conversation> {
    let found = conversation::table
        .find(id)
        .select(Conversation::as_select())
        .first(conn)
        .optional()?;

    match found {
        Some(row) if !row.is_deleted || visibility.includes_archived() => Ok(row),
        _ => Err(LedgerError::not_found(ENTITY, id)),
    }
}

fn active_message_count(conn: &mut SqliteConnection, conversation_id: &str) -> LedgerResult<i64> {
    let count = message::table
        .filter(message::conversation_id.eq(conversation_id))
        .filter(message::is_deleted.eq(false))
        .count()
        .get_result(conn)?;
    Ok(count)
}
