//! # Database models
//!
//! Row types for the three ledger tables, mapped with **Diesel**:
//!
//! - [`Conversation`]: a named session of exchanges inside one application.
//! - [`Message`]: one query/answer exchange with token, price and latency accounting.
//! - [`MessageAgentThought`]: one reasoning or tool step an agent recorded while
//!   answering a [`Message`].
//!
//! Ownership is a strict tree (`conversation → message → message_agent_thought`)
//! expressed through `belongs_to` associations. Relationships are never
//! lazy-loaded; the stores issue explicit "children of parent" queries.
//!
//! ## Totals
//!
//! Messages and agent steps both keep a prompt side and an answer side of
//! [`TokenUsage`]. Whenever either side changes, [`Message::settle_totals`]
//! (or [`MessageAgentThought::settle_totals`]) recomputes
//!
//! - `total_token_count = message_token_count + answer_token_count`
//! - `total_price = message_unit_price × message_price_unit
//!                + answer_unit_price × answer_price_unit`
//!
//! so the stored totals can never drift from the counters that produced them.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};
use crate::schema::{conversation, message, message_agent_thought};
use crate::types::{
    ImageUrls, InvokeFrom, MessageStatus, Payload, Price, PriceUnit, ThoughtEvent, TokenUsage,
    UnitPrice,
};

/// Length limit of identifier columns (UUID text form).
pub const MAX_ID_LEN: usize = 36;
/// Length limit of short text columns such as names and tags.
pub const MAX_NAME_LEN: usize = 255;

/// A conversation session.
///
/// ### Table
/// - `conversation`
///
/// ### Notes
/// - `created_by` holds an account id for `web_app`/`debugger` sessions and an
///   end-user id for `service_api` sessions (see [`InvokeFrom::creator_kind`]).
/// - Deleting only sets `is_deleted`; messages stay in place for billing.
#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = conversation)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    pub id: String,
    pub app_id: String,
    /// Display name, empty until a title is generated or set.
    pub name: String,
    pub summary: String,
    pub is_pinned: bool,
    pub is_deleted: bool,
    pub invoke_from: InvokeFrom,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// The only conversation fields callers may change after creation.
///
/// `None` leaves a column untouched.
#[derive(AsChangeset, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = conversation)]
pub struct ConversationChanges {
    pub name: Option<String>,
    pub summary: Option<String>,
    pub is_pinned: Option<bool>,
}

impl ConversationChanges {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn pin(is_pinned: bool) -> Self {
        Self {
            is_pinned: Some(is_pinned),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.summary.is_none() && self.is_pinned.is_none()
    }

    pub(crate) fn validate(&self) -> LedgerResult<()> {
        if self.is_empty() {
            return Err(LedgerError::validation("conversation update has no changes"));
        }
        if let Some(name) = &self.name {
            limit_len("name", name, MAX_NAME_LEN)?;
        }
        Ok(())
    }
}

/// One query/answer exchange.
///
/// The prompt side (`message*` columns) describes what was sent to the model,
/// the answer side (`answer*` columns) what came back. Both are filled in
/// progressively while the answer streams and are settled by `finalize`.
#[derive(
    Queryable,
    Selectable,
    Identifiable,
    Associations,
    Insertable,
    AsChangeset,
    Debug,
    Clone,
    PartialEq,
    Serialize,
)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = message)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    pub id: String,
    pub app_id: String,
    pub conversation_id: String,
    pub invoke_from: InvokeFrom,
    pub created_by: String,
    /// Original user query.
    pub query: String,
    pub image_urls: ImageUrls,
    /// Full prompt message list sent to the provider (column `message`).
    pub prompt: Payload,
    pub message_token_count: i32,
    pub message_unit_price: UnitPrice,
    pub message_price_unit: PriceUnit,
    pub answer: String,
    pub answer_token_count: i32,
    pub answer_unit_price: UnitPrice,
    pub answer_price_unit: PriceUnit,
    /// Seconds spent producing the answer.
    pub latency: f64,
    pub is_deleted: bool,
    pub status: MessageStatus,
    /// Failure text; empty unless `status` is `failed`.
    pub error: String,
    pub total_token_count: i32,
    pub total_price: Price,
    pub updated_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

impl Message {
    pub fn message_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.message_token_count,
            self.message_unit_price,
            self.message_price_unit,
        )
    }

    pub fn answer_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.answer_token_count,
            self.answer_unit_price,
            self.answer_price_unit,
        )
    }

    pub(crate) fn set_message_usage(&mut self, usage: TokenUsage) {
        self.message_token_count = usage.token_count;
        self.message_unit_price = usage.unit_price;
        self.message_price_unit = usage.price_unit;
    }

    pub(crate) fn set_answer_usage(&mut self, usage: TokenUsage) {
        self.answer_token_count = usage.token_count;
        self.answer_unit_price = usage.unit_price;
        self.answer_price_unit = usage.price_unit;
    }

    /// Recompute `total_token_count` and `total_price` from both sides.
    pub fn settle_totals(&mut self) -> LedgerResult<()> {
        let (tokens, price) = settle(&self.message_usage(), &self.answer_usage())?;
        self.total_token_count = tokens;
        self.total_price = price;
        Ok(())
    }
}

/// One recorded agent step.
///
/// Owner ids and provenance are copied from the [`Message`] at append time so
/// traces can be queried per app or conversation without joins. Rows are
/// never updated once written.
#[derive(
    Queryable,
    Selectable,
    Identifiable,
    Associations,
    Insertable,
    Debug,
    Clone,
    PartialEq,
    Serialize,
)]
#[diesel(belongs_to(Message))]
#[diesel(table_name = message_agent_thought)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MessageAgentThought {
    pub id: String,
    pub app_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub invoke_from: InvokeFrom,
    pub created_by: String,
    /// Execution order within the message.
    pub position: i32,
    pub event: ThoughtEvent,
    /// Model reasoning.
    pub thought: String,
    /// Tool output.
    pub observation: String,
    pub tool: String,
    pub tool_input: Payload,
    pub prompt: Payload,
    pub message_token_count: i32,
    pub message_unit_price: UnitPrice,
    pub message_price_unit: PriceUnit,
    pub answer: String,
    pub answer_token_count: i32,
    pub answer_unit_price: UnitPrice,
    pub answer_price_unit: PriceUnit,
    pub total_token_count: i32,
    pub total_price: Price,
    pub latency: f64,
    pub updated_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

impl MessageAgentThought {
    pub fn message_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.message_token_count,
            self.message_unit_price,
            self.message_price_unit,
        )
    }

    pub fn answer_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.answer_token_count,
            self.answer_unit_price,
            self.answer_price_unit,
        )
    }

    pub fn settle_totals(&mut self) -> LedgerResult<()> {
        let (tokens, price) = settle(&self.message_usage(), &self.answer_usage())?;
        self.total_token_count = tokens;
        self.total_price = price;
        Ok(())
    }
}

fn settle(prompt: &TokenUsage, answer: &TokenUsage) -> LedgerResult<(i32, Price)> {
    let overflow = || LedgerError::validation("token or price totals overflow");

    let tokens = prompt
        .token_count
        .checked_add(answer.token_count)
        .ok_or_else(overflow)?;
    let price = prompt
        .price()
        .zip(answer.price())
        .and_then(|(prompt, answer)| prompt.checked_add(answer))
        .ok_or_else(overflow)?;

    Ok((tokens, price))
}

// --- Field validation ----------------------------------------------------------------------

pub(crate) fn require_id(field: &str, value: &str) -> LedgerResult<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{field} is required")));
    }
    limit_len(field, value, MAX_ID_LEN)
}

pub(crate) fn limit_len(field: &str, value: &str, max: usize) -> LedgerResult<()> {
    if value.chars().count() > max {
        return Err(LedgerError::validation(format!(
            "{field} is longer than {max} characters"
        )));
    }
    Ok(())
}

pub(crate) fn check_usage(side: &str, usage: &TokenUsage) -> LedgerResult<()> {
    if usage.token_count < 0 {
        return Err(LedgerError::validation(format!(
            "{side} token count cannot be negative"
        )));
    }
    if usage.unit_price.is_negative() || usage.price_unit.is_negative() {
        return Err(LedgerError::validation(format!(
            "{side} prices cannot be negative"
        )));
    }
    Ok(())
}

pub(crate) fn check_latency(latency: f64) -> LedgerResult<()> {
    if !latency.is_finite() || latency < 0.0 {
        return Err(LedgerError::validation(
            "latency must be a finite, non-negative number of seconds",
        ));
    }
    Ok(())
}
