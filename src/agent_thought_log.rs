//! # Agent thought log
//!
//! Append-only log of the steps an agent took while answering a [`Message`]:
//! reasoning, tool calls, tool results, retrievals and the final answer.
//!
//! Steps are ordered by `position`, which must grow by exactly one per step
//! within a message (the first step may start anywhere at or above zero).
//! The log enforces this itself inside the append transaction, and a unique
//! index on `(message_id, position)` backs it up at the storage level, so two
//! writers racing for the same slot cannot both succeed.
//!
//! Reading a message's steps back in order gives its [`Trace`], the object a
//! UI or audit tool replays.
//!
//! ```no_run
//! use convo_ledger::agent_thought_log::NewAgentThought;
//! use convo_ledger::ledger::Ledger;
//! use convo_ledger::types::{ThoughtEvent, Visibility};
//!
//! # fn demo(ledger: &mut Ledger, message_id: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let mut log = ledger.agent_thoughts();
//! log.append(0, NewAgentThought::new(message_id, ThoughtEvent::AgentThought)
//!     .with_thought("I should look this up"))?;
//! log.append(1, NewAgentThought::new(message_id, ThoughtEvent::AgentAction)
//!     .with_tool("bing_search", serde_json::json!({"query": "rust diesel"})))?;
//! let trace = log.trace(message_id, Visibility::Active)?;
//! assert_eq!(trace.steps.len(), 2);
//! # Ok(()) }
//! ```

use chrono::Utc;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::message_store;
use crate::models::{
    Message, MessageAgentThought, check_latency, check_usage, limit_len, require_id,
};
use crate::schema::{message, message_agent_thought};
use crate::types::{MessageStatus, Payload, Price, ThoughtEvent, TokenUsage, Visibility};

/// Tool names longer than this are rejected.
const MAX_TOOL_LEN: usize = 255;

/// One step as supplied by the agent engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentThought {
    pub message_id: String,
    pub event: ThoughtEvent,
    pub thought: String,
    pub observation: String,
    pub tool: String,
    pub tool_input: Payload,
    pub prompt: Payload,
    pub message_usage: TokenUsage,
    pub answer: String,
    pub answer_usage: TokenUsage,
    pub latency: f64,
}

impl NewAgentThought {
    pub fn new(message_id: impl Into<String>, event: ThoughtEvent) -> Self {
        Self {
            message_id: message_id.into(),
            event,
            thought: String::new(),
            observation: String::new(),
            tool: String::new(),
            tool_input: Payload::default(),
            prompt: Payload::default(),
            message_usage: TokenUsage::default(),
            answer: String::new(),
            answer_usage: TokenUsage::default(),
            latency: 0.0,
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = observation.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, input: serde_json::Value) -> Self {
        self.tool = tool.into();
        self.tool_input = Payload(input);
        self
    }

    pub fn with_prompt(mut self, prompt: serde_json::Value, usage: TokenUsage) -> Self {
        self.prompt = Payload(prompt);
        self.message_usage = usage;
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>, usage: TokenUsage) -> Self {
        self.answer = answer.into();
        self.answer_usage = usage;
        self
    }

    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    fn validate(&self) -> LedgerResult<()> {
        require_id("message_id", &self.message_id)?;
        limit_len("tool", &self.tool, MAX_TOOL_LEN)?;
        if self.event.requires_tool() && self.tool.trim().is_empty() {
            return Err(LedgerError::validation(format!(
                "{} steps must name the tool they invoke",
                self.event
            )));
        }
        check_usage("message", &self.message_usage)?;
        check_usage("answer", &self.answer_usage)?;
        check_latency(self.latency)
    }
}

/// A message together with its ordered agent steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub message: Message,
    pub steps: Vec<MessageAgentThought>,
}

impl Trace {
    /// Steps that invoked a tool, in order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &MessageAgentThought> {
        self.steps.iter().filter(|step| step.event.requires_tool())
    }

    /// Answer text of the last `agent_message` step, if any.
    pub fn final_answer(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|step| step.event == ThoughtEvent::AgentMessage)
            .map(|step| step.answer.as_str())
    }

    /// Sum of the steps' own `total_price` values.
    pub fn steps_price(&self) -> Option<Price> {
        self.steps
            .iter()
            .try_fold(Price::ZERO, |acc, step| acc.checked_add(step.total_price))
    }
}

/// Agent step repository bound to one connection.
pub struct AgentThoughtLog<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> AgentThoughtLog<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Append a step at an explicit `position`.
    ///
    /// # Errors
    /// - `SequenceConflict` when `position` is taken or is not the next one.
    /// - `NotFound` when the message is missing or archived.
    /// - `Validation` for malformed steps or a message that is already finalized.
    pub fn append(
        &mut self,
        position: i32,
        step: NewAgentThought,
    ) -> LedgerResult<MessageAgentThought> {
        step.validate()?;
        self.conn
            .immediate_transaction(|conn| insert_step(conn, Some(position), step))
    }

    /// Append a step at the next free position of its message.
    ///
    /// The position is read and written under the same write lock, so
    /// concurrent callers on other connections get consecutive positions.
    pub fn append_next(&mut self, step: NewAgentThought) -> LedgerResult<MessageAgentThought> {
        step.validate()?;
        self.conn
            .immediate_transaction(|conn| insert_step(conn, None, step))
    }

    /// Steps of a message ordered by position.
    ///
    /// An archived message's steps stay readable with
    /// [`Visibility::IncludeArchived`].
    ///
    /// # Errors
    /// `NotFound` when the message is missing, or archived and `visibility`
    /// is [`Visibility::Active`].
    pub fn list(
        &mut self,
        message_id: &str,
        visibility: Visibility,
    ) -> LedgerResult<Vec<MessageAgentThought>> {
        message_store::find(self.conn, message_id, visibility)?;
        load_steps(self.conn, message_id)
    }

    /// The message and its ordered steps, as one consistent snapshot.
    pub fn trace(&mut self, message_id: &str, visibility: Visibility) -> LedgerResult<Trace> {
        self.conn.transaction(|conn| {
            let message = message_store::find(conn, message_id, visibility)?;
            let steps = load_steps(conn, message_id)?;
            Ok(Trace { message, steps })
        })
    }
}

fn load_steps(
    conn: &mut SqliteConnection,
    message_id: &str,
) -> LedgerResult<Vec<MessageAgentThought>> {
    let steps = message_agent_thought::table
        .filter(message_agent_thought::message_id.eq(message_id))
        .order(message_agent_thought::position.asc())
        .select(MessageAgentThought::as_select())
        .load(conn)?;
    debug!(message_id, count = steps.len(), "Loaded agent steps");
    Ok(steps)
}

fn insert_step(
    conn: &mut SqliteConnection,
    requested: Option<i32>,
    step: NewAgentThought,
) -> LedgerResult<MessageAgentThought> {
    let parent = message_store::find(conn, &step.message_id, Visibility::Active)?;
    if parent.status.is_terminal() {
        return Err(LedgerError::validation(format!(
            "message `{}` is already {}; no further agent steps",
            parent.id, parent.status
        )));
    }

    let last: Option<i32> = message_agent_thought::table
        .filter(message_agent_thought::message_id.eq(&parent.id))
        .select(max(message_agent_thought::position))
        .get_result(conn)?;
    let position = next_position(&parent.id, last, requested)?;

    let now = Utc::now().naive_utc();
    let mut row = MessageAgentThought {
        id: Uuid::new_v4().to_string(),
        app_id: parent.app_id.clone(),
        conversation_id: parent.conversation_id.clone(),
        message_id: parent.id.clone(),
        invoke_from: parent.invoke_from,
        created_by: parent.created_by.clone(),
        position,
        event: step.event,
        thought: step.thought,
        observation: step.observation,
        tool: step.tool,
        tool_input: step.tool_input,
        prompt: step.prompt,
        message_token_count: step.message_usage.token_count,
        message_unit_price: step.message_usage.unit_price,
        message_price_unit: step.message_usage.price_unit,
        answer: step.answer,
        answer_token_count: step.answer_usage.token_count,
        answer_unit_price: step.answer_usage.unit_price,
        answer_price_unit: step.answer_usage.price_unit,
        total_token_count: 0,
        total_price: Price::ZERO,
        latency: step.latency,
        updated_at: now,
        created_at: now,
    };
    row.settle_totals()?;

    let inserted: MessageAgentThought = match diesel::insert_into(message_agent_thought::table)
        .values(&row)
        .returning(MessageAgentThought::as_returning())
        .get_result(conn)
    {
        Ok(inserted) => inserted,
        Err(err) => return Err(position_taken(conn, err, &parent.id, position)),
    };

    if parent.status == MessageStatus::Pending {
        diesel::update(message::table.find(&parent.id))
            .set((
                message::status.eq(MessageStatus::Running),
                message::updated_at.eq(now),
            ))
            .execute(conn)?;
        info!(message_id = %parent.id, "Message is running");
    }

    info!(
        message_id = %inserted.message_id,
        position = inserted.position,
        event = %inserted.event,
        "Appended agent step"
    );
    Ok(inserted)
}

/// Report a unique index violation on `(message_id, position)` as a
/// `SequenceConflict` carrying the slot that is actually free now.
///
/// Appends through this log read and write positions under one write lock,
/// so this only fires when some other writer inserted steps directly.
fn position_taken(
    conn: &mut SqliteConnection,
    err: diesel::result::Error,
    message_id: &str,
    position: i32,
) -> LedgerError {
    if !matches!(
        err,
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    ) {
        return err.into();
    }

    let last: Option<i32> = match message_agent_thought::table
        .filter(message_agent_thought::message_id.eq(message_id))
        .select(max(message_agent_thought::position))
        .get_result(conn)
    {
        Ok(last) => last,
        Err(lookup) => return lookup.into(),
    };
    let expected = last.map_or(0, |last| last.saturating_add(1));

    warn!(message_id, position, expected, "Agent step position already taken");
    LedgerError::SequenceConflict {
        message_id: message_id.to_string(),
        position,
        expected,
    }
}

/// Decide the position of a new step given the last stored one.
fn next_position(message_id: &str, last: Option<i32>, requested: Option<i32>) -> LedgerResult<i32> {
    let expected = match last {
        Some(last) => last
            .checked_add(1)
            .ok_or_else(|| LedgerError::validation("agent step positions are exhausted"))?,
        None => 0,
    };

    match (last, requested) {
        (_, None) => Ok(expected),
        (None, Some(position)) if position >= 0 => Ok(position),
        (None, Some(position)) => Err(LedgerError::validation(format!(
            "agent step position {position} is negative"
        ))),
        (Some(_), Some(position)) if position == expected => Ok(position),
        (Some(_), Some(position)) => {
            warn!(message_id, position, expected, "Rejected out-of-sequence agent step");
            Err(LedgerError::SequenceConflict {
                message_id: message_id.to_string(),
                position,
                expected,
            })
        }
    }
}
