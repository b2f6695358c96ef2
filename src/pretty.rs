//! # Pretty printing of ledger records
//!
//! Terminal rendering for the `ledger` CLI. Every function writes to any
//! [`Write`] sink so the same code drives stdout and the tests.
//!
//! Colours follow one scheme throughout:
//!
//! | Element | Colour |
//! |---------|--------|
//! | Headings and ids | bold cyan |
//! | Succeeded / active | green |
//! | Running / pending | yellow |
//! | Failed / archived | red |
//! | Secondary text | dark grey |
//!
//! Long free text (queries, answers, observations) is cut to one line with
//! [`excerpt`] so lists stay scannable; `ledger --json` prints the full rows.

use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, Print, SetAttribute, SetForegroundColor},
};
use std::error::Error;
use std::io::Write;

use crate::agent_thought_log::Trace;
use crate::conversation_store::ConversationUsage;
use crate::models::{Conversation, Message, MessageAgentThought};
use crate::types::MessageStatus;

/// Characters of free text shown per field in list views.
const EXCERPT_CHARS: usize = 72;

/// Print conversations as a list, newest activity first as given.
pub fn print_conversations<W: Write>(
    out: &mut W,
    conversations: &[Conversation],
) -> Result<(), Box<dyn Error>> {
    if conversations.is_empty() {
        muted(out, "no conversations\n")?;
        return Ok(());
    }

    for convo in conversations {
        heading(out, &convo.id)?;
        if convo.is_pinned {
            colored(out, Color::Yellow, " [pinned]")?;
        }
        if convo.is_deleted {
            colored(out, Color::Red, " [archived]")?;
        }
        writeln!(out)?;

        let name = if convo.name.is_empty() {
            "(untitled)"
        } else {
            convo.name.as_str()
        };
        writeln!(out, "  {name}")?;
        muted(
            out,
            &format!(
                "  {} by {} · updated {}\n",
                convo.invoke_from,
                convo.created_by,
                convo.updated_at.format("%Y-%m-%d %H:%M:%S")
            ),
        )?;
    }

    out.flush()?;
    Ok(())
}

/// Print the messages of one conversation.
pub fn print_messages<W: Write>(out: &mut W, messages: &[Message]) -> Result<(), Box<dyn Error>> {
    if messages.is_empty() {
        muted(out, "no messages\n")?;
        return Ok(());
    }

    for message in messages {
        print_message_header(out, message)?;
        writeln!(out, "  > {}", excerpt(&message.query, EXCERPT_CHARS))?;
        if !message.answer.is_empty() {
            writeln!(out, "  < {}", excerpt(&message.answer, EXCERPT_CHARS))?;
        }
        if !message.error.is_empty() {
            colored(
                out,
                Color::Red,
                &format!("  ! {}\n", excerpt(&message.error, EXCERPT_CHARS)),
            )?;
        }
        muted(
            out,
            &format!(
                "  {} tokens · {} · {:.3}s\n",
                message.total_token_count, message.total_price, message.latency
            ),
        )?;
    }

    out.flush()?;
    Ok(())
}

/// Print a message followed by its agent steps in order.
pub fn print_trace<W: Write>(out: &mut W, trace: &Trace) -> Result<(), Box<dyn Error>> {
    print_message_header(out, &trace.message)?;
    writeln!(out, "  > {}", excerpt(&trace.message.query, EXCERPT_CHARS))?;

    if trace.steps.is_empty() {
        muted(out, "  no agent steps\n")?;
    }
    for step in &trace.steps {
        print_step(out, step)?;
    }

    if let Some(answer) = trace.final_answer() {
        out.execute(SetAttribute(Attribute::Bold))?;
        writeln!(out, "  = {}", excerpt(answer, EXCERPT_CHARS))?;
        out.execute(SetAttribute(Attribute::Reset))?;
    }

    out.flush()?;
    Ok(())
}

/// Print the billing aggregate of a conversation.
pub fn print_usage<W: Write>(out: &mut W, usage: &ConversationUsage) -> Result<(), Box<dyn Error>> {
    heading(out, &usage.conversation_id)?;
    writeln!(out)?;
    writeln!(out, "  messages     {}", usage.message_count)?;
    writeln!(out, "  tokens       {}", usage.total_token_count)?;
    writeln!(out, "  price        {}", usage.total_price)?;
    writeln!(out, "  latency      {:.3}s", usage.total_latency)?;
    out.flush()?;
    Ok(())
}

fn print_message_header<W: Write>(out: &mut W, message: &Message) -> Result<(), Box<dyn Error>> {
    heading(out, &message.id)?;
    write!(out, " ")?;
    colored(
        out,
        status_color(message.status),
        &format!("[{}]", message.status),
    )?;
    if message.is_deleted {
        colored(out, Color::Red, " [archived]")?;
    }
    writeln!(out)?;
    Ok(())
}

fn print_step<W: Write>(out: &mut W, step: &MessageAgentThought) -> Result<(), Box<dyn Error>> {
    muted(out, &format!("  #{:<3} ", step.position))?;
    colored(out, Color::Magenta, step.event.as_str())?;
    if !step.tool.is_empty() {
        write!(out, " {}({})", step.tool, excerpt(&step.tool_input.0.to_string(), 40))?;
    }
    writeln!(out)?;

    if !step.thought.is_empty() {
        writeln!(out, "       {}", excerpt(&step.thought, EXCERPT_CHARS))?;
    }
    if !step.observation.is_empty() {
        muted(
            out,
            &format!("       {}\n", excerpt(&step.observation, EXCERPT_CHARS)),
        )?;
    }
    Ok(())
}

fn status_color(status: MessageStatus) -> Color {
    match status {
        MessageStatus::Pending | MessageStatus::Running => Color::Yellow,
        MessageStatus::Succeeded => Color::Green,
        MessageStatus::Failed => Color::Red,
    }
}

fn heading<W: Write>(out: &mut W, text: &str) -> Result<(), Box<dyn Error>> {
    out.execute(SetForegroundColor(Color::Cyan))?;
    out.execute(SetAttribute(Attribute::Bold))?;
    out.execute(Print(text))?;
    out.execute(SetAttribute(Attribute::Reset))?;
    out.execute(SetForegroundColor(Color::Reset))?;
    Ok(())
}

fn colored<W: Write>(out: &mut W, color: Color, text: &str) -> Result<(), Box<dyn Error>> {
    out.execute(SetForegroundColor(color))?;
    out.execute(Print(text))?;
    out.execute(SetForegroundColor(Color::Reset))?;
    Ok(())
}

fn muted<W: Write>(out: &mut W, text: &str) -> Result<(), Box<dyn Error>> {
    colored(out, Color::DarkGrey, text)
}

/// First line of `text`, cut to `max` characters with a trailing ellipsis.
pub fn excerpt(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let cut = line.chars().count() > max || text.trim().lines().nth(1).is_some();

    let mut shown: String = line.chars().take(max).collect();
    if cut {
        shown.push('…');
    }
    shown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_thought_log::{AgentThoughtLog, NewAgentThought};
    use crate::ledger::Ledger;
    use crate::message_store::NewMessage;
    use crate::types::{InvokeFrom, ThoughtEvent, TokenUsage, Visibility};

    fn render<F>(print: F) -> String
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), Box<dyn Error>>,
    {
        let mut buf = Vec::new();
        print(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("exactly ten", 11), "exactly ten");
        assert_eq!(excerpt("a longer sentence", 8), "a longer…");
        assert_eq!(excerpt("first\nsecond", 72), "first…");
        assert_eq!(excerpt("héllo wörld", 5), "héllo…");
        assert_eq!(excerpt("", 5), "");
    }

    #[test]
    fn test_print_empty_lists() {
        assert!(render(|out| print_conversations(out, &[])).contains("no conversations"));
        assert!(render(|out| print_messages(out, &[])).contains("no messages"));
    }

    #[test]
    fn test_print_conversations_and_messages() {
        let mut ledger = Ledger::in_memory().unwrap();
        let convo = ledger
            .conversations()
            .create("A1", InvokeFrom::WebApp, "acct-1")
            .unwrap();
        ledger
            .messages()
            .create(NewMessage::new(&convo.id, "acct-1", "what is a ledger?"))
            .unwrap();

        let conversations = ledger
            .conversations()
            .list("A1", Visibility::Active)
            .unwrap();
        let text = render(|out| print_conversations(out, &conversations));
        assert!(text.contains(&convo.id));
        assert!(text.contains("(untitled)"));
        assert!(text.contains("web_app by acct-1"));

        let messages = ledger
            .messages()
            .list(&convo.id, Visibility::Active)
            .unwrap();
        let text = render(|out| print_messages(out, &messages));
        assert!(text.contains("[pending]"));
        assert!(text.contains("> what is a ledger?"));
        assert!(text.contains("0 tokens"));
    }

    #[test]
    fn test_print_trace_and_usage() {
        let mut ledger = Ledger::in_memory().unwrap();
        let convo = ledger
            .conversations()
            .create("A1", InvokeFrom::ServiceApi, "user-1")
            .unwrap();
        let msg = ledger
            .messages()
            .create(NewMessage::new(&convo.id, "user-1", "weather?"))
            .unwrap();

        let mut log = AgentThoughtLog::new(ledger.connection());
        log.append_next(
            NewAgentThought::new(&msg.id, ThoughtEvent::AgentAction)
                .with_tool("weather", serde_json::json!({"city": "Oslo"})),
        )
        .unwrap();
        log.append_next(
            NewAgentThought::new(&msg.id, ThoughtEvent::AgentMessage)
                .with_answer("Cold.", TokenUsage::default()),
        )
        .unwrap();
        let trace = log.trace(&msg.id, Visibility::Active).unwrap();

        let text = render(|out| print_trace(out, &trace));
        assert!(text.contains("[running]"));
        assert!(text.contains("agent_action"));
        assert!(text.contains("weather({\"city\":\"Oslo\"})"));
        assert!(text.contains("= Cold."));

        let usage = ledger.conversations().usage(&convo.id, Visibility::Active).unwrap();
        let text = render(|out| print_usage(out, &usage));
        assert!(text.contains("messages     1"));
        assert!(text.contains("price        0"));
    }
}
