//! Message compression and summarisation.
//!
//! Pure functions over message lists. User and assistant messages are
//! grouped by role and each group of two or more becomes one synthetic
//! message; system and tool messages pass through untouched, ahead of the
//! compressed groups.

use std::fmt::Write;

use kiln_core::{Message, Role};
use kiln_settings::CompressionLevel;

use crate::constants::{
    HEAVY_FRAGMENT_WORDS, HEAVY_MAX_FRAGMENTS, LIGHT_EXCERPT_CHARS, MEDIUM_EXCERPT_CHARS,
    SUMMARY_MAX_TOPICS, SUMMARY_TOPIC_WORDS,
};

/// Compress `messages` at `level`.
pub fn compress(level: CompressionLevel, messages: &[Message]) -> Vec<Message> {
    if messages.is_empty() || level == CompressionLevel::None {
        return messages.to_vec();
    }

    let mut out: Vec<Message> = messages
        .iter()
        .filter(|m| !is_compressible(m.role))
        .cloned()
        .collect();

    for role in [Role::User, Role::Assistant] {
        let group: Vec<&Message> = messages.iter().filter(|m| m.role == role).collect();
        match group.as_slice() {
            [] => {}
            [single] => out.push((*single).clone()),
            many => out.push(compress_group(level, role, many)),
        }
    }
    out
}

fn is_compressible(role: Role) -> bool {
    matches!(role, Role::User | Role::Assistant)
}

fn compress_group(level: CompressionLevel, role: Role, group: &[&Message]) -> Message {
    let content = match level {
        CompressionLevel::None => group
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        CompressionLevel::Light => group
            .iter()
            .map(|m| excerpt(&m.content, LIGHT_EXCERPT_CHARS))
            .collect::<Vec<_>>()
            .join("\n"),
        CompressionLevel::Medium => {
            let mut digest = format!(
                "Summary of {} earlier {} messages:",
                group.len(),
                role.as_str()
            );
            for (i, m) in group.iter().enumerate() {
                let _ = write!(
                    digest,
                    "\n{}. {}",
                    i + 1,
                    excerpt(&m.content, MEDIUM_EXCERPT_CHARS)
                );
            }
            digest
        }
        CompressionLevel::Heavy => {
            let fragments: Vec<String> = group
                .iter()
                .map(|m| leading_words(&m.content, HEAVY_FRAGMENT_WORDS))
                .filter(|f| !f.is_empty())
                .take(HEAVY_MAX_FRAGMENTS)
                .collect();
            if fragments.is_empty() {
                format!("Earlier {} messages were empty.", role.as_str())
            } else {
                format!(
                    "Earlier {} messages covered: {}.",
                    role.as_str(),
                    fragments.join(", ")
                )
            }
        }
    };
    Message::new(role, content)
}

/// One synthetic system message describing `messages`.
pub fn summarize(messages: &[Message]) -> Message {
    let user = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();
    let topics: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| leading_words(&m.content, SUMMARY_TOPIC_WORDS))
        .filter(|t| !t.is_empty())
        .take(SUMMARY_MAX_TOPICS)
        .collect();
    let topics = if topics.is_empty() {
        "general discussion".to_string()
    } else {
        topics.join("; ")
    };
    Message::system(format!(
        "Previous conversation summary: {} messages ({user} from the user, {assistant} from the assistant). Topics discussed: {topics}.",
        messages.len()
    ))
}

/// First `max_chars` characters of `text`, marked when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn leading_words(text: &str, words: usize) -> String {
    text.split_whitespace()
        .take(words)
        .collect::<Vec<_>>()
        .join(" ")
}
