//! Conversation shape checks. Diagnostic only; nothing here mutates.

use kiln_core::{Message, Role};

use super::types::IntegrityIssue;

/// Every integrity issue in `messages`.
pub fn integrity_issues(messages: &[Message]) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    let user = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant = messages.iter().filter(|m| m.role == Role::Assistant).count();

    if user == 0 {
        issues.push(IntegrityIssue::NoUserMessages);
    }
    if assistant == 0 {
        issues.push(IntegrityIssue::NoAssistantMessages);
    }
    if user > 0 && user <= assistant {
        issues.push(IntegrityIssue::ImbalancedTurns { user, assistant });
    }
    issues.extend(
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_blank())
            .map(|(index, _)| IntegrityIssue::EmptyContent { index }),
    );
    issues
}

/// Whether the conversation opens with a user or system turn and strictly
/// alternates between roles once system messages are skipped.
pub fn has_valid_flow(messages: &[Message]) -> bool {
    let Some(first) = messages.first() else {
        return false;
    };
    if !matches!(first.role, Role::User | Role::System) {
        return false;
    }
    let mut turns = messages.iter().filter(|m| m.role != Role::System);
    let Some(mut previous) = turns.next() else {
        return true;
    };
    for message in turns {
        if message.role == previous.role {
            return false;
        }
        previous = message;
    }
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
