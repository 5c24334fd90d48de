//! Fallback chat formatting.

use std::fmt::Write;

use kiln_core::Message;

/// Render `messages` in ChatML and open an assistant turn.
pub fn chatml(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let _ = write!(
            prompt,
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role.as_str(),
            message.content
        );
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}
