//! Per-request conversation state.
//!
//! Holds the message list one turn works on. The list starts as
//! `[system?, history…, user query]` and is mutated between rounds:
//! assistant replies are appended, and tool results replace the last
//! exchange with a single synthetic user message.

use crate::inference::types::{ChatMessage, Role};

use super::dispatcher::ToolInvocation;

/// One tool call folded into the synthetic user message.
#[derive(Debug, Clone)]
struct FoldedCall {
    call_key: String,
    block: String,
}

/// Ordered message list for a single request.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
    /// Calls folded into the last message, while it is the synthetic turn.
    folded: Vec<FoldedCall>,
}

impl ConversationState {
    /// Start from prior history plus the new user query.
    ///
    /// System messages in `history` are dropped; the loop installs its own.
    pub fn new(history: Vec<ChatMessage>, query: &str) -> Self {
        let mut messages: Vec<ChatMessage> = history
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        messages.push(ChatMessage::user(query));
        Self {
            messages,
            folded: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Install or replace the single leading system message.
    pub fn set_system(&mut self, content: &str) {
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = content.to_string(),
            _ => self.messages.insert(0, ChatMessage::system(content)),
        }
    }

    pub fn push_assistant(&mut self, content: &str) {
        self.messages.push(ChatMessage::assistant(content));
        self.folded.clear();
    }

    /// Whether the last message is the synthetic tool-result turn.
    pub fn last_is_synthetic(&self) -> bool {
        !self.folded.is_empty()
    }

    /// Fold a tool result into the conversation.
    ///
    /// The assistant reply that made the call and the user turn before it are
    /// replaced by one user message carrying an "already used" warning and
    /// the result text. Further results in the same round are merged into
    /// that message: a repeat of the same call replaces its block, a
    /// different call appends one. The system message is never removed.
    pub fn apply_tool_result(&mut self, invocation: &ToolInvocation, text: &str) {
        let call_key = invocation.call_key();
        let block = format!("{}\n\n{}", already_used_warning(invocation), text);

        if self.last_is_synthetic() {
            match self.folded.iter_mut().find(|c| c.call_key == call_key) {
                Some(existing) => existing.block = block,
                None => self.folded.push(FoldedCall { call_key, block }),
            }
        } else {
            for _ in 0..2 {
                match self.messages.last() {
                    Some(last) if last.role != Role::System => {
                        self.messages.pop();
                    }
                    _ => break,
                }
            }
            self.messages.push(ChatMessage::user(String::new()));
            self.folded.push(FoldedCall { call_key, block });
        }

        let content = self
            .folded
            .iter()
            .map(|c| c.block.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if let Some(last) = self.messages.last_mut() {
            last.content = content;
        }
    }

    /// The conversation without its most recent message.
    pub fn without_last(&self) -> Vec<ChatMessage> {
        let end = self.messages.len().saturating_sub(1);
        self.messages[..end].to_vec()
    }
}

/// Warning placed in front of a folded tool result.
pub fn already_used_warning(invocation: &ToolInvocation) -> String {
    format!(
        "You have already used the tool {} with the arguments {}. \
         Do not use it again with the same arguments; use its result below.",
        invocation.action,
        invocation.arguments_json()
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
