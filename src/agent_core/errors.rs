//! Agent Core error types.

use thiserror::Error;

/// Errors raised while setting up a conversation turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A delimiter grammar is empty or collides with another grammar.
    #[error("invalid delimiter grammar: {reason}")]
    InvalidGrammar { reason: String },
}

/// Errors produced while decoding a captured tool payload.
///
/// Neither variant is fatal to a turn: the loop reports them as system
/// notices and carries on within its round bound.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload is not a JSON object with a string `action`.
    #[error("malformed tool call: {reason}")]
    Parse { reason: String },

    /// `arguments` is present but cannot be decoded into a map.
    #[error("malformed tool arguments for '{action}': {reason}")]
    Arguments { action: String, reason: String },

    /// A handler for the same `Family.operation` is already registered.
    #[error("tool '{action}' is already registered")]
    DuplicateTool { action: String },
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::Parse {
            reason: e.to_string(),
        }
    }
}
