//! Agent Core — the per-turn conversation runtime.
//!
//! Submodules:
//! - `segmenter`: Incremental delimiter detection over streamed model output
//! - `dispatcher`: Tool payload decoding, registry, and handler invocation
//! - `conversation`: Message list and tool-result folding between rounds
//! - `agent_loop`: Bounded generate → segment → dispatch rounds
//! - `builtin_tools`: Clock and conversation-log search tools
//! - `voice`: Sentence buffering and markdown stripping for speech synthesis
//! - `errors`: Agent-level error types

pub mod agent_loop;
pub mod builtin_tools;
pub mod conversation;
pub mod dispatcher;
pub mod errors;
pub mod segmenter;
pub mod voice;

// Re-exports for convenience
pub use agent_loop::{ConversationLoop, LoopEvent, TurnOutcome, TurnRequest, TurnStatus};
pub use conversation::ConversationState;
pub use dispatcher::{ToolContext, ToolDispatcher, ToolHandler, ToolRegistry, ToolResult};
pub use errors::{AgentError, DispatchError};
pub use segmenter::{DelimiterSpec, GrammarKind, SegmentEvent, SegmenterChain, StreamSegmenter};
pub use voice::VoiceSynthesizer;
