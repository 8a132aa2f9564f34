//! Inference Client — OpenAI-compatible API client for the model endpoint.
//!
//! This module handles all communication with the model server:
//! - Streaming and non-streaming chat completions
//! - SSE stream parsing
//! - The [`client::ModelClient`] seam the conversation loop and the
//!   maintenance summarizer depend on

pub mod client;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{InferenceClient, ModelClient};
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelRequest, Role};
