//! Background maintenance: memory compaction and conversation-log indexing.
//!
//! Finished turns are submitted to coalescing queues; periodic loops drain
//! them through a summarizer model into a [`store::NoteStore`] and a
//! [`store::TermIndex`].

pub mod errors;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use errors::MaintenanceError;
pub use queue::{CoalescingQueue, WorkKey};
pub use scheduler::{MaintenanceScheduler, Transcript};
pub use store::{MemoryDatabase, NoteStore, TermIndex};
