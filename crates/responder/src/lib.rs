//! Stage (B): enriches a wake-word `Command` with per-session conversation
//! history, calls the LLM gateway, and emits a `Reply` for the Synthesizer.
//! See SPEC_FULL.md §4.2 for the full algorithm this crate implements.

pub mod handler;
pub mod history;

pub use handler::{ResponderCounters, ResponderHandler};
pub use history::{BrokerHistory, ConversationHistory, MemoryHistory};
