//! Stage (C): detects the language of an LLM `Reply`, synthesizes speech via
//! the TTS gateway, and emits an `Audio` record for the Player. See
//! SPEC_FULL.md §4.3 for the full algorithm this crate implements.

pub mod handler;
pub mod language;

pub use handler::{SynthesizerCounters, SynthesizerHandler};
pub use language::detect_language;
