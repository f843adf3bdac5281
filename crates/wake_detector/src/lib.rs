//! Stage (A): detects the "Hey Raven" wake phrase inside recognizer
//! transcript segments and emits a `Command` for the Responder. See
//! SPEC_FULL.md §4.1 for the full algorithm this crate implements.

pub mod handler;
pub mod matcher;
pub mod rate_limiter;

pub use handler::{WakeDetectorCounters, WakeDetectorHandler};
pub use matcher::{CompiledPatternTable, CompileError};
pub use rate_limiter::RateLimiter;
