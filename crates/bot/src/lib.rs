//! Stage (D): the in-bot audio playback coordinator. Consumes `Audio`
//! records off `tts_audio_queue`, session-gates them against the bot's
//! currently bound recognizer session, and drives a strict-FIFO playback
//! protocol through a browser bridge, muting the bot's microphone input
//! for the duration of each clip. See SPEC_FULL.md §4.4 for the full state
//! machine and protocol this crate implements.

pub mod bridge;
pub mod manager_callback;
pub mod player;
pub mod state;

pub use bridge::ChannelBrowserBridge;
pub use manager_callback::{exit_code, notify_manager, BotExitReport};
pub use player::{run_bridge_receive_loop, run_playback_loop, PlaybackConfig, PlayerCounters, PlayerIngestHandler};
pub use state::{AdmitOutcome, AudioSessionState, PlaybackState};
