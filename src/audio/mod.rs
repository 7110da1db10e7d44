//! # Audio Handling
//!
//! The server does not decode or transcode audio; the engine receives exactly what the
//! client sent. This module only covers what the session needs on the way through.
//!
//! ## Audio Format Expectations:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod processor;    // Frame alignment and duration estimates
pub mod recorder;     // Optional WAV copy of a session's audio

pub use processor::{align_pcm16, estimated_duration_secs};
pub use recorder::AudioRecorder;
