//! # Audio Frame Processing
//!
//! Small, allocation-aware helpers applied to every inbound audio frame before it reaches
//! the engine or the debug recorder.

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const BYTES_PER_SECOND: usize = SAMPLE_RATE as usize * (BITS_PER_SAMPLE as usize / 8);

/// Make a frame a whole number of 16-bit samples.
///
/// Odd-length frames get one trailing zero byte; even-length frames are returned untouched.
/// The engine rejects odd-length PCM, so this is applied to every frame unconditionally.
pub fn align_pcm16(mut frame: Vec<u8>) -> Vec<u8> {
    if frame.len() % 2 != 0 {
        frame.push(0);
    }
    frame
}

/// Seconds of 16kHz mono 16-bit audio represented by `total_bytes`.
pub fn estimated_duration_secs(total_bytes: usize) -> f64 {
    total_bytes as f64 / BYTES_PER_SECOND as f64
}
