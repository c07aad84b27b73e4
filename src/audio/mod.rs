//! # Audio Playback Module
//!
//! Plays the simulated speakers' voices in the exact order the server sent them.
//!
//! ## Key Components:
//! - **decode**: Base64 payload → mono f32 PCM (`wav` container or raw PCM16LE)
//! - **output**: The playback device (cpal), one clip at a time, resolving on completion
//! - **queue**: FIFO backlog with exactly one unit decoding or playing at any moment
//!
//! ## Failure model:
//! Audio is an enhancement. A bad chunk is dropped and logged, a missing output
//! device turns playback into a no-op, and neither affects transcript or ranking
//! updates.

pub mod decode;
pub mod output;
pub mod queue;

use thiserror::Error;

pub use decode::{AudioDecoder, PayloadDecoder, PcmFormat};
pub use output::{AudioOutput, CpalOutput, DisabledOutput, OutputInfo};
pub use queue::{OutputReadiness, PlaybackQueue, QueueState, QueueStatus};

#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("unsupported audio payload: {0}")]
    Format(String),
    #[error("audio output unavailable: {0}")]
    OutputUnavailable(String),
    #[error("playback failed: {0}")]
    Playback(String),
}

/// One encoded audio chunk waiting for its turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioUnit {
    /// Arrival order, assigned by the queue
    pub seq: u64,
    pub speaker: String,
    /// Base64 text exactly as received
    pub payload: String,
}

/// Decoded mono audio ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedClip {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
