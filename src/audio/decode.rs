//! # Audio Payload Decoding
//!
//! Turns the base64 text of an `audio` event into samples the output device can
//! play.
//!
//! ## Accepted payloads:
//! - **RIFF/WAV**: 8, 16 or 24-bit integer PCM, or 32-bit float
//! - **Raw PCM**: Headerless 16-bit little-endian samples at the configured fallback format
//!
//! Multi-channel audio is averaged down to mono. Decoding is CPU work, so the
//! async entry point moves it onto the blocking pool.

use super::{AudioUnit, DecodedClip, PlaybackError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, unit: &AudioUnit) -> Result<DecodedClip, PlaybackError>;
}

/// Format assumed for payloads that carry no header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadDecoder {
    fallback: PcmFormat,
}

impl PayloadDecoder {
    pub fn new(fallback: PcmFormat) -> Self {
        Self { fallback }
    }

    /// Decode the base64 text of one audio event.
    pub fn decode_payload(&self, payload: &str) -> Result<DecodedClip, PlaybackError> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| PlaybackError::Base64(e.to_string()))?;
        self.decode_bytes(&bytes)
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<DecodedClip, PlaybackError> {
        if bytes.is_empty() {
            return Err(PlaybackError::Format("payload is empty".to_string()));
        }

        let clip = if bytes.starts_with(b"RIFF") {
            decode_wav(bytes)?
        } else {
            decode_raw_pcm(bytes, self.fallback)?
        };

        if clip.samples.is_empty() {
            return Err(PlaybackError::Format("payload contains no samples".to_string()));
        }
        Ok(clip)
    }
}

#[async_trait]
impl AudioDecoder for PayloadDecoder {
    async fn decode(&self, unit: &AudioUnit) -> Result<DecodedClip, PlaybackError> {
        let decoder = self.clone();
        let payload = unit.payload.clone();
        tokio::task::spawn_blocking(move || decoder.decode_payload(&payload))
            .await
            .map_err(|e| PlaybackError::Format(format!("decode task failed: {}", e)))?
    }
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedClip, PlaybackError> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) =
        wav::read(&mut cursor).map_err(|e| PlaybackError::Format(format!("bad wav data: {}", e)))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples.into_iter().map(|s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    if header.sampling_rate == 0 {
        return Err(PlaybackError::Format("wav header has zero sample rate".to_string()));
    }

    Ok(DecodedClip {
        samples: downmix(&interleaved, header.channel_count),
        sample_rate: header.sampling_rate,
    })
}

fn decode_raw_pcm(bytes: &[u8], format: PcmFormat) -> Result<DecodedClip, PlaybackError> {
    if bytes.len() % 2 != 0 {
        return Err(PlaybackError::Format(
            "raw PCM length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(bytes);
    let mut interleaved = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        interleaved.push(sample as f32 / 32768.0);
    }

    Ok(DecodedClip {
        samples: downmix(&interleaved, format.channels),
        sample_rate: format.sample_rate,
    })
}

/// Average interleaved frames into a single channel.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
