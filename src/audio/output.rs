//! # Audio Output Device
//!
//! [`AudioOutput`] is the playback primitive: acquire a device once, then play
//! one clip at a time, with `play` resolving only after the last sample has been
//! handed to the device.
//!
//! [`CpalOutput`] opens one output stream in `acquire` and keeps it running for
//! the life of the session. Clips are appended to a shared [`SampleFeed`] that the
//! device callback drains; when the feed runs dry the device plays silence, so
//! back-to-back clips meet without a device restart in between.
//!
//! ## Threading:
//! cpal streams are not `Send` on every platform, so the stream is built and
//! owned by a dedicated `audio-output` thread. The thread holds it until the
//! [`CpalOutput`] drops its stop handle (on re-acquire or shutdown).

use super::{DecodedClip, PlaybackError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// What the device looked like when it was acquired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputInfo {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Open (or re-open) the output. Safe to call repeatedly.
    async fn acquire(&self) -> Result<OutputInfo, PlaybackError>;

    /// Play one clip to completion.
    async fn play(&self, clip: DecodedClip) -> Result<(), PlaybackError>;
}

/// Output used when audio is switched off in configuration.
#[derive(Debug, Default, Clone)]
pub struct DisabledOutput;

#[async_trait]
impl AudioOutput for DisabledOutput {
    async fn acquire(&self) -> Result<OutputInfo, PlaybackError> {
        Err(PlaybackError::OutputUnavailable(
            "audio output disabled in configuration".to_string(),
        ))
    }

    async fn play(&self, _clip: DecodedClip) -> Result<(), PlaybackError> {
        Err(PlaybackError::OutputUnavailable(
            "audio output disabled in configuration".to_string(),
        ))
    }
}

/// Samples waiting for the device, plus one completion marker per clip.
///
/// Positions are counted in samples since the stream opened: a clip is done
/// once `consumed` reaches the `written` total recorded when it was appended.
#[derive(Default)]
pub struct SampleFeed {
    samples: VecDeque<f32>,
    written: u64,
    consumed: u64,
    pending: VecDeque<(u64, oneshot::Sender<Result<(), String>>)>,
    failed: Option<String>,
}

impl SampleFeed {
    /// Append a clip; the receiver resolves once its last sample is consumed.
    pub fn push_clip(
        &mut self,
        samples: Vec<f32>,
    ) -> Result<oneshot::Receiver<Result<(), String>>, PlaybackError> {
        if let Some(reason) = &self.failed {
            return Err(PlaybackError::OutputUnavailable(reason.clone()));
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.written += samples.len() as u64;
        self.samples.extend(samples);
        self.pending.push_back((self.written, done_tx));
        self.settle();
        Ok(done_rx)
    }

    /// Next sample for the device, or silence when nothing is queued.
    pub fn next_sample(&mut self) -> f32 {
        match self.samples.pop_front() {
            Some(sample) => {
                self.consumed += 1;
                sample
            }
            None => 0.0,
        }
    }

    /// Resolve every clip whose final sample has been consumed.
    pub fn settle(&mut self) {
        while let Some((end, _)) = self.pending.front() {
            if *end > self.consumed {
                break;
            }
            if let Some((_, done)) = self.pending.pop_front() {
                let _ = done.send(Ok(()));
            }
        }
    }

    /// The stream broke: queued audio is discarded and every waiting clip fails.
    pub fn fail(&mut self, reason: String) {
        self.samples.clear();
        for (_, done) in self.pending.drain(..) {
            let _ = done.send(Err(reason.clone()));
        }
        self.failed = Some(reason);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

/// An open output stream, owned by its thread.
struct OpenOutput {
    info: OutputInfo,
    feed: Arc<Mutex<SampleFeed>>,
    /// Dropping this lets the output thread release the stream
    _stop: std::sync::mpsc::Sender<()>,
}

pub struct CpalOutput {
    preferred_device: Option<String>,
    open: Mutex<Option<OpenOutput>>,
}

impl CpalOutput {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred_device: preferred_device
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            open: Mutex::new(None),
        }
    }

    /// The live stream's info, unless it has failed since it was opened.
    fn healthy(&self) -> Option<OutputInfo> {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.as_ref()
            .filter(|open| !lock_feed(&open.feed).is_failed())
            .map(|open| open.info.clone())
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn acquire(&self) -> Result<OutputInfo, PlaybackError> {
        if let Some(info) = self.healthy() {
            return Ok(info);
        }

        // Release a broken stream before opening its replacement
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let opened = open_output(self.preferred_device.clone()).await?;
        let info = opened.info.clone();
        info!(
            device = %info.device,
            sample_rate = info.sample_rate,
            channels = info.channels,
            "Audio output acquired"
        );
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = Some(opened);
        Ok(info)
    }

    async fn play(&self, clip: DecodedClip) -> Result<(), PlaybackError> {
        let (feed, device_rate) = {
            let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            match open.as_ref() {
                Some(open) => (Arc::clone(&open.feed), open.info.sample_rate),
                None => {
                    return Err(PlaybackError::OutputUnavailable(
                        "output has not been acquired".to_string(),
                    ))
                }
            }
        };

        let duration_s = clip.duration_seconds();
        let samples = resample_linear(&clip.samples, clip.sample_rate, device_rate);
        let done = lock_feed(&feed).push_clip(samples)?;
        drop(feed);

        done.await
            .map_err(|_| PlaybackError::Playback("output stream closed".to_string()))?
            .map_err(PlaybackError::OutputUnavailable)?;
        debug!(duration_s, "Clip finished");
        Ok(())
    }
}

fn lock_feed(feed: &Mutex<SampleFeed>) -> MutexGuard<'_, SampleFeed> {
    feed.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start the output thread and wait until its stream is playing.
async fn open_output(preferred_name: Option<String>) -> Result<OpenOutput, PlaybackError> {
    let feed = Arc::new(Mutex::new(SampleFeed::default()));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let thread_feed = Arc::clone(&feed);

    std::thread::Builder::new()
        .name("audio-output".to_string())
        .spawn(move || {
            let stream = match start_stream(preferred_name.as_deref(), thread_feed) {
                Ok((stream, info)) => {
                    let _ = ready_tx.send(Ok(info));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            // Returns once the stop sender is dropped
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Audio output stream released");
        })
        .map_err(|e| PlaybackError::OutputUnavailable(format!("could not start output thread: {}", e)))?;

    let info = ready_rx.await.map_err(|_| {
        PlaybackError::OutputUnavailable("output thread exited before opening a stream".to_string())
    })??;

    Ok(OpenOutput {
        info,
        feed,
        _stop: stop_tx,
    })
}

fn pick_output_device(host: &cpal::Host, preferred_name: Option<&str>) -> Option<cpal::Device> {
    if let Some(name) = preferred_name {
        if let Ok(mut devices) = host.output_devices() {
            if let Some(device) = devices.find(|d| device_display_name(d) == name) {
                return Some(device);
            }
        }
        warn!(
            "Preferred output device '{}' not found, falling back to default",
            name
        );
    }
    host.default_output_device()
}

#[allow(deprecated)]
fn device_display_name(device: &cpal::Device) -> String {
    device
        .name()
        .or_else(|_| device.description().map(|d| d.name().to_string()))
        .unwrap_or_else(|_| "Unknown output".to_string())
}

fn start_stream(
    preferred_name: Option<&str>,
    feed: Arc<Mutex<SampleFeed>>,
) -> Result<(cpal::Stream, OutputInfo), PlaybackError> {
    let host = cpal::default_host();
    let device = pick_output_device(&host, preferred_name)
        .ok_or_else(|| PlaybackError::OutputUnavailable("no output device available".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;
    let config: cpal::StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, feed),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, feed),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, feed),
        other => {
            return Err(PlaybackError::OutputUnavailable(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;

    let info = OutputInfo {
        device: device_display_name(&device),
        sample_rate: supported.sample_rate(),
        channels: supported.channels(),
    };
    Ok((stream, info))
}

/// Write the feed to every channel of the device, one mono sample per frame.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    feed: Arc<Mutex<SampleFeed>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    let error_feed = Arc::clone(&feed);

    device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut feed = lock_feed(&feed);
            for frame in out.chunks_mut(channels) {
                let value = T::from_sample(feed.next_sample());
                for slot in frame.iter_mut() {
                    *slot = value;
                }
            }
            feed.settle();
        },
        move |err| {
            error!("Audio output stream error: {}", err);
            lock_feed(&error_feed).fail(err.to_string());
        },
        None,
    )
}

/// Linear-interpolation resampler for mono clips.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}
