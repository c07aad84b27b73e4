//! # Sequential Playback Queue
//!
//! Owns the backlog of audio units that have arrived but not yet played.
//!
//! ## Guarantees:
//! - Units play in `enqueue` order, each exactly once
//! - At most one unit is being decoded or played at any moment
//! - `enqueue` only appends; it never interrupts the unit currently playing
//! - A unit that fails to decode is dropped and the next one proceeds
//!
//! ## Lifecycle:
//! The queue is `Idle` when nothing is outstanding and `Draining` otherwise.
//! A single worker task pulls units off an unbounded channel. Before [`PlaybackQueue::init`]
//! has run, units wait in the backlog; if the output could not be acquired they
//! are dropped as they reach the head.

use super::{AudioDecoder, AudioOutput, AudioUnit, OutputInfo, PlaybackError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputReadiness {
    /// `init` has not run yet; units are held
    NotAcquired,
    Ready,
    /// Acquisition failed; units are dropped until the next successful `init`
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub state: QueueState,
    pub output: OutputReadiness,
    pub output_info: Option<OutputInfo>,
    /// Units waiting behind the one in flight
    pub backlog: usize,
    pub played: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    queued: AtomicUsize,
    busy: AtomicBool,
    played: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

pub struct PlaybackQueue {
    units: Mutex<Option<mpsc::UnboundedSender<AudioUnit>>>,
    next_seq: AtomicU64,
    counters: Arc<QueueCounters>,
    readiness: Arc<watch::Sender<OutputReadiness>>,
    output: Arc<dyn AudioOutput>,
    output_info: Mutex<Option<OutputInfo>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackQueue {
    /// Create the queue and start its worker on the current tokio runtime.
    pub fn spawn(decoder: Arc<dyn AudioDecoder>, output: Arc<dyn AudioOutput>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (readiness, _) = watch::channel(OutputReadiness::NotAcquired);
        let readiness = Arc::new(readiness);
        let counters = Arc::new(QueueCounters::default());

        let worker = tokio::spawn(drain(
            rx,
            decoder,
            Arc::clone(&output),
            Arc::clone(&counters),
            Arc::clone(&readiness),
        ));

        Self {
            units: Mutex::new(Some(tx)),
            next_seq: AtomicU64::new(0),
            counters,
            readiness,
            output,
            output_info: Mutex::new(None),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Acquire the output device. Repeat calls re-acquire, which also revives an
    /// output that was previously unavailable.
    pub async fn init(&self) -> Result<OutputInfo, PlaybackError> {
        match self.output.acquire().await {
            Ok(info) => {
                *self.output_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
                self.readiness.send_replace(OutputReadiness::Ready);
                Ok(info)
            }
            Err(err) => {
                warn!(error = %err, "Audio output unavailable; audio will be skipped");
                *self.output_info.lock().unwrap_or_else(PoisonError::into_inner) = None;
                self.readiness.send_replace(OutputReadiness::Unavailable);
                Err(err)
            }
        }
    }

    /// Append a unit to the tail of the backlog and return its sequence number.
    ///
    /// Returns `None` once the queue has been shut down.
    pub fn enqueue(&self, speaker: &str, payload: String) -> Option<u64> {
        let units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = units.as_ref() else {
            warn!("Audio unit received after playback shutdown, ignoring");
            return None;
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let unit = AudioUnit {
            seq,
            speaker: speaker.to_string(),
            payload,
        };
        if tx.send(unit).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(seq, "Playback worker is gone, audio unit discarded");
            return None;
        }
        debug!(seq, speaker, "Audio unit queued");
        Some(seq)
    }

    pub fn state(&self) -> QueueState {
        if self.counters.busy.load(Ordering::SeqCst) || self.counters.queued.load(Ordering::SeqCst) > 0 {
            QueueState::Draining
        } else {
            QueueState::Idle
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            state: self.state(),
            output: *self.readiness.borrow(),
            output_info: self
                .output_info
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            backlog: self.counters.queued.load(Ordering::SeqCst),
            played: self.counters.played.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting units and give the worker `grace` to finish the backlog.
    pub async fn shutdown(&self, grace: Duration) {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(mut handle) = worker {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Playback backlog not drained before shutdown, aborting");
                handle.abort();
            }
        }
        info!("Playback queue stopped");
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<AudioUnit>,
    decoder: Arc<dyn AudioDecoder>,
    output: Arc<dyn AudioOutput>,
    counters: Arc<QueueCounters>,
    readiness: Arc<watch::Sender<OutputReadiness>>,
) {
    let mut ready_rx = readiness.subscribe();

    while let Some(unit) = rx.recv().await {
        counters.busy.store(true, Ordering::SeqCst);
        counters.queued.fetch_sub(1, Ordering::SeqCst);

        play_unit(unit, decoder.as_ref(), output.as_ref(), &counters, &readiness, &mut ready_rx).await;

        counters.busy.store(false, Ordering::SeqCst);
    }
    debug!("Playback worker finished");
}

async fn play_unit(
    unit: AudioUnit,
    decoder: &dyn AudioDecoder,
    output: &dyn AudioOutput,
    counters: &QueueCounters,
    readiness: &watch::Sender<OutputReadiness>,
    ready_rx: &mut watch::Receiver<OutputReadiness>,
) {
    if !wait_for_output(ready_rx).await {
        counters.dropped.fetch_add(1, Ordering::SeqCst);
        debug!(seq = unit.seq, "No audio output, dropping unit");
        return;
    }

    let clip = match decoder.decode(&unit).await {
        Ok(clip) => clip,
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!(seq = unit.seq, speaker = %unit.speaker, error = %err, "Dropping undecodable audio unit");
            return;
        }
    };

    match output.play(clip).await {
        Ok(()) => {
            counters.played.fetch_add(1, Ordering::SeqCst);
            debug!(seq = unit.seq, "Audio unit played");
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!(seq = unit.seq, error = %err, "Audio unit playback failed");
            if matches!(err, PlaybackError::OutputUnavailable(_)) {
                readiness.send_replace(OutputReadiness::Unavailable);
            }
        }
    }
}

/// Block until `init` has decided; `true` when the output is usable.
async fn wait_for_output(ready_rx: &mut watch::Receiver<OutputReadiness>) -> bool {
    loop {
        let current = *ready_rx.borrow_and_update();
        match current {
            OutputReadiness::Ready => return true,
            OutputReadiness::Unavailable => return false,
            OutputReadiness::NotAcquired => {
                if ready_rx.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}
