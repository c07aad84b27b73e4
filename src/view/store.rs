//! # View Store
//!
//! Holds the one [`ViewState`] instance for the process. The stream controller is
//! the only writer; HTTP handlers and WebSocket feeds only read or subscribe.
//!
//! ## Update model:
//! Every mutation bumps `revision` and publishes a full clone of the new state on
//! a `tokio::sync::broadcast` channel. Subscribers never receive diffs.
//!
//! ## Rust Concepts:
//! - **Arc<RwLock<T>>**: Shared ownership with many readers or one writer
//! - **broadcast**: Multi-consumer channel; slow consumers see `Lagged` instead of blocking the writer

use super::reducer::{rank_diagnoses, QuestionViews};
use super::{ChatEntry, DiagnosisCandidate, QuestionCandidate, ViewLimits, ViewState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ViewStore {
    state: Arc<RwLock<ViewState>>,
    limits: Arc<RwLock<ViewLimits>>,
    next_chat_id: Arc<AtomicU64>,
    updates: broadcast::Sender<ViewState>,
}

impl ViewStore {
    pub fn new(limits: ViewLimits) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(ViewState::default())),
            limits: Arc::new(RwLock::new(limits)),
            next_chat_id: Arc::new(AtomicU64::new(1)),
            updates,
        }
    }

    /// Copy of the current view. The read lock is released before returning.
    pub fn snapshot(&self) -> ViewState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receive every future view, starting after the current one.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewState> {
        self.updates.subscribe()
    }

    pub fn limits(&self) -> ViewLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// New limits apply from the next snapshot onwards.
    pub fn set_limits(&self, limits: ViewLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
    }

    /// Append one transcript line and return its id.
    pub fn append_transcript(&self, speaker: &str, text: &str) -> u64 {
        let id = self.next_chat_id.fetch_add(1, Ordering::SeqCst);
        let now = chrono::Local::now();
        let entry = ChatEntry {
            id,
            speaker: speaker.to_string(),
            text: text.to_string(),
            timestamp: now.format("%H:%M:%S").to_string(),
            received_at: now.to_rfc3339(),
        };
        self.mutate(|state| state.chat.push(entry));
        id
    }

    pub fn replace_diagnoses(&self, snapshot: Vec<DiagnosisCandidate>) {
        let ranked = rank_diagnoses(snapshot, self.limits().diagnoses);
        self.mutate(|state| state.diagnoses = ranked);
    }

    pub fn replace_questions(&self, snapshot: Vec<QuestionCandidate>) {
        let views = QuestionViews::from_snapshot(&snapshot, &self.limits());
        self.mutate(|state| {
            state.active_questions = views.active;
            state.asked_questions = views.asked;
        });
    }

    pub fn set_status(&self, status: &str) {
        let status = status.to_string();
        self.mutate(|state| state.status = status);
    }

    pub fn mark_connected(&self, status: &str) {
        let status = status.to_string();
        self.mutate(|state| {
            state.connected = true;
            state.status = status;
        });
    }

    /// Connection gone: both flags drop and the status explains why.
    pub fn mark_disconnected(&self, status: &str) {
        let status = status.to_string();
        self.mutate(|state| {
            state.connected = false;
            state.session_active = false;
            state.status = status;
        });
    }

    pub fn session_active(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session_active
    }

    pub fn set_session_active(&self, active: bool) {
        self.mutate(|state| state.session_active = active);
    }

    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut ViewState),
    {
        let published = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut state);
            state.revision += 1;
            state.clone()
        };
        // No subscribers is not an error
        let _ = self.updates.send(published);
    }
}
