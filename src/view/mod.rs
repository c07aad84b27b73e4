//! # View State
//!
//! Display-ready state derived from the simulation stream. Everything in here is
//! what a presentation layer needs to draw the interview: the transcript log,
//! the current status line, connection flags and the three ranked lists.
//!
//! ## Layout:
//! - **reducer**: Pure snapshot → view functions (ranking, filtering, capping)
//! - **store**: The single-writer holder of [`ViewState`] that broadcasts every update
//!
//! ## Snapshot contract:
//! Diagnosis and question updates arrive as complete replacement sets. The view
//! for each is recomputed from the newest snapshot alone; nothing is carried over
//! from the previous one.

pub mod reducer;
pub mod store;

use crate::stream::event::{DiagnosisItem, QuestionItem};
use serde::Serialize;

pub use store::ViewStore;

/// Status line shown before anything has happened.
pub const INITIAL_STATUS: &str = "Ready to start";

/// One line of the live transcript.
///
/// `id` comes from a per-store counter so two lines arriving in the same
/// millisecond still get distinct, ordered identities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatEntry {
    pub id: u64,
    pub speaker: String,
    pub text: String,
    /// Local wall-clock time formatted as `HH:MM:SS`
    pub timestamp: String,
    /// RFC3339 instant the line was received
    pub received_at: String,
}

/// Coarse likelihood bucket reported by the upstream ranker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityTier {
    High,
    Medium,
    Low,
    /// Any label the client does not recognize, kept verbatim
    Other(String),
}

impl ProbabilityTier {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => ProbabilityTier::High,
            "medium" => ProbabilityTier::Medium,
            "low" => ProbabilityTier::Low,
            _ => ProbabilityTier::Other(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisCandidate {
    pub id: String,
    pub label: String,
    pub probability_tier: ProbabilityTier,
    pub indicator_count: u32,
    pub indicator_details: Vec<String>,
}

impl From<DiagnosisItem> for DiagnosisCandidate {
    fn from(item: DiagnosisItem) -> Self {
        Self {
            id: item.did,
            label: item.diagnosis,
            probability_tier: ProbabilityTier::parse(&item.probability),
            indicator_count: item.indicators_count,
            indicator_details: item.indicators_point,
        }
    }
}

/// Where a recommended question sits in the interview.
///
/// The upstream feed leaves `status` empty for open questions and marks asked
/// ones as `"deleted"`. Anything else lands in `Unknown` rather than being
/// folded into one of the known buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Active,
    Asked,
    Unknown(String),
}

impl QuestionStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => QuestionStatus::Active,
            Some(value) if value.eq_ignore_ascii_case("deleted") => QuestionStatus::Asked,
            Some(value) => QuestionStatus::Unknown(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionCandidate {
    pub id: String,
    pub text: String,
    pub role: String,
    pub score: f64,
    pub rank: i64,
    pub status: QuestionStatus,
}

impl From<QuestionItem> for QuestionCandidate {
    fn from(item: QuestionItem) -> Self {
        let status = QuestionStatus::parse(item.status.as_deref());
        Self {
            id: item.qid,
            text: item.content,
            role: item.role,
            score: item.score,
            rank: item.rank,
            status,
        }
    }
}

/// Caps applied by the reducer to each derived list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewLimits {
    pub diagnoses: usize,
    pub active_questions: usize,
    pub asked_history: usize,
}

impl Default for ViewLimits {
    fn default() -> Self {
        Self {
            diagnoses: 3,
            active_questions: 10,
            asked_history: 5,
        }
    }
}

/// Everything the presentation layer renders, re-emitted in full on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState {
    /// Bumped on every mutation so consumers can drop stale frames
    pub revision: u64,
    pub connected: bool,
    pub session_active: bool,
    pub status: String,
    pub chat: Vec<ChatEntry>,
    pub diagnoses: Vec<DiagnosisCandidate>,
    pub active_questions: Vec<QuestionCandidate>,
    pub asked_questions: Vec<QuestionCandidate>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            revision: 0,
            connected: false,
            session_active: false,
            status: INITIAL_STATUS.to_string(),
            chat: Vec::new(),
            diagnoses: Vec::new(),
            active_questions: Vec::new(),
            asked_questions: Vec::new(),
        }
    }
}
