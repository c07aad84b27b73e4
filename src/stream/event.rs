//! # Stream Events
//!
//! Wire format of the simulation feed. Every inbound text frame is one JSON
//! object with a `type` discriminator:
//!
//! ```json
//! {"type": "audio", "speaker": "PATIENT", "data": "<base64>"}
//! {"type": "transcript", "speaker": "NURSE", "text": "Any chest pain?"}
//! {"type": "diagnosis", "data": [{"did": "D1", "diagnosis": "...", "indicators_count": 4, ...}]}
//! {"type": "questions", "data": [{"qid": "Q1", "content": "...", "rank": 1, "status": null, ...}]}
//! {"type": "system", "message": "Patient agent ready"}
//! ```
//!
//! [`StreamEvent`] is a closed enum, so adding a variant forces every `match`
//! over it to be revisited.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// One encoded speech chunk
    Audio {
        #[serde(default)]
        speaker: String,
        /// Base64 encoded audio buffer
        data: String,
    },
    Transcript {
        speaker: String,
        text: String,
    },
    /// Full replacement of the diagnosis ranking
    Diagnosis {
        data: Vec<DiagnosisItem>,
    },
    /// Full replacement of the question set
    Questions {
        data: Vec<QuestionItem>,
    },
    System {
        message: String,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Audio { .. } => EventKind::Audio,
            StreamEvent::Transcript { .. } => EventKind::Transcript,
            StreamEvent::Diagnosis { .. } => EventKind::Diagnosis,
            StreamEvent::Questions { .. } => EventKind::Questions,
            StreamEvent::System { .. } => EventKind::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Audio,
    Transcript,
    Diagnosis,
    Questions,
    System,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Audio,
        EventKind::Transcript,
        EventKind::Diagnosis,
        EventKind::Questions,
        EventKind::System,
    ];

    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "audio" => Some(EventKind::Audio),
            "transcript" => Some(EventKind::Transcript),
            "diagnosis" => Some(EventKind::Diagnosis),
            "questions" => Some(EventKind::Questions),
            "system" => Some(EventKind::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Audio => "audio",
            EventKind::Transcript => "transcript",
            EventKind::Diagnosis => "diagnosis",
            EventKind::Questions => "questions",
            EventKind::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisItem {
    pub did: String,
    pub diagnosis: String,
    #[serde(default)]
    pub probability: String,
    #[serde(default)]
    pub indicators_count: u32,
    #[serde(default)]
    pub indicators_point: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub qid: String,
    pub content: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub score: f64,
    pub rank: i64,
    /// `null`/absent for open questions, `"deleted"` once asked
    #[serde(default)]
    pub status: Option<String>,
}

/// Why an inbound frame could not become a [`StreamEvent`].
#[derive(Debug, Error)]
pub enum EventError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` event: {source}")]
    Invalid {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// Parse one text frame.
///
/// The discriminator is checked before the payload so the log line can say
/// whether the server sent something new or something broken.
pub fn parse_event(raw: &str) -> Result<StreamEvent, EventError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let tag = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(EventError::MissingType)?;
    let kind = EventKind::from_wire(tag).ok_or_else(|| EventError::UnknownType(tag.to_string()))?;

    serde_json::from_value(value).map_err(|source| EventError::Invalid {
        kind: kind.as_str(),
        source,
    })
}
