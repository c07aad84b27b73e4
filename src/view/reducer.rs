//! Snapshot reducers.
//!
//! Each function takes one full-replace snapshot and returns the list a consumer
//! should display. They hold no state and never look at the previous view.
//! All sorting is stable (`slice::sort_by_key`), so equal keys keep the order
//! they had in the snapshot.

use super::{DiagnosisCandidate, QuestionCandidate, QuestionStatus, ViewLimits};

/// Diagnoses ordered by indicator count, highest first, capped to `limit`.
pub fn rank_diagnoses(mut items: Vec<DiagnosisCandidate>, limit: usize) -> Vec<DiagnosisCandidate> {
    items.sort_by_key(|item| std::cmp::Reverse(item.indicator_count));
    items.truncate(limit);
    items
}

/// Open questions ordered by rank ascending, capped to `limit`.
pub fn active_questions(items: &[QuestionCandidate], limit: usize) -> Vec<QuestionCandidate> {
    let mut active: Vec<QuestionCandidate> = items
        .iter()
        .filter(|q| q.status == QuestionStatus::Active)
        .cloned()
        .collect();
    active.sort_by_key(|q| q.rank);
    active.truncate(limit);
    active
}

/// The most recent `limit` asked questions, in snapshot order.
pub fn recently_asked(items: &[QuestionCandidate], limit: usize) -> Vec<QuestionCandidate> {
    let asked: Vec<&QuestionCandidate> = items
        .iter()
        .filter(|q| q.status == QuestionStatus::Asked)
        .collect();
    let skip = asked.len().saturating_sub(limit);
    asked.into_iter().skip(skip).cloned().collect()
}

/// Both question views derived from the same snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionViews {
    pub active: Vec<QuestionCandidate>,
    pub asked: Vec<QuestionCandidate>,
}

impl QuestionViews {
    pub fn from_snapshot(items: &[QuestionCandidate], limits: &ViewLimits) -> Self {
        Self {
            active: active_questions(items, limits.active_questions),
            asked: recently_asked(items, limits.asked_history),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::ProbabilityTier;

    fn diagnosis(id: &str, count: u32) -> DiagnosisCandidate {
        DiagnosisCandidate {
            id: id.to_string(),
            label: format!("Diagnosis {}", id),
            probability_tier: ProbabilityTier::Medium,
            indicator_count: count,
            indicator_details: Vec::new(),
        }
    }

    fn question(id: &str, status: QuestionStatus, rank: i64) -> QuestionCandidate {
        QuestionCandidate {
            id: id.to_string(),
            text: format!("Question {}", id),
            role: "nurse".to_string(),
            score: 0.5,
            rank,
            status,
        }
    }

    fn diagnosis_ids(items: &[DiagnosisCandidate]) -> Vec<&str> {
        items.iter().map(|d| d.id.as_str()).collect()
    }

    fn question_ids(items: &[QuestionCandidate]) -> Vec<&str> {
        items.iter().map(|q| q.id.as_str()).collect()
    }

    #[test]
    fn test_diagnoses_top_three_with_stable_ties() {
        let snapshot = vec![
            diagnosis("A", 3),
            diagnosis("B", 7),
            diagnosis("C", 7),
            diagnosis("D", 1),
            diagnosis("E", 5),
        ];

        let view = rank_diagnoses(snapshot, 3);
        assert_eq!(diagnosis_ids(&view), vec!["B", "C", "E"]);
    }

    #[test]
    fn test_diagnoses_shorter_than_limit() {
        let view = rank_diagnoses(vec![diagnosis("A", 1), diagnosis("B", 2)], 3);
        assert_eq!(diagnosis_ids(&view), vec!["B", "A"]);
        assert!(rank_diagnoses(Vec::new(), 3).is_empty());
    }

    #[test]
    fn test_active_questions_sorted_by_rank() {
        let snapshot = vec![
            question("q3", QuestionStatus::Active, 3),
            question("asked", QuestionStatus::Asked, 1),
            question("q1", QuestionStatus::Active, 1),
            question("q9", QuestionStatus::Active, 9),
        ];

        let view = active_questions(&snapshot, 10);
        assert_eq!(view.iter().map(|q| q.rank).collect::<Vec<_>>(), vec![1, 3, 9]);
        assert_eq!(question_ids(&view), vec!["q1", "q3", "q9"]);
    }

    #[test]
    fn test_active_questions_capped() {
        let snapshot: Vec<_> = (0..15)
            .rev()
            .map(|rank| question(&format!("q{}", rank), QuestionStatus::Active, rank))
            .collect();

        let view = active_questions(&snapshot, 10);
        assert_eq!(view.len(), 10);
        assert_eq!(view.first().map(|q| q.rank), Some(0));
        assert_eq!(view.last().map(|q| q.rank), Some(9));
    }

    #[test]
    fn test_unknown_status_is_in_neither_view() {
        let snapshot = vec![
            question("odd", QuestionStatus::Unknown("parked".to_string()), 0),
            question("open", QuestionStatus::Active, 2),
        ];

        let views = QuestionViews::from_snapshot(&snapshot, &ViewLimits::default());
        assert_eq!(question_ids(&views.active), vec!["open"]);
        assert!(views.asked.is_empty());
    }

    #[test]
    fn test_recently_asked_keeps_last_five_in_order() {
        let snapshot: Vec<_> = (1..=7)
            .map(|n| question(&format!("a{}", n), QuestionStatus::Asked, 10 - n))
            .collect();

        let view = recently_asked(&snapshot, 5);
        assert_eq!(question_ids(&view), vec!["a3", "a4", "a5", "a6", "a7"]);
    }

    #[test]
    fn test_views_depend_only_on_latest_snapshot() {
        let limits = ViewLimits::default();
        let first = vec![question("old", QuestionStatus::Active, 1)];
        let second = vec![question("new", QuestionStatus::Active, 4)];

        let _ = QuestionViews::from_snapshot(&first, &limits);
        let views = QuestionViews::from_snapshot(&second, &limits);
        assert_eq!(question_ids(&views.active), vec!["new"]);
    }
}
