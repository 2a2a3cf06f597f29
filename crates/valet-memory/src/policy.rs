//! Capture, retention, and recall predicates. Pure functions; the
//! consolidator and retriever call these rather than hard-coding floors.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::{EventRole, MemoryKind};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Only substantive user/assistant content is worth extracting from.
pub fn should_capture(role: EventRole, content: &str) -> bool {
    matches!(role, EventRole::User | EventRole::Assistant) && content.trim().len() >= 6
}

/// Retention per kind, in milliseconds. 0 means no expiry.
pub fn ttl_for(kind: MemoryKind) -> i64 {
    match kind {
        MemoryKind::EpisodicSummary => 30 * DAY_MS,
        MemoryKind::TaskState => 14 * DAY_MS,
        _ => 0,
    }
}

/// Confidence floor below which an extraction op is rejected.
pub fn min_confidence(kind: MemoryKind) -> f64 {
    match kind {
        MemoryKind::SemanticFact | MemoryKind::UserPreference => 0.55,
        MemoryKind::TaskState => 0.50,
        _ => 0.45,
    }
}

/// Recall filter applied after scoring.
pub fn should_recall(score: f64, confidence: f64) -> bool {
    score >= 0.30 && confidence >= 0.40
}

/// Credentials and secrets never become memories, whatever the extractor
/// thought it found.
pub fn is_sensitive(content: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(password|passphrase|secret|api[_-]?key|access[_-]?token|private[_-]?key|credit\s*card)\b")
            .unwrap()
    });
    re.is_match(content)
}
