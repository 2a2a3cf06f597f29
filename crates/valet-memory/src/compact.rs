//! Session compaction: summary + structured snapshot + bulk archival.
//!
//! The ordering guarantee is the whole point: summary and snapshot persist
//! before any event is archived, so a reader racing the compactor sees
//! either the full pre-compaction log or the post-compaction artifacts.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consolidate::{first_person_signals, is_preference_clause};
use crate::error::{MemoryError, Result};
use crate::store::Store;
use crate::types::{Event, EventRole, SessionSnapshot};

/// How many recent events one compaction pass considers.
const COMPACT_WINDOW: usize = 320;
/// Sessions shorter than this are never compacted.
const MIN_EVENTS: usize = 24;
/// Compaction triggers above this fraction of the thread budget.
const TRIGGER_RATIO: f64 = 0.85;
/// Approximate tokens one kept turn costs; sizes the retention window.
const TOKENS_PER_TURN: usize = 280;
/// Per-bucket cap on snapshot lists.
const SNAPSHOT_LIST_CAP: usize = 12;

/// Injected summary function: `(existing_summary, transcript) -> summary`.
/// Implementations typically call a cheap LLM; absence or failure falls
/// back to a deterministic textual summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        existing_summary: &str,
        transcript: &str,
    ) -> std::result::Result<String, String>;
}

/// What a compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Below the threshold; nothing written.
    Skipped(&'static str),
    Done {
        compaction_id: String,
        archived: usize,
        retained: usize,
        snapshot_revision: i64,
    },
}

pub struct Compactor {
    store: Arc<Store>,
}

impl Compactor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Compact one session against `thread_budget` tokens.
    pub async fn compact_session(
        &self,
        session_key: &str,
        thread_budget: usize,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<CompactOutcome> {
        let events = self.store.list_recent_events(session_key, COMPACT_WINDOW)?;
        if events.len() < MIN_EVENTS {
            debug!(session_key, count = events.len(), "compact: below event floor");
            return Ok(CompactOutcome::Skipped("below event floor"));
        }
        let estimate: usize = events.iter().map(|e| e.content.chars().count() * 2 / 5).sum();
        if (estimate as f64) <= TRIGGER_RATIO * thread_budget as f64 {
            debug!(session_key, estimate, thread_budget, "compact: within budget");
            return Ok(CompactOutcome::Skipped("within budget"));
        }

        let keep_latest = (thread_budget / TOKENS_PER_TURN).clamp(10, 40);
        let plan = plan_retention(&events, keep_latest);
        if plan.to_archive.is_empty() {
            return Ok(CompactOutcome::Skipped("nothing to archive"));
        }

        let compaction_id = Uuid::new_v4().to_string();
        self.store
            .insert_compaction(&compaction_id, session_key, events.len() as i64)?;

        match self
            .run(session_key, &compaction_id, &events, &plan, summarizer)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Partial summary/snapshot stay in place for diagnostics.
                let _ = self.store.fail_compaction(&compaction_id, &e.to_string());
                Err(MemoryError::Compaction(e.to_string()))
            }
        }
    }

    async fn run(
        &self,
        session_key: &str,
        compaction_id: &str,
        events: &[Event],
        plan: &RetentionPlan,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<CompactOutcome> {
        use crate::types::CompactionStatus;

        let existing_summary = self.store.get_session_summary(session_key)?;
        let transcript = render_transcript(&plan.to_archive);
        let summary = match summarizer {
            Some(s) => match s.summarize(&existing_summary, &transcript).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => fallback_summary(&plan.to_archive),
                Err(e) => {
                    warn!(error = %e, "summarizer failed; using deterministic summary");
                    fallback_summary(&plan.to_archive)
                }
            },
            None => fallback_summary(&plan.to_archive),
        };
        self.store.transition_compaction(
            compaction_id,
            CompactionStatus::SummaryReady,
            &serde_json::json!({
                "phase": "summary",
                "strategy": plan.strategy,
                "to_archive": plan.to_archive.len(),
                "retained": plan.retained,
            }),
        )?;

        // Snapshot + summary persist before any event is flagged.
        let snapshot = derive_snapshot(session_key, compaction_id, &summary, &plan.to_archive);
        let revision = self.store.insert_snapshot(&snapshot)?;
        self.store.set_session_summary(session_key, &summary)?;

        let archived = match plan.strategy {
            "turn_aware" => self
                .store
                .archive_events_outside_turns(session_key, &plan.keep_turns)?,
            _ => self
                .store
                .archive_oldest_events(session_key, plan.to_archive.len())?,
        };
        self.store.transition_compaction(
            compaction_id,
            CompactionStatus::Archived,
            &serde_json::json!({
                "phase": "archive",
                "strategy": plan.strategy,
                "archived": archived,
            }),
        )?;

        self.store
            .complete_compaction(compaction_id, &summary, plan.retained as i64)?;
        info!(
            session_key,
            compaction_id,
            archived,
            retained = plan.retained,
            revision,
            "session compacted"
        );
        Ok(CompactOutcome::Done {
            compaction_id: compaction_id.to_string(),
            archived,
            retained: plan.retained,
            snapshot_revision: revision,
        })
    }
}

struct RetentionPlan {
    /// "turn_aware" or "event_window".
    strategy: &'static str,
    keep_turns: Vec<String>,
    to_archive: Vec<Event>,
    retained: usize,
}

/// Walk newest-first, keeping whole turns until `keep_latest` events are
/// retained. A single oversized turn defeats turn grouping; fall back to
/// an event-count window in that case.
fn plan_retention(events: &[Event], keep_latest: usize) -> RetentionPlan {
    let mut keep_turns: Vec<String> = Vec::new();
    let mut kept: HashSet<&str> = HashSet::new();
    let mut retained = 0usize;
    for event in events.iter().rev() {
        if kept.contains(event.turn_id.as_str()) {
            retained += 1;
        } else if retained < keep_latest {
            kept.insert(event.turn_id.as_str());
            keep_turns.push(event.turn_id.clone());
            retained += 1;
        }
    }
    let to_archive: Vec<Event> = events
        .iter()
        .filter(|e| !kept.contains(e.turn_id.as_str()))
        .cloned()
        .collect();

    if to_archive.is_empty() && events.len() > keep_latest {
        let n = events.len() - keep_latest;
        return RetentionPlan {
            strategy: "event_window",
            keep_turns: Vec::new(),
            to_archive: events[..n].to_vec(),
            retained: keep_latest,
        };
    }
    RetentionPlan {
        strategy: "turn_aware",
        keep_turns,
        retained,
        to_archive,
    }
}

fn render_transcript(events: &[Event]) -> String {
    events
        .iter()
        .map(|e| format!("{}: {}", e.role.to_string().to_uppercase(), e.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic summary: time window plus the first six user topics.
fn fallback_summary(to_archive: &[Event]) -> String {
    let start = to_archive.first().map(|e| e.created_at).unwrap_or(0);
    let end = to_archive.last().map(|e| e.created_at).unwrap_or(0);
    let window = format!("{} to {}", format_ts(start), format_ts(end));

    let mut topics: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for event in to_archive.iter().filter(|e| e.role == EventRole::User) {
        let topic: String = event.content.chars().take(60).collect();
        if seen.insert(topic.to_lowercase()) {
            topics.push(topic);
        }
        if topics.len() == 6 {
            break;
        }
    }
    if topics.is_empty() {
        format!("Conversation from {window}.")
    } else {
        format!("Conversation from {window} covering: {}.", topics.join("; "))
    }
}

fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Bucket first-person signals and keyword heuristics from the events being
/// archived into a structured snapshot. Lists are deduped case-insensitively
/// and bounded.
fn derive_snapshot(
    session_key: &str,
    compaction_id: &str,
    summary: &str,
    to_archive: &[Event],
) -> SessionSnapshot {
    let mut facts = DedupList::new();
    let mut preferences = DedupList::new();
    let mut tasks = DedupList::new();
    let mut open_loops = DedupList::new();
    let mut constraints = DedupList::new();

    for event in to_archive.iter().filter(|e| e.role == EventRole::User) {
        for signal in first_person_signals(&event.content) {
            if is_preference_clause(&signal) {
                preferences.push(signal);
            } else {
                facts.push(signal);
            }
        }

        let lower = event.content.to_lowercase();
        let line: String = event.content.chars().take(120).collect();
        if ["todo", "deadline", "remind", "due "].iter().any(|k| lower.contains(k)) {
            tasks.push(line.clone());
        }
        if ["must", "can't", "cannot", "requirement", "required"]
            .iter()
            .any(|k| lower.contains(k))
        {
            constraints.push(line.clone());
        }
        if event.content.contains('?') {
            open_loops.push(line);
        }
    }

    SessionSnapshot {
        session_key: session_key.to_string(),
        revision: 0,
        created_at: 0,
        facts: facts.into_vec(),
        preferences: preferences.into_vec(),
        tasks: tasks.into_vec(),
        open_loops: open_loops.into_vec(),
        constraints: constraints.into_vec(),
        summary: summary.to_string(),
        compaction_id: compaction_id.to_string(),
    }
}

/// Case-insensitive dedupe with a size cap.
struct DedupList {
    seen: HashSet<String>,
    items: Vec<String>,
}

impl DedupList {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, item: String) {
        if self.items.len() < SNAPSHOT_LIST_CAP && self.seen.insert(item.to_lowercase()) {
            self.items.push(item);
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.items
    }
}
