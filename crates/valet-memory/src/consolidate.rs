//! Turn consolidation: durable memory extraction from session events.
//!
//! Extraction is regex-driven and content-addressed. Re-running the same
//! turn produces the same keys, and the unique item index turns the second
//! pass into in-place refreshes, so consolidation is idempotent.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::embed::{tokenize, Embedder};
use crate::error::Result;
use crate::policy;
use crate::store::{ItemUpsert, Store};
use crate::types::{now_ms, Event, EventRole, MemoryKind, ScopeType};

/// Maximum events read per turn.
const TURN_EVENT_LIMIT: usize = 64;
/// Forget requests tombstone at most this many matches.
const FORGET_MATCH_LIMIT: usize = 5;

/// One extraction result before scope derivation and policy filtering.
#[derive(Debug, Clone)]
pub struct ExtractedUpsert {
    pub kind: MemoryKind,
    pub key: String,
    pub content: String,
    pub confidence: f64,
    pub ttl_ms: i64,
    pub metadata: serde_json::Value,
}

pub struct Consolidator {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
    agent_id: String,
}

impl Consolidator {
    pub fn new(store: Arc<Store>, embedder: Arc<Embedder>, agent_id: &str) -> Self {
        Self {
            store,
            embedder,
            agent_id: agent_id.to_string(),
        }
    }

    /// Consolidate one turn. Returns the number of memory items written.
    pub fn consolidate_turn(
        &self,
        session_key: &str,
        turn_id: &str,
        user_id: &str,
    ) -> Result<usize> {
        let events = self
            .store
            .list_turn_events(session_key, turn_id, TURN_EVENT_LIMIT)?;
        if events.is_empty() {
            debug!(session_key, turn_id, "consolidate: empty turn, skipping");
            return Ok(0);
        }
        let now = now_ms();

        let mut ops: Vec<ExtractedUpsert> = Vec::new();
        for event in &events {
            if event.role != EventRole::User || !policy::should_capture(event.role, &event.content)
            {
                continue;
            }
            self.apply_forget_requests(&event.content, user_id, now)?;
            ops.extend(extract_user_ops(&event.content));
        }

        if let Some(recap) = turn_recap(&events, turn_id) {
            ops.push(recap);
        }

        let written = self.apply_ops(&ops, session_key, user_id, &events)?;
        self.store.mark_session_consolidated(session_key, now)?;
        if written > 0 {
            info!(session_key, turn_id, written, "turn consolidated");
        }
        Ok(written)
    }

    /// Filter, scope, and upsert extraction ops, embedding each item and
    /// linking successive writes of the same turn into a local graph.
    pub fn apply_ops(
        &self,
        ops: &[ExtractedUpsert],
        session_key: &str,
        user_id: &str,
        events: &[Event],
    ) -> Result<usize> {
        let source_event_id = events
            .iter()
            .find(|e| e.role == EventRole::User)
            .map(|e| e.id.clone())
            .unwrap_or_default();

        let mut written = 0usize;
        let mut turn_item_ids: Vec<i64> = Vec::new();
        for op in ops {
            if !accept_op(op) {
                continue;
            }
            let upsert = to_item_upsert(op, session_key, user_id, &self.agent_id, &source_event_id);
            let (item_id, _inserted) = self.store.upsert_memory_item(&upsert)?;
            let vector = self.embedder.embed(&op.content);
            self.store
                .upsert_embedding(item_id, self.embedder.model_id(), &vector)?;
            written += 1;

            if let Some(prev) = turn_item_ids.last() {
                self.store
                    .upsert_memory_link(*prev, item_id, "cooccurred_turn", 0.5)?;
            }
            turn_item_ids.push(item_id);
        }
        Ok(written)
    }

    /// "please forget X": tombstone the top FTS matches for X.
    fn apply_forget_requests(&self, content: &str, user_id: &str, now: i64) -> Result<()> {
        for target in forget_targets(content) {
            let tokens = tokenize(&target);
            if tokens.is_empty() {
                continue;
            }
            let expr = tokens
                .iter()
                .map(|t| format!("\"{t}\""))
                .collect::<Vec<_>>()
                .join(" OR ");
            let ids = self.store.search_items_fts(
                &expr,
                user_id,
                &self.agent_id,
                now,
                FORGET_MATCH_LIMIT,
            )?;
            for id in ids {
                if self.store.tombstone_memory_item(id, now)? {
                    info!(item_id = id, target = %target, "memory forgotten on request");
                }
            }
        }
        Ok(())
    }
}

/// Policy gate: confidence floor for the kind, and never capture secrets.
pub fn accept_op(op: &ExtractedUpsert) -> bool {
    op.confidence >= policy::min_confidence(op.kind) && !policy::is_sensitive(&op.content)
}

/// Derive storage scope and build the store-level upsert.
pub fn to_item_upsert(
    op: &ExtractedUpsert,
    session_key: &str,
    user_id: &str,
    agent_id: &str,
    source_event_id: &str,
) -> ItemUpsert {
    let (scope_type, scope_id) = match op.metadata["scope"].as_str() {
        Some("session") => (ScopeType::Session, session_key.to_string()),
        Some("user") => (ScopeType::User, user_id.to_string()),
        Some("global") => (ScopeType::Global, String::new()),
        _ => match op.kind {
            MemoryKind::UserPreference | MemoryKind::SemanticFact => {
                (ScopeType::User, user_id.to_string())
            }
            MemoryKind::EpisodicSummary | MemoryKind::TaskState => {
                (ScopeType::Session, session_key.to_string())
            }
            MemoryKind::Procedural => (ScopeType::Global, String::new()),
        },
    };
    ItemUpsert {
        user_id: user_id.to_string(),
        agent_id: agent_id.to_string(),
        kind: op.kind,
        scope_type,
        scope_id,
        key: op.key.clone(),
        content: op.content.clone(),
        confidence: op.confidence,
        expires_at: if op.ttl_ms > 0 { now_ms() + op.ttl_ms } else { 0 },
        source_event_id: source_event_id.to_string(),
        metadata: op.metadata.clone(),
    }
}

/// Run every fact extractor over one user message. This is also the
/// immediate-capture path used by `record_user_turn`.
pub fn extract_user_ops(content: &str) -> Vec<ExtractedUpsert> {
    let mut ops = Vec::new();
    let statement = is_statement(content);

    if statement {
        for captured in capture_all(preference_re(), content) {
            let fact = format!("prefers {}", clean_clause(&captured));
            ops.push(ExtractedUpsert {
                kind: MemoryKind::UserPreference,
                key: content_key("pref", &fact),
                content: fact,
                confidence: 0.70,
                ttl_ms: policy::ttl_for(MemoryKind::UserPreference),
                metadata: serde_json::json!({ "extractor": "preference" }),
            });
        }
    }

    for captured in capture_all(identity_re(), content) {
        let fact = format!("name is {}", clean_clause(&captured));
        ops.push(ExtractedUpsert {
            kind: MemoryKind::SemanticFact,
            key: content_key("identity", &fact),
            content: fact,
            confidence: 0.85,
            ttl_ms: 0,
            metadata: serde_json::json!({ "extractor": "identity" }),
        });
    }

    for captured in capture_all(timezone_re(), content) {
        let fact = format!("timezone is {}", clean_clause(&captured));
        ops.push(ExtractedUpsert {
            kind: MemoryKind::SemanticFact,
            key: content_key("timezone", &fact),
            content: fact,
            confidence: 0.80,
            ttl_ms: 0,
            metadata: serde_json::json!({ "extractor": "timezone" }),
        });
    }

    if statement {
        for captured in capture_all(first_person_re(), content) {
            let fact = clean_clause(&captured);
            // The dedicated extractors above already cover preference
            // phrasing; skip their clauses here to avoid near-duplicates.
            if preference_re().is_match(&fact) {
                continue;
            }
            ops.push(ExtractedUpsert {
                kind: MemoryKind::SemanticFact,
                key: content_key("fact", &fact),
                content: fact,
                confidence: 0.60,
                ttl_ms: 0,
                metadata: serde_json::json!({ "extractor": "first_person" }),
            });
        }
    }

    ops
}

/// One episodic recap per turn, keyed by the turn id.
fn turn_recap(events: &[Event], turn_id: &str) -> Option<ExtractedUpsert> {
    let user = events.iter().find(|e| e.role == EventRole::User)?;
    let assistant = events.iter().find(|e| e.role == EventRole::Assistant);
    let mut recap = format!("User asked: {}", truncate(&user.content, 200));
    if let Some(a) = assistant {
        recap.push_str(&format!("; assistant responded: {}", truncate(&a.content, 200)));
    }
    Some(ExtractedUpsert {
        kind: MemoryKind::EpisodicSummary,
        key: format!("episode:{turn_id}"),
        content: recap,
        confidence: 0.50,
        ttl_ms: policy::ttl_for(MemoryKind::EpisodicSummary),
        metadata: serde_json::json!({ "extractor": "turn_recap" }),
    })
}

/// First-person clauses in one message, cleaned of trailing punctuation.
/// The compactor uses these to derive snapshot facts and preferences.
pub fn first_person_signals(content: &str) -> Vec<String> {
    capture_all(first_person_re(), content)
        .iter()
        .map(|c| clean_clause(c))
        .filter(|c| !c.is_empty())
        .collect()
}

/// Whether a clause expresses a preference rather than a plain fact.
pub fn is_preference_clause(clause: &str) -> bool {
    preference_re().is_match(clause)
}

/// "please forget X" targets in one message.
pub fn forget_targets(content: &str) -> Vec<String> {
    capture_all(forget_re(), content)
        .into_iter()
        .map(|t| clean_clause(&t))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Question-form messages carry no durable fact unless a persistence cue
/// ("remember", "from now on", ...) asks for one.
fn is_statement(content: &str) -> bool {
    let trimmed = content.trim();
    if !trimmed.ends_with('?') {
        return true;
    }
    let lower = trimmed.to_lowercase();
    ["remember", "from now on", "always", "note that", "don't forget"]
        .iter()
        .any(|cue| lower.contains(cue))
}

fn content_key(prefix: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().to_lowercase().as_bytes());
    format!("{prefix}:{}", hex::encode(&hasher.finalize()[..12]))
}

fn capture_all(re: &Regex, content: &str) -> Vec<String> {
    re.captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn clean_clause(raw: &str) -> String {
    raw.trim().trim_end_matches(['.', '!', '?', ',']).trim().to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

fn preference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bi\s+(?:really\s+|truly\s+)?(?:prefer|like|love|enjoy|dislike|hate)\s+([^.!?\n]{2,120})")
            .unwrap()
    })
}

fn identity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:my\s+name\s+is|call\s+me)\s+([A-Za-z][\w'\-]{1,40})").unwrap()
    })
}

fn timezone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:my\s+timezone\s+is|i'?m\s+on)\s+(UTC[+-]?\d{1,2}|[A-Za-z]+/[A-Za-z_]+)")
            .unwrap()
    })
}

fn first_person_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(i\s+(?:am|'m|have|work|live|use|drink|play|study|own|run|prefer|like|love|enjoy)\b[^.!?\n]{2,120})")
            .unwrap()
    })
}

fn forget_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:please\s+)?forget\s+(?:about\s+|that\s+)?([^.!?\n]{2,80})").unwrap()
    })
}
