//! Hybrid recall: FTS rank blended with hashed-vector similarity and
//! recency, intent-weighted, re-ranked by token overlap, cached.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::embed::{cosine, tokenize, Embedder};
use crate::error::Result;
use crate::policy;
use crate::store::Store;
use crate::types::{now_ms, MemoryCard, MemoryItem, MemoryKind};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Scope flags and tuning for one recall call.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub session_key: String,
    pub user_id: String,
    pub agent_id: String,
    pub max_cards: usize,
    pub candidate_limit: usize,
    /// Items whose blended base score falls below this are dropped before
    /// the policy filter runs.
    pub min_score: f64,
    pub cache_ttl_ms: i64,
    /// Evaluation instant (epoch ms); tests pin this.
    pub now: i64,
    pub include_session: bool,
    pub include_user: bool,
    pub include_global: bool,
    pub recency_half_life_ms: i64,
}

impl RecallOptions {
    pub fn new(session_key: &str, user_id: &str, agent_id: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            max_cards: 8,
            candidate_limit: 128,
            min_score: 0.05,
            cache_ttl_ms: 45_000,
            now: now_ms(),
            include_session: true,
            include_user: true,
            include_global: true,
            recency_half_life_ms: 7 * DAY_MS,
        }
    }
}

/// Detected query intent; shifts the lexical/vector/recency blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryIntent {
    General,
    Task,
    Preference,
    Identity,
}

pub struct Retriever {
    store: Arc<Store>,
    embedder: Arc<Embedder>,
}

impl Retriever {
    pub fn new(store: Arc<Store>, embedder: Arc<Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Recall memory cards for `query` under the scope triple in `opts`.
    pub fn recall(&self, query: &str, opts: &RecallOptions) -> Result<Vec<MemoryCard>> {
        let cache_key = self.cache_key(query, opts);
        if let Some(json) = self.store.cache_get(&cache_key) {
            match serde_json::from_str::<Vec<MemoryCard>>(&json) {
                Ok(cards) => {
                    debug!(query, cards = cards.len(), "recall cache hit");
                    return Ok(cards);
                }
                Err(e) => warn!(error = %e, "recall cache entry unreadable; recomputing"),
            }
        }

        let candidates = self.store.load_candidates(
            &opts.session_key,
            &opts.user_id,
            &opts.agent_id,
            opts.include_session,
            opts.include_user,
            opts.include_global,
            opts.now,
            opts.candidate_limit,
        )?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query_tokens = dedupe_tokens(&tokenize(query));
        let lexical_ranking = self.lexical_ranking(&query_tokens, query, &candidates, opts);
        let query_vec = self.embedder.embed(query);
        let intent = detect_intent(query);

        let mut scored: Vec<ScoredCandidate> = Vec::with_capacity(candidates.len());
        for item in &candidates {
            let item_vec = self.item_vector(item)?;

            let lexical = lexical_ranking
                .iter()
                .position(|id| *id == item.id)
                .map(|idx| 1.0 - (idx as f64 + 1.0) / (lexical_ranking.len() as f64 + 1.0))
                .unwrap_or(0.0);
            let vector = f64::from((cosine(&query_vec, &item_vec) + 1.0) / 2.0);
            let dt = (opts.now - item.last_seen_at).max(0) as f64;
            let recency =
                (-std::f64::consts::LN_2 * dt / opts.recency_half_life_ms as f64).exp();

            let (w_lex, w_vec, w_rec) = intent_weights(intent);
            let mut base = w_lex * lexical + w_vec * vector + w_rec * recency;
            base += kind_bonus(intent, item.kind);
            if item.weight > 0.0 {
                base *= (0.9 + 0.1 * item.weight).min(1.5);
            }

            let item_tokens = dedupe_tokens(&tokenize(&item.content));
            let mut rerank = base + 0.20 * jaccard(&query_tokens, &item_tokens);
            let q = query.trim().to_lowercase();
            if !q.is_empty() && item.content.to_lowercase().contains(&q) {
                rerank += 0.08;
            }
            rerank += kind_tiebreak(item.kind);

            scored.push(ScoredCandidate {
                item: item.clone(),
                base,
                rerank,
                recency,
            });
        }

        scored.retain(|s| s.base >= opts.min_score);
        scored.sort_by(|a, b| {
            b.rerank
                .partial_cmp(&a.rerank)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.base.partial_cmp(&a.base).unwrap_or(std::cmp::Ordering::Equal))
                .then(
                    b.recency
                        .partial_cmp(&a.recency)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let cards: Vec<MemoryCard> = scored
            .into_iter()
            .take(opts.max_cards)
            .filter(|s| policy::should_recall(s.base, s.item.confidence))
            .map(|s| MemoryCard {
                id: s.item.id,
                kind: s.item.kind,
                content: s.item.content,
                score: s.base,
                confidence: s.item.confidence,
                recency: s.recency,
                source: s.item.metadata["extractor"]
                    .as_str()
                    .unwrap_or("consolidator")
                    .to_string(),
            })
            .collect();

        match serde_json::to_string(&cards) {
            Ok(json) => {
                if let Err(e) = self.store.cache_put(&cache_key, &json, opts.cache_ttl_ms) {
                    warn!(error = %e, "recall cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "recall result not cacheable"),
        }
        Ok(cards)
    }

    /// FTS ranking, or a substring-hit count ranking when FTS is unusable
    /// (no indexable tokens, engine error, or an empty result).
    fn lexical_ranking(
        &self,
        query_tokens: &[String],
        query: &str,
        candidates: &[MemoryItem],
        opts: &RecallOptions,
    ) -> Vec<i64> {
        if !query_tokens.is_empty() {
            let expr = query_tokens
                .iter()
                .map(|t| format!("\"{t}\""))
                .collect::<Vec<_>>()
                .join(" OR ");
            match self.store.search_items_fts(
                &expr,
                &opts.user_id,
                &opts.agent_id,
                opts.now,
                opts.candidate_limit,
            ) {
                Ok(ids) if !ids.is_empty() => return ids,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "fts query failed; falling back to linear ranking"),
            }
        }

        // Linear fallback: count substring hits of query tokens (or of the
        // whole query when tokenization came up empty).
        let needles: Vec<String> = if query_tokens.is_empty() {
            vec![query.trim().to_lowercase()]
        } else {
            query_tokens.to_vec()
        };
        let mut hits: Vec<(i64, usize)> = candidates
            .iter()
            .map(|item| {
                let content = item.content.to_lowercase();
                let count = needles.iter().filter(|n| content.contains(n.as_str())).count();
                (item.id, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1));
        hits.into_iter().map(|(id, _)| id).collect()
    }

    /// Stored vector for the item, embedding and persisting on miss or on
    /// model-id mismatch. The upsert is idempotent, so concurrent readers
    /// racing here are harmless.
    fn item_vector(&self, item: &MemoryItem) -> Result<Vec<f32>> {
        if let Some((model, vector)) = self.store.get_embedding(item.id)? {
            if model == self.embedder.model_id() {
                return Ok(vector);
            }
        }
        let vector = self.embedder.embed(&item.content);
        self.store
            .upsert_embedding(item.id, self.embedder.model_id(), &vector)?;
        Ok(vector)
    }

    fn cache_key(&self, query: &str, opts: &RecallOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.trim().to_lowercase().as_bytes());
        hasher.update(
            format!(
                "|{}|{}|{}|{}{}{}|{}|{}|{:.3}|{}",
                opts.session_key,
                opts.user_id,
                opts.agent_id,
                opts.include_session as u8,
                opts.include_user as u8,
                opts.include_global as u8,
                opts.max_cards,
                opts.candidate_limit,
                opts.min_score,
                self.embedder.model_id(),
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

struct ScoredCandidate {
    item: MemoryItem,
    base: f64,
    rerank: f64,
    recency: f64,
}

fn detect_intent(query: &str) -> QueryIntent {
    let q = query.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| q.contains(w));
    if has(&["who am i", "my name", "call me", "timezone", "identity", "style", "tone"]) {
        QueryIntent::Identity
    } else if has(&["todo", "task", "deadline", "remind", "due", "finish", "working on"]) {
        QueryIntent::Task
    } else if has(&["prefer", "like", "love", "favorite", "favourite", "enjoy", "hate"]) {
        QueryIntent::Preference
    } else {
        QueryIntent::General
    }
}

fn intent_weights(intent: QueryIntent) -> (f64, f64, f64) {
    match intent {
        QueryIntent::General => (0.45, 0.45, 0.10),
        QueryIntent::Task => (0.40, 0.35, 0.25),
        QueryIntent::Preference => (0.38, 0.42, 0.20),
        QueryIntent::Identity => (0.48, 0.42, 0.10),
    }
}

fn kind_bonus(intent: QueryIntent, kind: MemoryKind) -> f64 {
    match (intent, kind) {
        (QueryIntent::Task, MemoryKind::TaskState) => 0.18,
        (QueryIntent::Preference, MemoryKind::UserPreference) => 0.18,
        (QueryIntent::Identity, MemoryKind::SemanticFact | MemoryKind::Procedural) => 0.14,
        _ => 0.0,
    }
}

/// Deterministic epsilon so equal scores order stably by kind.
fn kind_tiebreak(kind: MemoryKind) -> f64 {
    match kind {
        MemoryKind::UserPreference => 0.005,
        MemoryKind::SemanticFact => 0.004,
        MemoryKind::TaskState => 0.003,
        MemoryKind::Procedural => 0.002,
        MemoryKind::EpisodicSummary => 0.001,
    }
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    inter / union
}

fn dedupe_tokens(tokens: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens
        .iter()
        .filter(|t| seen.insert(t.as_str().to_string()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedModel;
    use crate::store::ItemUpsert;
    use crate::types::ScopeType;

    fn fixture() -> (Arc<Store>, Retriever) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let embedder = Arc::new(Embedder::new(EmbedModel::GramV1));
        let retriever = Retriever::new(Arc::clone(&store), embedder);
        (store, retriever)
    }

    fn seed(store: &Store, kind: MemoryKind, key: &str, content: &str) -> i64 {
        let (id, _) = store
            .upsert_memory_item(&ItemUpsert {
                user_id: "u1".into(),
                agent_id: "valet".into(),
                kind,
                scope_type: ScopeType::User,
                scope_id: "u1".into(),
                key: key.into(),
                content: content.into(),
                confidence: 0.7,
                expires_at: 0,
                source_event_id: String::new(),
                metadata: serde_json::Value::Null,
            })
            .unwrap();
        id
    }

    #[test]
    fn preference_query_recalls_preference_first() {
        let (store, retriever) = fixture();
        seed(&store, MemoryKind::UserPreference, "pref:c", "prefers dark roast coffee");
        seed(&store, MemoryKind::SemanticFact, "fact:t", "the train leaves at nine");

        let opts = RecallOptions::new("discord:456", "u1", "valet");
        let cards = retriever.recall("What coffee do I like?", &opts).unwrap();
        assert!(!cards.is_empty());
        assert!(cards[0].content.contains("dark roast"));
        assert_eq!(cards[0].kind, MemoryKind::UserPreference);
    }

    #[test]
    fn special_character_queries_still_match() {
        let (store, retriever) = fixture();
        seed(&store, MemoryKind::SemanticFact, "fact:g", "uses a pre-infusion step on the gaggia");
        seed(&store, MemoryKind::SemanticFact, "fact:l", "writes c++ at work");

        let opts = RecallOptions::new("cli:1", "u1", "valet");
        for query in ["pre-infusion", "c++", "what's the pre-infusion step"] {
            let cards = retriever.recall(query, &opts).unwrap();
            assert!(!cards.is_empty(), "query {query:?} should recall something");
        }
    }

    #[test]
    fn cache_returns_identical_results() {
        let (store, retriever) = fixture();
        seed(&store, MemoryKind::UserPreference, "pref:t", "prefers oolong tea");

        let opts = RecallOptions::new("cli:2", "u1", "valet");
        let first = retriever.recall("what tea do I like", &opts).unwrap();
        let second = retriever.recall("what tea do I like", &opts).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn expired_items_never_surface() {
        let (store, retriever) = fixture();
        let mut up = ItemUpsert {
            user_id: "u1".into(),
            agent_id: "valet".into(),
            kind: MemoryKind::EpisodicSummary,
            scope_type: ScopeType::User,
            scope_id: "u1".into(),
            key: "ep:old".into(),
            content: "talked about ancient espresso lore".into(),
            confidence: 0.9,
            expires_at: 1,
            source_event_id: String::new(),
            metadata: serde_json::Value::Null,
        };
        store.upsert_memory_item(&up).unwrap();
        up.key = "ep:live".into();
        up.content = "talked about espresso brewing today".into();
        up.expires_at = 0;
        store.upsert_memory_item(&up).unwrap();

        let opts = RecallOptions::new("cli:3", "u1", "valet");
        let cards = retriever.recall("espresso", &opts).unwrap();
        assert!(cards.iter().all(|c| !c.content.contains("ancient")));
    }

    #[test]
    fn scope_flags_partition_results() {
        let (store, retriever) = fixture();
        let (id, _) = store
            .upsert_memory_item(&ItemUpsert {
                user_id: "u1".into(),
                agent_id: "valet".into(),
                kind: MemoryKind::EpisodicSummary,
                scope_type: ScopeType::Session,
                scope_id: "discord:one".into(),
                key: "ep:s".into(),
                content: "session-scoped espresso chat".into(),
                confidence: 0.8,
                expires_at: 0,
                source_event_id: String::new(),
                metadata: serde_json::Value::Null,
            })
            .unwrap();
        let _ = id;

        // A different session with session-only scope sees nothing.
        let mut opts = RecallOptions::new("discord:two", "u1", "valet");
        opts.include_user = false;
        opts.include_global = false;
        assert!(retriever.recall("espresso", &opts).unwrap().is_empty());

        let opts = RecallOptions::new("discord:one", "u1", "valet");
        assert!(!retriever.recall("espresso", &opts).unwrap().is_empty());
    }
}
