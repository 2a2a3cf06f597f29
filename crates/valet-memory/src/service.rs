//! Memory service: the orchestrator behind a small, stable API.
//!
//! One service owns the store, the extraction/recall machinery, and a single
//! background worker task that drains the job queue. Channel adapters call
//! `append_event` / `build_prompt_context` / `schedule_turn_maintenance`
//! around each turn; everything else happens behind the queue.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use valet_core::config::MemoryConfig;

use crate::compact::{CompactOutcome, Compactor, Summarizer};
use crate::consolidate::{self, Consolidator};
use crate::embed::{EmbedModel, Embedder};
use crate::error::{MemoryError, Result};
use crate::retrieve::{RecallOptions, Retriever};
use crate::store::Store;
use crate::types::{
    now_ms, ContextBudget, Event, Job, JobType, MemoryCard, PromptContext, Session,
    SessionSnapshot,
};

/// Ring-buffer cap per session.
const RING_CAP: usize = 128;
/// Events loaded from the store for history assembly.
const HISTORY_LOAD: usize = 96;
/// Retention sweep cadence.
const SWEEP_INTERVAL_MS: i64 = 6 * 60 * 60 * 1000;
/// Minimum memory-section budget; thread is shaved to honor it.
const MEMORY_FLOOR_TOKENS: usize = 512;

/// Hook invoked by the persona_apply job handler. The persona subsystem
/// itself lives outside this crate.
#[async_trait]
pub trait PersonaHook: Send + Sync {
    async fn apply(&self, session_key: &str, user_id: &str)
        -> std::result::Result<(), String>;
}

/// Everything `MemoryService::open` needs beyond the database path.
pub struct ServiceOptions {
    pub config: MemoryConfig,
    pub agent_id: String,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub persona_hook: Option<Arc<dyn PersonaHook>>,
}

impl ServiceOptions {
    pub fn new(config: MemoryConfig, agent_id: &str) -> Self {
        Self {
            config,
            agent_id: agent_id.to_string(),
            summarizer: None,
            persona_hook: None,
        }
    }
}

pub struct MemoryService {
    store: Arc<Store>,
    retriever: Retriever,
    consolidator: Consolidator,
    compactor: Compactor,
    config: MemoryConfig,
    agent_id: String,
    summarizer: Option<Arc<dyn Summarizer>>,
    persona_hook: Option<Arc<dyn PersonaHook>>,
    /// Warm per-session cache of recent events; also the read fallback when
    /// the store is temporarily unavailable.
    ring: DashMap<String, VecDeque<Event>>,
    shutdown_tx: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    last_sweep: AtomicI64,
    closed: AtomicBool,
}

impl MemoryService {
    /// Open the store and start the worker. Fails only on store wiring;
    /// the caller is expected to abort startup in that case.
    pub fn open(db_path: &Path, opts: ServiceOptions) -> Result<Arc<Self>> {
        let store = Arc::new(Store::open(db_path)?);
        Self::start(store, opts)
    }

    /// Same as `open` but over an already-built store (tests use the
    /// in-memory variant here).
    pub fn start(store: Arc<Store>, opts: ServiceOptions) -> Result<Arc<Self>> {
        let embedder = Arc::new(Embedder::new(EmbedModel::from_id(&opts.config.embed_model)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let service = Arc::new(Self {
            retriever: Retriever::new(Arc::clone(&store), Arc::clone(&embedder)),
            consolidator: Consolidator::new(
                Arc::clone(&store),
                Arc::clone(&embedder),
                &opts.agent_id,
            ),
            compactor: Compactor::new(Arc::clone(&store)),
            store,
            config: opts.config,
            agent_id: opts.agent_id,
            summarizer: opts.summarizer,
            persona_hook: opts.persona_hook,
            ring: DashMap::new(),
            shutdown_tx,
            worker: StdMutex::new(None),
            last_sweep: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(worker_loop(Arc::clone(&service), shutdown_rx));
        *service.worker.lock().unwrap() = Some(handle);
        info!(agent_id = %service.agent_id, "memory service started");
        Ok(service)
    }

    /// Direct store access for admin surfaces and tests.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ensure_session(
        &self,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Session> {
        self.check_open()?;
        self.store.ensure_session(session_key, channel, chat_id, user_id)
    }

    pub fn list_sessions_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Session>> {
        self.check_open()?;
        self.store.list_sessions_for_user(user_id, limit)
    }

    /// Normalize missing ids/timestamp, append to the log, and mirror into
    /// the ring buffer. Returns the normalized event.
    pub fn append_event(&self, event: Event) -> Result<Event> {
        self.check_open()?;
        let event = normalize_event(event);
        self.store.append_event(&event)?;
        self.ring_push(&event);
        Ok(event)
    }

    /// Immediate capture: extract durable memories from the incoming user
    /// message and commit them with the event in one transaction. Facts are
    /// cross-session visible before background consolidation runs.
    pub fn record_user_turn(&self, event: Event, user_id: &str) -> Result<(Event, usize)> {
        self.check_open()?;
        let event = normalize_event(event);

        let ops = consolidate::extract_user_ops(&event.content);
        let upserts: Vec<_> = ops
            .iter()
            .filter(|op| consolidate::accept_op(op))
            .map(|op| {
                consolidate::to_item_upsert(
                    op,
                    &event.session_key,
                    user_id,
                    &self.agent_id,
                    &event.id,
                )
            })
            .collect();

        let inserted = self.store.append_event_and_upsert_items(&event, &upserts)?;
        self.ring_push(&event);
        debug!(
            session = %event.session_key,
            inserted,
            "user turn recorded with immediate capture"
        );
        Ok((event, inserted))
    }

    /// Assemble prompt context under a token budget. Fail-closed: a session
    /// with prior turns but no continuity artifacts at all yields
    /// `MemoryError::ContinuityUnavailable` instead of a best-effort answer.
    pub fn build_prompt_context(
        &self,
        session_key: &str,
        user_id: &str,
        query: &str,
        max_tokens: usize,
    ) -> Result<PromptContext> {
        self.check_open()?;
        let max_tokens = if max_tokens == 0 {
            self.config.max_context_tokens
        } else {
            max_tokens
        };
        let mut budget = derive_budget(max_tokens);

        let session = self.store.get_session(session_key)?;
        let prior_turns = session.as_ref().map(|s| s.message_count).unwrap_or(0) > 0;
        let summary = session.map(|s| s.summary).unwrap_or_default();
        let snapshot = self.store.get_latest_snapshot(session_key)?;

        let recent = match self.store.list_recent_events(session_key, HISTORY_LOAD) {
            Ok(events) => self.merge_with_ring(session_key, events),
            Err(e) => {
                warn!(error = %e, "store read failed; serving history from ring buffer");
                self.ring_snapshot(session_key)
            }
        };

        let mut recall_opts =
            RecallOptions::new(session_key, user_id, &self.agent_id);
        recall_opts.cache_ttl_ms = self.config.recall_cache_ttl_secs * 1000;
        let recall_cards = self.retriever.recall(query, &recall_opts)?;

        // Adaptive budget shifts, applied once the artifacts are known.
        if recent.len() > 40 {
            budget.thread_tokens += 256;
        }
        if has_continuation_cue(query) {
            budget.thread_tokens += 384;
        }
        if summary.is_empty() {
            budget.thread_tokens += budget.summary_tokens;
            budget.summary_tokens = 0;
        }
        if recall_cards.is_empty() {
            budget.thread_tokens += budget.memory_tokens;
            budget.memory_tokens = 0;
        }

        let history = fit_history(&recent, budget.thread_tokens);
        let recall_prompt = render_recall_prompt(&summary, snapshot.as_ref(), &recall_cards);

        let has_artifacts =
            !history.is_empty() || !summary.is_empty() || !recall_cards.is_empty();
        if (prior_turns || has_continuation_cue(query)) && !has_artifacts {
            return Err(MemoryError::ContinuityUnavailable);
        }

        Ok(PromptContext {
            history,
            summary,
            persona_prompt: String::new(),
            recall_cards,
            recall_prompt,
            budget,
            continuity: has_artifacts,
        })
    }

    /// Enqueue the three idempotent per-turn jobs. Scheduling the same turn
    /// twice is a no-op thanks to deterministic job ids.
    pub fn schedule_turn_maintenance(
        &self,
        session_key: &str,
        turn_id: &str,
        user_id: &str,
    ) -> Result<()> {
        self.check_open()?;
        let now = now_ms();
        let payload = serde_json::json!({ "turn_id": turn_id, "user_id": user_id });
        for (job_type, priority, run_after) in [
            (JobType::Consolidate, 30, now),
            (JobType::PersonaApply, 55, now + 200),
            (JobType::Compact, 80, now + 1000),
        ] {
            let id = crate::store::job_id(job_type, session_key, turn_id);
            self.store
                .enqueue_job(&id, job_type, session_key, priority, &payload, run_after)?;
        }
        Ok(())
    }

    /// Synchronous compaction, for admin actions and tests.
    pub async fn force_compact(
        &self,
        session_key: &str,
        user_id: &str,
        max_tokens: usize,
    ) -> Result<CompactOutcome> {
        self.check_open()?;
        debug!(session_key, user_id, "forced compaction requested");
        let budget = derive_budget(if max_tokens == 0 {
            self.config.max_context_tokens
        } else {
            max_tokens
        });
        self.compactor
            .compact_session(session_key, budget.thread_tokens, self.summarizer.as_deref())
            .await
    }

    /// Idempotent shutdown: signal the worker, join it, release the store.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("memory service closed");
    }

    // --- worker internals --------------------------------------------------

    async fn worker_tick(&self) {
        let now = now_ms();

        let last = self.last_sweep.load(Ordering::Relaxed);
        if now - last >= SWEEP_INTERVAL_MS || last == 0 {
            self.last_sweep.store(now, Ordering::Relaxed);
            let event_cutoff = now - self.config.event_retention_days * 24 * 60 * 60 * 1000;
            let audit_cutoff = now - self.config.audit_retention_days * 24 * 60 * 60 * 1000;
            if let Err(e) = self.store.sweep_retention(event_cutoff, audit_cutoff, 500) {
                error!(error = %e, "retention sweep failed");
            }
        }

        if let Err(e) = self.store.requeue_expired_leases(now) {
            error!(error = %e, "lease requeue failed");
        }

        for _ in 0..self.config.claim_batch {
            let job = match self.store.claim_next_job(now_ms(), self.config.lease_ms) {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "job claim failed");
                    break;
                }
            };
            self.dispatch_job(job).await;
        }
    }

    /// Run one claimed job. A panic inside a handler becomes a failed-job
    /// marker; the worker itself keeps going.
    async fn dispatch_job(&self, job: Job) {
        let job_id = job.id.clone();
        let outcome = std::panic::AssertUnwindSafe(self.run_job(&job))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.store.complete_job(&job_id) {
                    error!(error = %e, job_id = %job_id, "failed to mark job completed");
                }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "job failed");
                let _ = self.store.fail_job(&job_id, &e.to_string());
            }
            Err(_) => {
                error!(job_id = %job_id, "job handler panicked");
                let _ = self.store.fail_job(&job_id, "job handler panicked");
            }
        }
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        let turn_id = job.payload["turn_id"].as_str().unwrap_or_default();
        let user_id = job.payload["user_id"].as_str().unwrap_or_default();
        match job.job_type {
            JobType::Consolidate => {
                self.consolidator
                    .consolidate_turn(&job.session_key, turn_id, user_id)?;
                Ok(())
            }
            JobType::Compact => {
                let budget = derive_budget(self.config.max_context_tokens);
                self.compactor
                    .compact_session(
                        &job.session_key,
                        budget.thread_tokens,
                        self.summarizer.as_deref(),
                    )
                    .await?;
                Ok(())
            }
            JobType::PersonaApply => match &self.persona_hook {
                Some(hook) => hook
                    .apply(&job.session_key, user_id)
                    .await
                    .map_err(MemoryError::Compaction),
                None => Ok(()),
            },
        }
    }

    // --- helpers -----------------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Closed);
        }
        Ok(())
    }

    fn ring_push(&self, event: &Event) {
        let mut buffer = self
            .ring
            .entry(event.session_key.clone())
            .or_insert_with(VecDeque::new);
        buffer.push_back(event.clone());
        while buffer.len() > RING_CAP {
            buffer.pop_front();
        }
    }

    fn ring_snapshot(&self, session_key: &str) -> Vec<Event> {
        self.ring
            .get(session_key)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Store events merged with ring entries, deduped by event id and
    /// ordered by `(created_at, seq)`.
    fn merge_with_ring(&self, session_key: &str, mut events: Vec<Event>) -> Vec<Event> {
        let mut seen: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();
        for event in self.ring_snapshot(session_key) {
            if seen.insert(event.id.clone()) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));
        events
    }
}

async fn worker_loop(service: Arc<MemoryService>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(service.config.worker_poll_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => service.worker_tick().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("memory worker shutting down");
                    break;
                }
            }
        }
    }
}

/// Fixed split of `max_tokens`: 25% system, 45% thread, 10% summary, the
/// remainder memory, with a floor on memory shaved from thread.
pub fn derive_budget(max_tokens: usize) -> ContextBudget {
    let system_tokens = max_tokens * 25 / 100;
    let mut thread_tokens = max_tokens * 45 / 100;
    let summary_tokens = max_tokens * 10 / 100;
    let mut memory_tokens = max_tokens
        .saturating_sub(system_tokens)
        .saturating_sub(thread_tokens)
        .saturating_sub(summary_tokens);
    if memory_tokens < MEMORY_FLOOR_TOKENS {
        let shave = (MEMORY_FLOOR_TOKENS - memory_tokens).min(thread_tokens);
        thread_tokens -= shave;
        memory_tokens += shave;
    }
    ContextBudget {
        system_tokens,
        thread_tokens,
        summary_tokens,
        memory_tokens,
    }
}

fn has_continuation_cue(query: &str) -> bool {
    let q = query.to_lowercase();
    ["already", "earlier", "before", "as i said", "as i mentioned"]
        .iter()
        .any(|cue| q.contains(cue))
}

/// ~2.5 chars per token, floored so empty messages still cost something.
fn approx_message_tokens(text: &str) -> usize {
    (text.chars().count() * 2 / 5).max(8)
}

/// Newest-to-oldest walk until the budget is spent, then restore order.
fn fit_history(events: &[Event], thread_tokens: usize) -> Vec<Event> {
    let mut selected: Vec<Event> = Vec::new();
    let mut spent = 0usize;
    for event in events.iter().rev() {
        let cost = approx_message_tokens(&event.content);
        if spent + cost > thread_tokens {
            break;
        }
        spent += cost;
        selected.push(event.clone());
    }
    selected.reverse();
    selected
}

fn render_recall_prompt(
    summary: &str,
    snapshot: Option<&SessionSnapshot>,
    cards: &[MemoryCard],
) -> String {
    let mut out = String::new();

    if !summary.is_empty() || snapshot.is_some() {
        out.push_str("## Structured Session Snapshot\n");
        if !summary.is_empty() {
            out.push_str(summary);
            out.push('\n');
        }
        if let Some(snap) = snapshot {
            render_list(&mut out, "Facts", &snap.facts);
            render_list(&mut out, "Preferences", &snap.preferences);
            render_list(&mut out, "Tasks", &snap.tasks);
            render_list(&mut out, "Open loops", &snap.open_loops);
            render_list(&mut out, "Constraints", &snap.constraints);
        }
    }

    if !cards.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("## Recalled Memory\n");
        for card in cards {
            out.push_str(&format!(
                "- [{}] {} (score {:.2})\n",
                card.kind, card.content, card.score
            ));
        }
    }
    out
}

fn render_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{title}:\n"));
    for item in items.iter().take(8) {
        out.push_str(&format!("- {item}\n"));
    }
}

/// Fill in event id, turn id, and timestamp when the caller left them empty.
fn normalize_event(mut event: Event) -> Event {
    if event.id.is_empty() {
        event.id = Uuid::now_v7().to_string();
    }
    if event.turn_id.is_empty() {
        event.turn_id = Uuid::new_v4().to_string();
    }
    if event.created_at == 0 {
        event.created_at = now_ms();
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_split_holds_memory_floor() {
        let budget = derive_budget(8192);
        assert_eq!(budget.system_tokens, 2048);
        assert_eq!(budget.thread_tokens, 3686);
        assert_eq!(budget.summary_tokens, 819);
        // 20% remainder is above the floor already.
        assert!(budget.memory_tokens >= MEMORY_FLOOR_TOKENS);

        // A tiny budget shaves thread to protect the memory floor.
        let small = derive_budget(1000);
        assert_eq!(small.memory_tokens, MEMORY_FLOOR_TOKENS);
        assert!(small.thread_tokens < 450);
    }

    #[test]
    fn history_fit_prefers_newest() {
        let mut events = Vec::new();
        for i in 0..10 {
            let mut ev = Event::new("cli:h", crate::types::EventRole::User, &"x".repeat(100));
            ev.id = format!("e{i}");
            ev.created_at = i;
            events.push(ev);
        }
        // Each event costs 40 tokens; a 100-token budget fits two.
        let fitted = fit_history(&events, 100);
        assert_eq!(fitted.len(), 2);
        assert_eq!(fitted[0].id, "e8");
        assert_eq!(fitted[1].id, "e9");
    }

    #[test]
    fn continuation_cues_detected() {
        assert!(has_continuation_cue("as I said, what coffee?"));
        assert!(has_continuation_cue("you already know this"));
        assert!(!has_continuation_cue("what coffee do I like?"));
    }

    #[test]
    fn normalize_fills_missing_fields() {
        let ev = normalize_event(Event::new("cli:n", crate::types::EventRole::User, "hi"));
        assert!(!ev.id.is_empty());
        assert!(!ev.turn_id.is_empty());
        assert!(ev.created_at > 0);
    }
}
