use serde::{Deserialize, Serialize};

/// Who produced an event. Tool results carry `tool_call_id`/`tool_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventRole {
    User,
    Assistant,
    Tool,
    System,
}

impl std::fmt::Display for EventRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for EventRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            other => Err(format!("unknown event role: {other}")),
        }
    }
}

/// One entry in the append-only session log. Events are never mutated;
/// `archived` flips at most once, false to true, during compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_key: String,
    /// Groups the events of one conversational turn.
    pub turn_id: String,
    /// Orders events within a turn.
    pub seq: i64,
    pub role: EventRole,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub metadata: serde_json::Value,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub archived: bool,
}

impl Event {
    /// Minimal constructor; ids and timestamp are normalized on append.
    pub fn new(session_key: &str, role: EventRole, content: &str) -> Self {
        Self {
            id: String::new(),
            session_key: session_key.to_string(),
            turn_id: String::new(),
            seq: 0,
            role,
            content: content.to_string(),
            tool_call_id: None,
            tool_name: None,
            metadata: serde_json::Value::Null,
            created_at: 0,
            archived: false,
        }
    }
}

/// A conversation thread, keyed `"<channel>:<chat_id>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
    /// Rolling compaction output. Empty until the first compaction.
    pub summary: String,
    pub last_consolidated_at: i64,
}

/// What kind of long-term memory an item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    SemanticFact,
    UserPreference,
    EpisodicSummary,
    TaskState,
    Procedural,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SemanticFact => "semantic_fact",
            Self::UserPreference => "user_preference",
            Self::EpisodicSummary => "episodic_summary",
            Self::TaskState => "task_state",
            Self::Procedural => "procedural",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic_fact" => Ok(Self::SemanticFact),
            "user_preference" => Ok(Self::UserPreference),
            "episodic_summary" => Ok(Self::EpisodicSummary),
            "task_state" => Ok(Self::TaskState),
            "procedural" => Ok(Self::Procedural),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

/// Visibility scope of a memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Session,
    User,
    Global,
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::User => write!(f, "user"),
            Self::Global => write!(f, "global"),
        }
    }
}

impl std::str::FromStr for ScopeType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "user" => Ok(Self::User),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown scope type: {other}")),
        }
    }
}

/// A consolidated long-term fact. `(user_id, agent_id, kind, key)` is unique
/// among live rows, so re-capturing a known fact updates it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: i64,
    pub user_id: String,
    pub agent_id: String,
    pub kind: MemoryKind,
    pub scope_type: ScopeType,
    /// session_key, user_id, or empty depending on `scope_type`.
    pub scope_id: String,
    pub key: String,
    pub content: String,
    /// 0.0-1.0.
    pub confidence: f64,
    pub weight: f64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    /// Epoch ms; 0 means never expires.
    pub expires_at: i64,
    /// Epoch ms; 0 means live. Tombstoned items are invisible to recall.
    pub deleted_at: i64,
    pub source_event_id: String,
    pub metadata: serde_json::Value,
}

/// Co-occurrence edge between two items, unique on `(from, to, relation)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub from_item_id: i64,
    pub to_item_id: i64,
    pub relation: String,
    pub weight: f64,
}

/// One recalled memory, scored and ready for prompt rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCard {
    pub id: i64,
    pub kind: MemoryKind,
    pub content: String,
    pub score: f64,
    pub confidence: f64,
    pub recency: f64,
    pub source: String,
}

/// Structured compaction artifact. Older revisions are retained for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_key: String,
    pub revision: i64,
    pub created_at: i64,
    pub facts: Vec<String>,
    pub preferences: Vec<String>,
    pub tasks: Vec<String>,
    pub open_loops: Vec<String>,
    pub constraints: Vec<String>,
    pub summary: String,
    pub compaction_id: String,
}

/// Compaction lifecycle. Transitions only move forward, or to Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    Started,
    SummaryReady,
    Archived,
    Completed,
    Failed,
}

impl std::fmt::Display for CompactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::SummaryReady => "summary_ready",
            Self::Archived => "archived",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CompactionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "summary_ready" => Ok(Self::SummaryReady),
            "archived" => Ok(Self::Archived),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown compaction status: {other}")),
        }
    }
}

/// State-machine record for one compaction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compaction {
    pub id: String,
    pub session_key: String,
    pub started_at: i64,
    pub completed_at: i64,
    pub status: CompactionStatus,
    pub source_event_count: i64,
    pub retained_event_count: i64,
    pub summary: String,
    /// Phase/count/strategy breadcrumbs, kept on failure for diagnostics.
    pub checkpoint: serde_json::Value,
    pub error: String,
}

/// Background work variants handled by the memory worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Consolidate,
    Compact,
    PersonaApply,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Consolidate => "consolidate",
            Self::Compact => "compact",
            Self::PersonaApply => "persona_apply",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consolidate" => Ok(Self::Consolidate),
            "compact" => Ok(Self::Compact),
            "persona_apply" => Ok(Self::PersonaApply),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A leased background job. The id is deterministic over
/// `(job_type, session_key, turn_id)` so repeated schedules collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub session_key: String,
    pub status: JobStatus,
    /// Lower runs first.
    pub priority: i64,
    pub payload: serde_json::Value,
    pub error: String,
    /// Not eligible before this instant (epoch ms).
    pub run_after: i64,
    /// While running, the claim expires at this instant (epoch ms).
    pub lease_until: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: i64,
}

/// Token allocation for one assembled prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub system_tokens: usize,
    pub thread_tokens: usize,
    pub summary_tokens: usize,
    pub memory_tokens: usize,
}

/// Everything the channel layer needs to drive one LLM turn.
#[derive(Debug, Clone)]
pub struct PromptContext {
    /// Oldest-first window of recent events, fitted to the thread budget.
    pub history: Vec<Event>,
    pub summary: String,
    pub persona_prompt: String,
    pub recall_cards: Vec<MemoryCard>,
    /// Rendered "Structured Session Snapshot" + "Recalled Memory" blocks.
    pub recall_prompt: String,
    pub budget: ContextBudget,
    /// True when at least one continuity artifact is present.
    pub continuity: bool,
}

/// Current epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for kind in [
            MemoryKind::SemanticFact,
            MemoryKind::UserPreference,
            MemoryKind::EpisodicSummary,
            MemoryKind::TaskState,
            MemoryKind::Procedural,
        ] {
            assert_eq!(kind.to_string().parse::<MemoryKind>().unwrap(), kind);
        }
        for status in [
            CompactionStatus::Started,
            CompactionStatus::SummaryReady,
            CompactionStatus::Archived,
            CompactionStatus::Completed,
            CompactionStatus::Failed,
        ] {
            assert_eq!(
                status.to_string().parse::<CompactionStatus>().unwrap(),
                status
            );
        }
        assert_eq!("tool".parse::<EventRole>().unwrap(), EventRole::Tool);
        assert!("elder_wisdom".parse::<MemoryKind>().is_err());
    }
}
