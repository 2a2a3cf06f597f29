//! Long-horizon memory for valet agents.
//!
//! An append-only session event log feeds two consumers: a consolidator
//! that extracts typed long-term memories per turn, and a compactor that
//! condenses long sessions into a rolling summary plus a structured
//! snapshot. Recall blends FTS rank, hashed-vector similarity, and recency.
//! A leased job queue drives the background work; `MemoryService` ties it
//! all together behind a small API.

pub mod compact;
pub mod consolidate;
pub mod db;
pub mod embed;
pub mod error;
pub mod policy;
pub mod retrieve;
pub mod service;
pub mod store;
pub mod types;

pub use compact::{CompactOutcome, Summarizer};
pub use error::MemoryError;
pub use retrieve::{RecallOptions, Retriever};
pub use service::{MemoryService, PersonaHook, ServiceOptions};
pub use store::Store;
pub use types::{
    Event, EventRole, Job, JobStatus, JobType, MemoryCard, MemoryItem, MemoryKind,
    PromptContext, Session, SessionSnapshot,
};
