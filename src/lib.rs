//! # llm_taskq
//!
//! Durable LLM task queue with provider fallback, fact sanitizing and
//! local-model offload.
//!
//! ## Architecture
//!
//! ```text
//!   producers ──add──▶ ┌────────────┐ ◀──claim── QueueWorker ──▶ ProviderRouter ──▶ Gemini / Ollama
//!                      │  JobStore  │                 │
//!   operators ─review─▶│  (SQLite)  │ ◀──claim── OffloadScheduler ──▶ llama-server
//!                      └────────────┘                 │
//!            RetirementSweeper ──retire stale──▶      ▼
//!                                              Sanitizer ──audit──▶ JobStore
//! ```
//!
//! ## Task Flow
//! 1. A producer adds a `pending` task
//! 2. A worker claims it atomically (`started`, attempts unchanged)
//! 3. The router walks its provider chain until a response passes the quality bar
//! 4. The sanitizer corrects numeric claims against canonical facts
//! 5. The task ends `completed`, `flagged` for review, requeued, or `failed`
//!
//! ## Modules
//! - `store`: task persistence and audit trails
//! - `executor`: queue worker, action dispatch and retry policy
//! - `router` / `llm`: provider chain and provider clients
//! - `sanitizer`: canonical fact extraction and correction
//! - `offload`: local model selection, inference and retention
//! - `sweeper`: recovery of tasks stuck in `started`
//! - `review` / `alerts`: operator actions and threshold checks

pub mod alerts;
pub mod config;
pub mod executor;
pub mod llm;
pub mod offload;
pub mod review;
pub mod router;
pub mod sanitizer;
pub mod store;
pub mod sweeper;
pub mod util;

pub use config::Config;
pub use store::{JobStore, SqliteJobStore};
