//! # Citeloom: provenance-tracking ingestion and cited retrieval
//!
//! Citeloom ingests URLs (web pages, PDFs, YouTube videos), screens them for
//! quality, transforms them into normalized text with extracted entities and
//! relations, stores them across four backends (relational metadata, blob,
//! vector index, property graph), and answers queries with byte-precise
//! citations back to the source material.
//!
//! ## Core pieces
//!
//! - **Jobs**: async submission with priority queueing, retry with jittered
//!   backoff, cooperative cancellation, and real-time progress streaming
//! - **Pipeline**: Extract → Screen → Transform → Chunk+Embed → Store →
//!   Provenance, idempotent per stage thanks to deterministic IDs
//! - **Provenance**: cross-store writes without a two-phase commit; the
//!   graph node is the commit marker, and a sweep reconciles orphans
//! - **Retrieval**: filtered vector search with deterministic ordering and a
//!   citation resolver that validates every `[k]` the model emits
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use citeloom::config::EngineConfig;
//! use citeloom::engine::Engine;
//! use citeloom::jobs::JobOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder(EngineConfig::default()).start().await?;
//! let receipt = engine
//!     .manager()
//!     .submit("https://example.com/article", 5, JobOptions::default())
//!     .await?;
//! println!("queued {}", receipt.job_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`ids`] - URL normalization and deterministic ID derivation
//! - [`model`] - Documents, chunks, mentions, entities, relations, exports
//! - [`jobs`] - Job manager, priority queue, status store, worker pool
//! - [`pipeline`] - Stage orchestration and chunking
//! - [`progress`] - Per-job event fan-out with heartbeats
//! - [`stores`] - The four backend seams plus in-memory and SQLite impls
//! - [`provenance`] - Cross-backend writer/readers and the orphan sweep
//! - [`retrieval`] - Filtered vector search
//! - [`citations`] - Citation tables, prompt assembly, answer validation
//! - [`server`] - HTTP API with SSE progress streaming

pub mod citations;
pub mod config;
pub mod engine;
pub mod errors;
pub mod extract;
pub mod ids;
pub mod jobs;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod provenance;
pub mod retrieval;
pub mod screening;
pub mod server;
pub mod stores;
pub mod telemetry;
pub mod transform;
