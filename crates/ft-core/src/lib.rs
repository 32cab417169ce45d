//! Flake Triage analysis core.
//!
//! This library provides the changepoint analysis engine for test
//! verdicts:
//! - Verdict and segment models with additive count taxonomies
//! - A two-tier input buffer with compaction and eviction
//! - Bayesian changepoint detection over verdict histories
//! - The batch ingestion pipeline with filtering, checkpointing, and
//!   optimistic-concurrency commits
//! - Branch state persistence and reporting row export

pub mod branch;
pub mod config;
pub mod detector;
pub mod export;
pub mod ingest;
pub mod inputbuffer;
pub mod metrics;
pub mod retention;
pub mod segment;
pub mod statistics;
pub mod store;
pub mod verdict;

pub use branch::{BranchRecord, Entry};
pub use config::AnalysisConfig;
pub use detector::{BayesianChangepointDetector, ChangepointDetector, DetectorConfig};
pub use export::{Exporter, RecordingSink, RowSink};
pub use ingest::{IngestionPipeline, IngestionTask};
pub use metrics::{InMemoryMetrics, MetricSink, NullSink};
pub use store::{AnalysisStore, MemoryStore};
