//! statflow - aggregation engine over paginated, schema-variable CRM data
//!
//! Pipeline:
//!
//! ```text
//! FieldDiscovery ──► BatchFetcher / CrossEntityJoin ──► Aggregator ──► CacheManager
//!                                                                  └──► SnapshotStore (summaries)
//! ```
//!
//! [`report::ReportService`] drives the pipeline for each report and is the
//! crate's main entry point.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod fetch;
pub mod join;
pub mod report;
pub mod snapshot;
pub mod source;

pub use aggregate::{age_bracket, AggregationResult, Aggregator, CrossTab, Dimension, DimensionSpec, KeyCount};
pub use cache::{CacheHit, CacheManager, RefreshCoalescer};
pub use config::{ConfigError, EngineConfig, EntityNames, SnapshotBackendKind};
pub use discovery::{FieldDiscovery, FieldRole, ResolvedField};
pub use fetch::{BatchFetcher, Completion, FetchLimits, RecordBatch};
pub use join::{CrossEntityJoin, JoinReport, JoinSpec, JoinTier};
pub use report::{CachedResponse, ReportError, ReportService};
pub use snapshot::{JsonFileBackend, SeriesPoint, Snapshot, SnapshotBackend, SnapshotStore, SqliteSnapshotBackend};
pub use source::{MemorySource, Query, Record, RemoteSource, RestSource, SourceError};
