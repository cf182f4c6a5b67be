//! Core engine for triage: aggregation, deduplication, scheduling and fixes.
//!
//! [`DiagnosticsEngine`] is the single entry point. It owns the aggregation
//! cache, the backend session manager and the realtime scheduler, and is
//! constructed once per workspace.

#![allow(clippy::missing_errors_doc)]

mod aggregate;
mod cache;
pub mod config;
mod dedup;
mod engine;
mod error;
mod fix;
mod scheduler;
mod subscribe;
mod workspace;

pub use aggregate::Aggregator;
pub use cache::{AggregationCache, CacheStats};
pub use config::{ConfigError, TriageConfig, WORKSPACE_CONFIG};
pub use dedup::{Deduplicator, SourceOutput, normalize_message, similarity};
pub use engine::{
    DiagnosticsEngine, EngineBuilder, HealthReport, RefreshScope, SourceInfo, TrendPoint,
};
pub use error::{CacheError, FixError, QueryError};
pub use fix::{FixPreview, FixResolver, FixResult, apply_edits};
pub use scheduler::{FileState, PassFut, PassRunner, Scheduler};
pub use subscribe::{Callback, SubscriberStats, SubscriptionHandle, Subscriptions};
pub use workspace::{FileContent, FsWorkspace, MemoryWorkspace, Workspace};

pub use triage_sources as sources;
pub use triage_types as types;
