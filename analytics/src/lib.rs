//! Popmetrics - client-resident gameplay telemetry.
//!
//! This crate is the analytics pipeline embedded in the bubble game: it
//! captures gameplay events, enforces consent and field-level
//! anonymization, batches and durably persists events locally, and
//! exposes query and aggregation primitives to downstream reporting.
//!
//! # Overview
//!
//! Game code talks to a single [`Collector`]. Each `collect_*` call
//! passes the consent gate, is anonymized, and lands in a batching
//! queue that flushes to an indexed on-disk storage engine. Failed
//! batch writes retry with exponential backoff; exhausted batches are
//! dropped and counted. Nothing ever leaves the machine: storage is
//! local, and the only egress is the user-driven `export_data` call.
//!
//! # Privacy
//!
//! Collection happens only after an explicit consent decision, per
//! feature. Payloads are anonymized before persistence: identifiers are
//! one-way hashed, coordinates quantized, timestamps in payloads
//! rounded. Records expire after a retention window and a
//! `delete_all_data` call erases everything including the consent
//! record itself.
//!
//! # Modules
//!
//! - [`collector`]: Pipeline orchestration and the `collect_*` surface
//! - [`config`]: Configuration from environment variables
//! - [`consent`]: Consent gate, features, and the persisted record
//! - [`error`]: Crate-level error type
//! - [`privacy`]: Field-level anonymization rules
//! - [`queue`]: Batching event queue with bounded retry
//! - [`retry`]: Backoff schedule and retry bookkeeping
//! - [`storage`]: Indexed, durable local storage engine
//! - [`types`]: Event envelope and typed collection inputs

pub mod collector;
pub mod config;
pub mod consent;
pub mod error;
pub mod privacy;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod types;

pub use collector::{Collector, SCHEMA_VERSION};
pub use config::{AnalyticsConfig, ConfigError};
pub use consent::{ConsentDecision, ConsentError, ConsentRecord, ConsentUi, Feature};
pub use error::{AnalyticsError, Result};
pub use privacy::{AnonymizeRule, Anonymizer, RuleError};
pub use queue::{BatchSink, EventQueue, EventStats, QueueConfig, QueueError};
pub use retry::{BatchJob, RetryPolicy};
pub use storage::{
    AggregateOp, AggregateQuery, AggregateResult, AggregateRule, BatchReport, KeyRange, KeyValue,
    StorageEngine, StorageError, StorageInfo, StoreSchema,
};
pub use types::{EventType, GameEvent};
