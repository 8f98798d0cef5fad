//! Shared protocol types for Stevedore.
//!
//! Canonical enums, the error taxonomy, request hashing and derived-metric
//! helpers used across the request path, the worker and the stores. Keep
//! definitions here CANONICAL - other crates re-export, they do not redefine.

pub mod defaults;
pub mod error;
pub mod filters;
pub mod idempotency;
pub mod metrics;
pub mod naming;
pub mod records;
pub mod types;

pub use error::{sanitize_value, ErrorCode, TransferError, TransferResult};
pub use filters::{DateRange, FilterValue, Filters};
pub use idempotency::request_hash;
pub use metrics::JobMetrics;
pub use naming::{artifact_key, broker_key, error_report_key};
pub use records::{ArticleRecord, CommentRecord, NormalizedRecord, UserRecord};
pub use types::{
    ErrorSummary, ExportFormat, JobKind, JobStatus, ReportStatus, ResourceKind, SourceType,
};
