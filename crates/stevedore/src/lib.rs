//! Stevedore service facade.
//!
//! The operations behind the HTTP surface (transport itself lives
//! elsewhere): job creation with idempotency and enqueueing, status reads
//! with sanitized summaries, artifact downloads, intake of uploads and
//! vetted remote URLs, and the worker daemon wiring.

pub mod api;
pub mod config;
pub mod intake;

pub use api::{
    cancel_job, create_export_job, create_import_job, download_error_report, download_export,
    get_export_job, get_import_job, stream_export_query, CreateJobResult, CreateStatus,
    ExportRequest, ImportRequest, ImportSource, JobResponse, ServiceContext,
};
pub use config::Config;
