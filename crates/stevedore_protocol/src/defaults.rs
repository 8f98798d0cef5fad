//! Canonical default values shared across the request path and the worker.

/// Records per upsert batch and per export page.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Hard cap on records per import file and per async export artifact.
pub const DEFAULT_MAX_RECORDS: usize = 1_000_000;
/// Upper bound for the synchronous streaming-export `limit` parameter.
pub const DEFAULT_STREAM_MAX_LIMIT: usize = 1000;
/// Upload / remote-fetch size cap: 1 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;
/// Concurrent job runs per worker process.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
/// Records between cancellation polls; 0 disables polling.
pub const DEFAULT_CANCEL_CHECK_INTERVAL: usize = 500;
/// Hours an export artifact stays downloadable.
pub const DEFAULT_FILE_RETENTION_HOURS: i64 = 24;

/// Buffered import errors flushed to the journal at this count.
pub const ERROR_FLUSH_THRESHOLD: usize = 500;
/// Error-report generation page size (cursor by journal row id).
pub const REPORT_PAGE_SIZE: i64 = 1000;

/// Queue delivery attempts per entry.
pub const QUEUE_MAX_RETRIES: i32 = 3;
/// Fixed backoff between queue retries.
pub const QUEUE_RETRY_BACKOFF_SECS: i64 = 60;
/// Single queue topic for both job kinds.
pub const QUEUE_TOPIC: &str = "data-transfer";

/// Remote fetch hard timeout.
pub const REMOTE_FETCH_TIMEOUT_SECS: u64 = 30;

/// Mime types accepted for uploads and remote content.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/ndjson",
    "application/x-ndjson",
    "application/jsonl",
    "text/plain",
    "text/json",
];

/// Reserved record index for whole-job failures in the error journal.
pub const FATAL_RECORD_INDEX: i64 = -1;
