//! Relational store access for Stevedore.
//!
//! One table per entity family plus supporting tables for jobs, the queue
//! and the import error journal. All access goes through sqlx with raw SQL;
//! conditional updates (`rows_affected`) provide the mutual-exclusion
//! primitives for job claiming and queue pops.

pub mod entities;
pub mod errors;
pub mod jobs;
pub mod pool;
pub mod queue;
pub mod schema;
pub mod upsert;

pub use entities::EntityReader;
pub use errors::{ErrorJournal, ImportErrorRow, NewImportError};
pub use jobs::{ClaimOutcome, CreateOutcome, JobRow, JobStore, NewJob};
pub use pool::{create_pool, DbConfig, DbPool};
pub use queue::{JobQueue, QueueEntry};
pub use upsert::{apply_batch, classify_db_error, BatchOutcome, RecordFailure, RecordOp};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC timestamp encoding for stored/compared values.
///
/// Millisecond precision with a trailing `Z` keeps lexicographic order equal
/// to chronological order for every stored timestamp and bound value.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fmt_ts_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(123);
        let (sa, sb) = (fmt_ts(a), fmt_ts(b));
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert!(sa.ends_with('Z'));
    }
}
