//! Derived throughput metrics for completed jobs.

use chrono::{DateTime, Utc};

/// Metrics computed at `job.completed` when the start timestamp is known.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub duration_ms: i64,
    pub rows_per_second: f64,
    pub error_rate: f64,
}

/// Compute throughput and error-rate metrics for a finished run.
///
/// Duration is floored at 1 ms so downstream division is safe.
pub fn compute(
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    processed_records: i64,
    error_count: i64,
) -> JobMetrics {
    let duration_ms = (finished_at - started_at).num_milliseconds().max(1);
    let rows_per_second = round_to(processed_records as f64 * 1000.0 / duration_ms as f64, 3);
    let error_rate = round_to(error_count as f64 / processed_records.max(1) as f64, 6);
    JobMetrics {
        duration_ms,
        rows_per_second,
        error_rate,
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn duration_floors_at_one_ms() {
        let m = compute(ts(1000), ts(1000), 10, 0);
        assert_eq!(m.duration_ms, 1);
        assert_eq!(m.rows_per_second, 10_000.0);
    }

    #[test]
    fn rates_are_rounded() {
        let m = compute(ts(0), ts(3000), 10, 3);
        assert_eq!(m.duration_ms, 3000);
        assert_eq!(m.rows_per_second, 3.333);
        assert_eq!(m.error_rate, 0.3);
    }

    #[test]
    fn error_rate_safe_on_zero_processed() {
        let m = compute(ts(0), ts(100), 0, 0);
        assert_eq!(m.error_rate, 0.0);
    }
}
