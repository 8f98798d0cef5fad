//! Canonical job and resource types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Job direction - import into the store, or export out of it.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobKind {
    Import,
    Export,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Export => "export",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "import" => Ok(JobKind::Import),
            "export" => Ok(JobKind::Export),
            _ => Err(format!("Invalid job kind: '{s}'. Expected: import or export")),
        }
    }
}

/// Entity family a job moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ResourceKind {
    Users,
    Articles,
    Comments,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Users => "users",
            ResourceKind::Articles => "articles",
            ResourceKind::Comments => "comments",
        }
    }

    /// Canonical filter keys accepted for this resource.
    pub fn filter_keys(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Users => &["id", "email", "role", "name", "active", "created_at"],
            ResourceKind::Articles => {
                &["id", "slug", "status", "author_id", "published_at", "created_at"]
            }
            ResourceKind::Comments => &["id", "article_id", "user_id", "created_at"],
        }
    }

    /// Canonical export field set for this resource.
    pub fn export_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Users => {
                &["id", "email", "name", "role", "active", "created_at", "updated_at"]
            }
            ResourceKind::Articles => {
                &["id", "slug", "title", "body", "author_id", "tags", "published_at", "status"]
            }
            ResourceKind::Comments => &["id", "article_id", "user_id", "body", "created_at"],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "users" => Ok(ResourceKind::Users),
            "articles" => Ok(ResourceKind::Articles),
            "comments" => Ok(ResourceKind::Comments),
            _ => Err(format!(
                "Invalid resource: '{s}'. Expected: users, articles or comments"
            )),
        }
    }
}

/// Artifact shape - line-delimited JSON or a single JSON array envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Ndjson,
    Json,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Ndjson => "ndjson",
            ExportFormat::Json => "json",
        }
    }

    /// File extension used for artifact keys.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Detect format from a file name extension, if recognizable.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "ndjson" | "jsonl" => Some(ExportFormat::Ndjson),
            "json" => Some(ExportFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ndjson" | "jsonl" => Ok(ExportFormat::Ndjson),
            "json" => Ok(ExportFormat::Json),
            _ => Err(format!("Invalid format: '{s}'. Expected: ndjson or json")),
        }
    }
}

/// Job lifecycle status.
///
/// Monotonic along `queued -> running -> {succeeded, partial, failed,
/// cancelled}`; `cancelled` may also be entered directly from `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Partial,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Partial => "partial",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Partial | JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an import source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SourceType {
    Upload,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Upload => "upload",
            SourceType::Url => "url",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Error summary (persisted on import jobs)
// ============================================================================

/// Outcome of the error-report generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Complete,
    Partial,
    Failed,
}

/// Structured summary persisted on an import job after the run terminates.
///
/// `report_location` is internal - strip it with [`ErrorSummary::sanitized`]
/// before anything leaves the service boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub report_status: ReportStatus,
    pub persisted_error_count: i64,
    pub persistence_failures: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_location: Option<String>,
    pub report_format: ExportFormat,
    pub report_generation_failed: bool,
}

impl ErrorSummary {
    /// Copy with the internal report location removed.
    pub fn sanitized(&self) -> Self {
        Self {
            report_location: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Partial.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn format_from_file_name() {
        assert_eq!(ExportFormat::from_file_name("a.ndjson"), Some(ExportFormat::Ndjson));
        assert_eq!(ExportFormat::from_file_name("a.JSONL"), Some(ExportFormat::Ndjson));
        assert_eq!(ExportFormat::from_file_name("a.json"), Some(ExportFormat::Json));
        assert_eq!(ExportFormat::from_file_name("a.csv"), None);
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&JobKind::Import).unwrap(), "\"import\"");
        assert_eq!(serde_json::to_string(&JobStatus::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!(serde_json::to_string(&ResourceKind::Articles).unwrap(), "\"articles\"");
    }

    #[test]
    fn error_summary_sanitized_strips_location() {
        let summary = ErrorSummary {
            report_status: ReportStatus::Complete,
            persisted_error_count: 3,
            persistence_failures: 0,
            report_location: Some("import-errors/abc.ndjson".to_string()),
            report_format: ExportFormat::Ndjson,
            report_generation_failed: false,
        };
        let clean = summary.sanitized();
        assert_eq!(clean.report_location, None);
        let json = serde_json::to_value(&clean).unwrap();
        assert!(json.get("reportLocation").is_none());
        assert_eq!(json["persistedErrorCount"], 3);
    }
}
