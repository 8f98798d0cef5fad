//! Error taxonomy.
//!
//! Numeric codes grouped by decade: 1000 validation, 2000 file, 3000
//! processing, 4000 resource, 5000 system. Per-record errors are journaled
//! and never raised; fatal errors carry a [`TransferError`] up the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Canonical error code. `code()` yields the stable numeric value persisted
/// in the error journal; `name()` the stable SCREAMING_SNAKE_CASE name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // 1000: validation
    MissingRequiredField,
    InvalidType,
    InvalidFormat,
    ValueTooLong,
    ValueTooShort,
    InvalidEnumValue,
    DuplicateValue,
    InvalidReference,
    CircularReference,
    // 2000: file
    FileTooLarge,
    UnsupportedFormat,
    FileIoError,
    UrlFetchFailed,
    UrlNotAllowed,
    EmptyFile,
    TooManyRecords,
    // 3000: processing
    ParseError,
    InvalidRecordStructure,
    BatchFailed,
    StreamError,
    EncodingError,
    // 4000: resource
    JobNotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    ConcurrentLimit,
    DownloadExpired,
    UnsupportedResource,
    // 5000: system
    DatabaseError,
    StorageError,
    QueueError,
    InternalError,
    Timeout,
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::MissingRequiredField => 1001,
            ErrorCode::InvalidType => 1002,
            ErrorCode::InvalidFormat => 1003,
            ErrorCode::ValueTooLong => 1004,
            ErrorCode::ValueTooShort => 1005,
            ErrorCode::InvalidEnumValue => 1006,
            ErrorCode::DuplicateValue => 1007,
            ErrorCode::InvalidReference => 1008,
            ErrorCode::CircularReference => 1009,
            ErrorCode::FileTooLarge => 2001,
            ErrorCode::UnsupportedFormat => 2002,
            ErrorCode::FileIoError => 2003,
            ErrorCode::UrlFetchFailed => 2004,
            ErrorCode::UrlNotAllowed => 2005,
            ErrorCode::EmptyFile => 2006,
            ErrorCode::TooManyRecords => 2007,
            ErrorCode::ParseError => 3001,
            ErrorCode::InvalidRecordStructure => 3002,
            ErrorCode::BatchFailed => 3003,
            ErrorCode::StreamError => 3004,
            ErrorCode::EncodingError => 3005,
            ErrorCode::JobNotFound => 4001,
            ErrorCode::Unauthorized => 4002,
            ErrorCode::Forbidden => 4003,
            ErrorCode::RateLimited => 4004,
            ErrorCode::ConcurrentLimit => 4005,
            ErrorCode::DownloadExpired => 4006,
            ErrorCode::UnsupportedResource => 4007,
            ErrorCode::DatabaseError => 5001,
            ErrorCode::StorageError => 5002,
            ErrorCode::QueueError => 5003,
            ErrorCode::InternalError => 5004,
            ErrorCode::Timeout => 5005,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::ValueTooLong => "VALUE_TOO_LONG",
            ErrorCode::ValueTooShort => "VALUE_TOO_SHORT",
            ErrorCode::InvalidEnumValue => "INVALID_ENUM_VALUE",
            ErrorCode::DuplicateValue => "DUPLICATE_VALUE",
            ErrorCode::InvalidReference => "INVALID_REFERENCE",
            ErrorCode::CircularReference => "CIRCULAR_REFERENCE",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::FileIoError => "FILE_IO_ERROR",
            ErrorCode::UrlFetchFailed => "URL_FETCH_FAILED",
            ErrorCode::UrlNotAllowed => "URL_NOT_ALLOWED",
            ErrorCode::EmptyFile => "EMPTY_FILE",
            ErrorCode::TooManyRecords => "TOO_MANY_RECORDS",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidRecordStructure => "INVALID_RECORD_STRUCTURE",
            ErrorCode::BatchFailed => "BATCH_FAILED",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::EncodingError => "ENCODING_ERROR",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ConcurrentLimit => "CONCURRENT_LIMIT",
            ErrorCode::DownloadExpired => "DOWNLOAD_EXPIRED",
            ErrorCode::UnsupportedResource => "UNSUPPORTED_RESOURCE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::QueueError => "QUEUE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        const ALL: &[ErrorCode] = &[
            ErrorCode::MissingRequiredField,
            ErrorCode::InvalidType,
            ErrorCode::InvalidFormat,
            ErrorCode::ValueTooLong,
            ErrorCode::ValueTooShort,
            ErrorCode::InvalidEnumValue,
            ErrorCode::DuplicateValue,
            ErrorCode::InvalidReference,
            ErrorCode::CircularReference,
            ErrorCode::FileTooLarge,
            ErrorCode::UnsupportedFormat,
            ErrorCode::FileIoError,
            ErrorCode::UrlFetchFailed,
            ErrorCode::UrlNotAllowed,
            ErrorCode::EmptyFile,
            ErrorCode::TooManyRecords,
            ErrorCode::ParseError,
            ErrorCode::InvalidRecordStructure,
            ErrorCode::BatchFailed,
            ErrorCode::StreamError,
            ErrorCode::EncodingError,
            ErrorCode::JobNotFound,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::RateLimited,
            ErrorCode::ConcurrentLimit,
            ErrorCode::DownloadExpired,
            ErrorCode::UnsupportedResource,
            ErrorCode::DatabaseError,
            ErrorCode::StorageError,
            ErrorCode::QueueError,
            ErrorCode::InternalError,
            ErrorCode::Timeout,
        ];
        ALL.iter().copied().find(|c| c.code() == code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tagged error with the payload shape shared by the journal and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} ({}): {}", self.code.name(), field, self.message),
            None => write!(f, "{}: {}", self.code.name(), self.message),
        }
    }
}

impl TransferError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            value: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(sanitize_value(value));
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// System errors are worth retrying at the queue layer.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::DatabaseError
                | ErrorCode::StorageError
                | ErrorCode::QueueError
                | ErrorCode::Timeout
        )
    }
}

impl std::error::Error for TransferError {}

impl From<sqlx::Error> for TransferError {
    fn from(err: sqlx::Error) -> Self {
        TransferError::new(ErrorCode::DatabaseError, err.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::new(ErrorCode::FileIoError, err.to_string())
    }
}

/// Maximum length for sanitized offending values.
const MAX_VALUE_LEN: usize = 200;

/// Clamp an offending value before it is journaled or surfaced.
///
/// Long strings are truncated; arrays and objects are reduced to a summary
/// so journals stay bounded regardless of record size.
pub fn sanitize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.chars().count() > MAX_VALUE_LEN => {
            let truncated: String = s.chars().take(MAX_VALUE_LEN).collect();
            serde_json::Value::String(format!("{truncated}..."))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::String(format!("[array of {} items]", items.len()))
        }
        serde_json::Value::Object(map) => {
            serde_json::Value::String(format!("[object with {} keys]", map.len()))
        }
        other => other,
    }
}
