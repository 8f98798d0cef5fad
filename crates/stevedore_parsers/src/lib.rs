//! Record parsers.
//!
//! Both decoders are finite, non-restartable pull sequences yielding
//! `(record, index)` pairs without materializing the document, and both
//! enforce the max-record cap with `TOO_MANY_RECORDS`.

mod json_array;
mod ndjson;

pub use json_array::JsonArrayParser;
pub use ndjson::NdjsonParser;

use serde_json::Value;
use tokio::io::AsyncBufRead;

use stevedore_protocol::{ExportFormat, TransferResult};

/// One decoded source record.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub value: Value,
    /// Zero-based record ordinal.
    pub index: usize,
    /// One-based source line, when the encoding has lines.
    pub line_number: Option<usize>,
}

/// Format-dispatched record stream.
pub enum RecordStream<R> {
    Ndjson(NdjsonParser<R>),
    Json(JsonArrayParser<R>),
}

impl<R: AsyncBufRead + Unpin> RecordStream<R> {
    pub fn new(format: ExportFormat, reader: R, max_records: usize) -> Self {
        match format {
            ExportFormat::Ndjson => RecordStream::Ndjson(NdjsonParser::new(reader, max_records)),
            ExportFormat::Json => RecordStream::Json(JsonArrayParser::new(reader, max_records)),
        }
    }

    /// Pull the next record, or `None` at end of input.
    pub async fn next(&mut self) -> TransferResult<Option<ParsedRecord>> {
        match self {
            RecordStream::Ndjson(parser) => parser.next().await,
            RecordStream::Json(parser) => parser.next().await,
        }
    }
}
