//! Line-delimited JSON decoder.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::ParsedRecord;
use stevedore_protocol::{ErrorCode, TransferError, TransferResult};

pub struct NdjsonParser<R> {
    reader: R,
    max_records: usize,
    count: usize,
    line_number: usize,
    done: bool,
    line: String,
}

impl<R: AsyncBufRead + Unpin> NdjsonParser<R> {
    pub fn new(reader: R, max_records: usize) -> Self {
        Self {
            reader,
            max_records,
            count: 0,
            line_number: 0,
            done: false,
            line: String::new(),
        }
    }

    /// Next non-blank line parsed as one record.
    ///
    /// Handles `\n` and `\r\n` endings; any JSON failure aborts with
    /// `PARSE_ERROR` carrying the one-based line number.
    pub async fn next(&mut self) -> TransferResult<Option<ParsedRecord>> {
        if self.done {
            return Ok(None);
        }
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await.map_err(|e| {
                TransferError::new(ErrorCode::FileIoError, format!("read failed: {e}"))
            })?;
            if read == 0 {
                self.done = true;
                return Ok(None);
            }
            self.line_number += 1;

            let trimmed = self.line.trim_end_matches(['\n', '\r']).trim();
            if trimmed.is_empty() {
                continue;
            }

            let value = serde_json::from_str(trimmed).map_err(|e| {
                self.done = true;
                TransferError::new(
                    ErrorCode::ParseError,
                    format!("invalid JSON on line {}: {e}", self.line_number),
                )
                .with_details(serde_json::json!({ "line": self.line_number }))
            })?;

            self.count += 1;
            if self.count > self.max_records {
                self.done = true;
                return Err(TransferError::new(
                    ErrorCode::TooManyRecords,
                    format!("input exceeds the {} record limit", self.max_records),
                ));
            }

            return Ok(Some(ParsedRecord {
                value,
                index: self.count - 1,
                line_number: Some(self.line_number),
            }));
        }
    }
}
