//! Event-driven JSON array decoder.
//!
//! Yields elements of a top-level array one at a time without materializing
//! the document: a byte-level scanner tracks string/escape state and
//! container depth, slicing out one element at a time for `serde_json`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::ParsedRecord;
use stevedore_protocol::{ErrorCode, TransferError, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Before the opening `[`.
    Start,
    /// Inside the array, before the first element.
    First,
    /// Inside the array, after at least one element.
    Rest,
    Done,
}

pub struct JsonArrayParser<R> {
    reader: R,
    max_records: usize,
    count: usize,
    state: State,
}

impl<R: AsyncBufRead + Unpin> JsonArrayParser<R> {
    pub fn new(reader: R, max_records: usize) -> Self {
        Self {
            reader,
            max_records,
            count: 0,
            state: State::Start,
        }
    }

    pub async fn next(&mut self) -> TransferResult<Option<ParsedRecord>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Start => {
                    self.skip_whitespace().await?;
                    match self.peek().await? {
                        Some(b'[') => {
                            self.consume_one();
                            self.state = State::First;
                        }
                        _ => {
                            self.state = State::Done;
                            return Err(parse_error("top-level JSON value must be an array"));
                        }
                    }
                }
                State::First => {
                    self.skip_whitespace().await?;
                    match self.peek().await? {
                        Some(b']') => {
                            self.consume_one();
                            self.state = State::Done;
                            return Ok(None);
                        }
                        Some(_) => return self.read_element().await.map(Some),
                        None => {
                            self.state = State::Done;
                            return Err(parse_error("unexpected end of input inside array"));
                        }
                    }
                }
                State::Rest => {
                    self.skip_whitespace().await?;
                    match self.peek().await? {
                        Some(b']') => {
                            self.consume_one();
                            self.state = State::Done;
                            return Ok(None);
                        }
                        Some(b',') => {
                            self.consume_one();
                            self.skip_whitespace().await?;
                            return self.read_element().await.map(Some);
                        }
                        Some(other) => {
                            self.state = State::Done;
                            return Err(parse_error(format!(
                                "expected ',' or ']' between array elements, found {:?}",
                                char::from(other)
                            )));
                        }
                        None => {
                            self.state = State::Done;
                            return Err(parse_error("unexpected end of input inside array"));
                        }
                    }
                }
            }
        }
    }

    /// Slice out one element and decode it.
    async fn read_element(&mut self) -> TransferResult<ParsedRecord> {
        let mut buf = Vec::with_capacity(128);
        let first = self.peek().await?.ok_or_else(|| {
            self.state = State::Done;
            parse_error("unexpected end of input inside array")
        })?;

        let result = match first {
            b'{' | b'[' => self.read_container(&mut buf).await,
            b'"' => self.read_string(&mut buf).await,
            _ => self.read_scalar(&mut buf).await,
        };
        if let Err(err) = result {
            self.state = State::Done;
            return Err(err);
        }

        let value = serde_json::from_slice(&buf).map_err(|e| {
            self.state = State::Done;
            parse_error(format!("invalid JSON element at index {}: {e}", self.count))
        })?;

        self.count += 1;
        if self.count > self.max_records {
            self.state = State::Done;
            return Err(TransferError::new(
                ErrorCode::TooManyRecords,
                format!("input exceeds the {} record limit", self.max_records),
            ));
        }

        self.state = State::Rest;
        Ok(ParsedRecord {
            value,
            index: self.count - 1,
            line_number: None,
        })
    }

    async fn read_container(&mut self, buf: &mut Vec<u8>) -> TransferResult<()> {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escape = false;
        loop {
            let byte = self
                .peek()
                .await?
                .ok_or_else(|| parse_error("unexpected end of input inside element"))?;
            self.consume_one();
            buf.push(byte);

            if in_string {
                if escape {
                    escape = false;
                } else if byte == b'\\' {
                    escape = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    async fn read_string(&mut self, buf: &mut Vec<u8>) -> TransferResult<()> {
        // Opening quote.
        buf.push(b'"');
        self.consume_one();
        let mut escape = false;
        loop {
            let byte = self
                .peek()
                .await?
                .ok_or_else(|| parse_error("unexpected end of input inside string"))?;
            self.consume_one();
            buf.push(byte);
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                return Ok(());
            }
        }
    }

    async fn read_scalar(&mut self, buf: &mut Vec<u8>) -> TransferResult<()> {
        loop {
            match self.peek().await? {
                None | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(b',')
                | Some(b']') => return Ok(()),
                Some(byte) => {
                    self.consume_one();
                    buf.push(byte);
                }
            }
        }
    }

    async fn skip_whitespace(&mut self) -> TransferResult<()> {
        while let Some(byte) = self.peek().await? {
            if matches!(byte, b' ' | b'\t' | b'\r' | b'\n') {
                self.consume_one();
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn peek(&mut self) -> TransferResult<Option<u8>> {
        let buf = self.reader.fill_buf().await.map_err(|e| {
            TransferError::new(ErrorCode::FileIoError, format!("read failed: {e}"))
        })?;
        Ok(buf.first().copied())
    }

    fn consume_one(&mut self) {
        self.reader.consume(1);
    }
}

fn parse_error(message: impl Into<String>) -> TransferError {
    TransferError::new(ErrorCode::ParseError, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect(input: &str, max: usize) -> TransferResult<Vec<ParsedRecord>> {
        let mut parser = JsonArrayParser::new(input.as_bytes(), max);
        let mut out = Vec::new();
        while let Some(record) = parser.next().await? {
            out.push(record);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn parses_objects_strings_and_scalars() {
        let input = r#"[ {"a": "x,]"}, "plain", 42, null, [1, 2] ]"#;
        let records = collect(input, 10).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].value, json!({"a": "x,]"}));
        assert_eq!(records[1].value, json!("plain"));
        assert_eq!(records[2].value, json!(42));
        assert_eq!(records[3].value, json!(null));
        assert_eq!(records[4].value, json!([1, 2]));
        assert_eq!(records[4].index, 4);
    }

    #[tokio::test]
    async fn escaped_quotes_do_not_break_strings() {
        let input = r#"[{"quote": "she said \"hi\", then left"}]"#;
        let records = collect(input, 10).await.unwrap();
        assert_eq!(records[0].value["quote"], "she said \"hi\", then left");
    }

    #[tokio::test]
    async fn empty_array_yields_nothing() {
        assert!(collect("[]", 10).await.unwrap().is_empty());
        assert!(collect("  [ ]  ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_array_top_level_is_a_parse_error() {
        let err = collect(r#"{"a": 1}"#, 10).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn truncated_input_is_a_parse_error() {
        let err = collect(r#"[{"a": 1},"#, 10).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);

        let err = collect(r#"[{"a": 1"#, 10).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn cap_is_exact() {
        assert_eq!(collect("[1, 2, 3]", 3).await.unwrap().len(), 3);
        let err = collect("[1, 2, 3]", 2).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TooManyRecords);
    }
}
