//! NDJSON (Newline Delimited JSON) comment stream utilities.
//!
//! The upstream classifier emits one comment event per line. Blank lines are
//! ignored; every other line is parsed into a [`RawCommentEvent`] and reported
//! with its 1-based line number on failure.

use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::brain::event::RawCommentEvent;
use crate::error::{LiveBrainError, LiveBrainResult};

/// Parse a single NDJSON line.
///
/// # Returns
/// `Ok(None)` for blank lines, the parsed record otherwise.
pub fn parse_event_line(line: &str, line_number: usize) -> LiveBrainResult<Option<RawCommentEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| LiveBrainError::Json {
            line: line_number,
            source,
        })
}

/// Read a whole NDJSON file of comment events.
///
/// Stops at the first malformed line so replay files can be fixed up front.
pub fn read_events_file(path: impl AsRef<Path>) -> LiveBrainResult<Vec<RawCommentEvent>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(event) = parse_event_line(&line, index + 1)? {
            events.push(event);
        }
    }

    Ok(events)
}

/// Line-by-line async reader over any buffered source (stdin, file, socket).
///
/// Unlike [`read_events_file`], malformed lines are yielded as errors and the
/// reader keeps going.
pub struct EventLineReader<R> {
    lines: Lines<R>,
    line_number: usize,
}

impl<R: AsyncBufRead + Unpin> EventLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }

    /// Next non-blank line as a parse result; `None` at end of input.
    pub async fn next_event(&mut self) -> Option<LiveBrainResult<RawCommentEvent>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_number += 1;

            match parse_event_line(&line, self.line_number) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }
}

/// Serialize `value` as one NDJSON line and flush it.
pub async fn write_ndjson_line<W, T>(writer: &mut W, value: &T) -> LiveBrainResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value).map_err(|source| LiveBrainError::Json { line: 0, source })?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
