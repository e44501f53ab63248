// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parsed log lines.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::INGEST_FAILURE_MESSAGE;

/// One structured log entry from a rotated file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Producer channel.
    pub channel: String,
    /// Ordered severity; higher is worse.
    pub level: i64,
    /// Seconds since the epoch.
    pub created: f64,
    /// Origin host or process.
    pub node: String,
    /// Free text.
    pub message: String,
    /// Structured payload.
    pub context: Value,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    channel: String,
    level: i64,
    #[serde(default)]
    created: Option<f64>,
    #[serde(default)]
    datetime: Option<String>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    context: Value,
}

/// Why a line was skipped.
#[derive(Debug, Error)]
pub enum LineError {
    /// Not a JSON object of the expected shape.
    #[error("invalid log line: {0}")]
    Json(#[from] serde_json::Error),
    /// Neither `created` nor `datetime` present.
    #[error("log line has no timestamp")]
    MissingTimestamp,
    /// `datetime` is not RFC 3339.
    #[error("invalid datetime '{0}'")]
    BadTimestamp(String),
}

impl LogRecord {
    /// Parse one JSON line. `default_node` fills a missing `node`.
    ///
    /// The timestamp is `created` (epoch seconds) or, failing that,
    /// `datetime` (RFC 3339).
    pub fn parse_line(line: &str, default_node: &str) -> Result<Self, LineError> {
        let raw: RawLine = serde_json::from_str(line)?;
        let created = match (raw.created, raw.datetime) {
            (Some(created), _) => created,
            (None, Some(datetime)) => {
                let parsed = DateTime::parse_from_rfc3339(&datetime)
                    .map_err(|_| LineError::BadTimestamp(datetime.clone()))?;
                parsed.timestamp() as f64 + f64::from(parsed.timestamp_subsec_micros()) / 1e6
            }
            (None, None) => return Err(LineError::MissingTimestamp),
        };

        Ok(Self {
            channel: raw.channel,
            level: raw.level,
            created,
            node: raw.node.unwrap_or_else(|| default_node.to_string()),
            message: raw.message,
            context: raw.context,
        })
    }

    /// Written by a failing log ingest; never fed back into the log store.
    pub fn is_ingest_failure(&self) -> bool {
        self.message.starts_with(INGEST_FAILURE_MESSAGE)
    }
}

/// Records parsed from one file plus what was dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    /// Records to ingest.
    pub records: Vec<LogRecord>,
    /// Lines that did not parse.
    pub skipped: usize,
    /// Ingest-failure records removed.
    pub filtered: usize,
}

/// Split newline-delimited content into records. Blank lines are ignored.
pub fn parse_content(content: &str, default_node: &str) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match LogRecord::parse_line(line, default_node) {
            Ok(record) if record.is_ingest_failure() => batch.filtered += 1,
            Ok(record) => batch.records.push(record),
            Err(e) => {
                tracing::warn!(line = number + 1, error = %e, "Skipping unparsable log line");
                batch.skipped += 1;
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_line_with_epoch() {
        let record = LogRecord::parse_line(
            r#"{"channel":"billing","level":400,"created":1700000000.5,"node":"web-1","message":"charge declined","context":{"order":42}}"#,
            "fallback",
        )
        .unwrap();

        assert_eq!(record.channel, "billing");
        assert_eq!(record.level, 400);
        assert_eq!(record.created, 1_700_000_000.5);
        assert_eq!(record.node, "web-1");
        assert_eq!(record.context, json!({"order": 42}));
    }

    #[test]
    fn test_parse_line_with_datetime_and_default_node() {
        let record = LogRecord::parse_line(
            r#"{"channel":"app","level":200,"datetime":"2024-01-01T00:00:01.250000+00:00","message":"ok"}"#,
            "worker-3",
        )
        .unwrap();

        assert_eq!(record.created, 1_704_067_201.25);
        assert_eq!(record.node, "worker-3");
        assert_eq!(record.context, Value::Null);
    }

    #[test]
    fn test_parse_line_errors() {
        assert!(matches!(
            LogRecord::parse_line(r#"{"channel":"app","level":1}"#, "n"),
            Err(LineError::MissingTimestamp)
        ));
        assert!(matches!(
            LogRecord::parse_line(r#"{"channel":"app","level":1,"datetime":"yesterday"}"#, "n"),
            Err(LineError::BadTimestamp(_))
        ));
        assert!(matches!(
            LogRecord::parse_line("not json", "n"),
            Err(LineError::Json(_))
        ));
    }

    #[test]
    fn test_parse_content_filters_ingest_failures() {
        let content = concat!(
            r#"{"channel":"app","level":200,"created":1,"message":"first"}"#,
            "\n\n",
            r#"{"channel":"cron","level":400,"created":2,"message":"Failed to insert logs: 0 of 3 rows written"}"#,
            "\n",
            "garbage\n",
            r#"{"channel":"app","level":300,"created":3,"message":"second"}"#,
            "\n",
        );

        let batch = parse_content(content, "n");
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.filtered, 1);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.records[1].message, "second");
    }
}
