// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk writes of parsed log records.

use std::sync::Arc;

use cronwork_store::{InsertOptions, Row, Store};
use serde_json::{Value, json};
use tracing::debug;

use super::record::LogRecord;
use crate::error::{Error, Result};

/// Writes [`LogRecord`]s into the log table.
///
/// Delivery is at-least-once: a failed batch is retried whole on a later
/// pass, so rows written before the failure may be written again.
#[derive(Clone)]
pub struct LogIngestor {
    store: Arc<dyn Store>,
    table: String,
    chunk_size: usize,
}

impl LogIngestor {
    /// Write to `table`, at most `chunk_size` rows per insert.
    pub fn new(store: Arc<dyn Store>, table: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            store,
            table: table.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Log table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Row layout of the log table.
    pub fn to_row(record: &LogRecord) -> Row {
        let payload = json!({
            "message": record.message,
            "context": record.context,
        });
        let mut row = Row::new();
        row.insert("Channel".into(), Value::String(record.channel.clone()));
        row.insert("Log_Level".into(), json!(record.level));
        row.insert("Created".into(), json!(record.created));
        row.insert("Node".into(), Value::String(record.node.clone()));
        row.insert("Message".into(), Value::String(payload.to_string()));
        row
    }

    /// Insert every record. `Ok` only when every chunk was written.
    pub async fn ingest(&self, records: &[LogRecord]) -> Result<u64> {
        let rows: Vec<Row> = records.iter().map(Self::to_row).collect();
        let mut written = 0u64;

        for chunk in rows.chunks(self.chunk_size) {
            match self
                .store
                .insert(&self.table, chunk, &InsertOptions::default())
                .await
            {
                Ok(count) if count == chunk.len() as u64 => written += count,
                Ok(count) => {
                    return Err(Error::Ingest {
                        written: written + count,
                        total: rows.len(),
                        source: cronwork_store::StoreError::Query {
                            operation: "insert",
                            table: self.table.clone(),
                            details: format!("{} of {} rows accepted", count, chunk.len()),
                        },
                    });
                }
                Err(source) => {
                    return Err(Error::Ingest {
                        written,
                        total: rows.len(),
                        source,
                    });
                }
            }
        }

        debug!(table = %self.table, rows = written, "Log rows written");
        Ok(written)
    }
}

impl std::fmt::Debug for LogIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIngestor")
            .field("backend", &self.store.backend())
            .field("table", &self.table)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
