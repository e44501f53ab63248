// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, QueryBuilder, Row as _, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::predicate::Predicate;
use crate::traits::{InsertOptions, OnDuplicate, Row, SelectOptions, SortOrder, Store, column_union};

/// Bind parameters per insert or keyed delete statement. Kept below the
/// historical SQLite limit of 999 so old builds accept every chunk.
const MAX_BIND_PARAMS: usize = 900;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database URL without touching its schema.
    ///
    /// Used for the primary and secondary stores, whose tables belong to the
    /// host application.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StoreError::query("connect", url, e))?;

        Ok(Self { pool })
    }

    /// Create and initialize a SQLite store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// the embedded migrations (log, rule, membership and queue tables).
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Query {
                operation: "create_dir",
                table: parent.display().to_string(),
                details: e.to_string(),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let store = Self::connect(&url).await?;
        migrations::run_sqlite(&store.pool).await?;

        Ok(store)
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Quote a table or column name, rejecting anything that is not a plain
/// (optionally schema-qualified) identifier.
pub fn quote_identifier(name: &str) -> Result<String> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    if !name.split('.').all(valid_part) {
        return Err(StoreError::InvalidIdentifier {
            name: name.to_string(),
        });
    }

    Ok(name
        .split('.')
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join("."))
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push_bind(None::<String>);
        }
        Value::Bool(b) => {
            builder.push_bind(*b);
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                builder.push_bind(i);
            }
            None => {
                builder.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        // Structured values are stored as their JSON text
        other => {
            builder.push_bind(other.to_string());
        }
    }
}

fn push_predicate(builder: &mut QueryBuilder<'_, Sqlite>, predicate: &Predicate) -> Result<()> {
    match predicate {
        Predicate::All => {
            builder.push("1 = 1");
        }
        Predicate::Compare { column, op, value } => {
            builder.push(quote_identifier(column)?);
            builder.push(" ");
            builder.push(op.as_sql());
            builder.push(" ");
            push_value(builder, value);
        }
        Predicate::In { column, values } => {
            if values.is_empty() {
                builder.push("1 = 0");
                return Ok(());
            }
            builder.push(quote_identifier(column)?);
            builder.push(" IN (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(builder, value);
            }
            builder.push(")");
        }
        Predicate::Keys { columns, tuples } => {
            if tuples.is_empty() || columns.is_empty() {
                builder.push("1 = 0");
                return Ok(());
            }
            let quoted = columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>>>()?;
            // Row values keep the expression tree flat at any batch size
            builder.push("(");
            builder.push(quoted.join(", "));
            builder.push(") IN (VALUES ");
            for (i, tuple) in tuples.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push("(");
                for (j, value) in tuple.iter().enumerate() {
                    if j > 0 {
                        builder.push(", ");
                    }
                    push_value(builder, value);
                }
                builder.push(")");
            }
            builder.push(")");
        }
        Predicate::And(parts) | Predicate::Or(parts) => {
            let (joiner, empty) = match predicate {
                Predicate::And(_) => (" AND ", "1 = 1"),
                _ => (" OR ", "1 = 0"),
            };
            if parts.is_empty() {
                builder.push(empty);
                return Ok(());
            }
            builder.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    builder.push(joiner);
                }
                push_predicate(builder, part)?;
            }
            builder.push(")");
        }
    }
    Ok(())
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();

    for column in row.columns() {
        let name = column.name();
        let index = column.ordinal();
        let decode_err = |e: sqlx::Error| StoreError::Decode {
            column: name.to_string(),
            details: e.to_string(),
        };

        let raw = row.try_get_raw(index).map_err(decode_err)?;
        if raw.is_null() {
            out.insert(name.to_string(), Value::Null);
            continue;
        }
        let storage_class = raw.type_info().name().to_string();

        let value = match storage_class.as_str() {
            "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(index).map_err(decode_err)?),
            "REAL" => Value::from(row.try_get::<f64, _>(index).map_err(decode_err)?),
            "BLOB" => {
                let bytes: Vec<u8> = row.try_get(index).map_err(decode_err)?;
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            "NUMERIC" => match row.try_get::<i64, _>(index) {
                Ok(i) => Value::from(i),
                Err(_) => Value::from(row.try_get::<f64, _>(index).map_err(decode_err)?),
            },
            _ => Value::String(row.try_get::<String, _>(index).map_err(decode_err)?),
        };
        out.insert(name.to_string(), value);
    }

    Ok(out)
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn select(
        &self,
        table: &str,
        predicate: &Predicate,
        options: &SelectOptions,
    ) -> Result<Vec<Row>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        match &options.columns {
            Some(columns) if !columns.is_empty() => {
                let quoted = columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Result<Vec<_>>>()?;
                builder.push(quoted.join(", "));
            }
            _ => {
                builder.push("*");
            }
        }
        builder.push(" FROM ");
        builder.push(quote_identifier(table)?);
        builder.push(" WHERE ");
        push_predicate(&mut builder, predicate)?;

        if !options.order_by.is_empty() {
            builder.push(" ORDER BY ");
            for (i, (column, order)) in options.order_by.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push(quote_identifier(column)?);
                builder.push(match order {
                    SortOrder::Asc => " ASC",
                    SortOrder::Desc => " DESC",
                });
            }
        }

        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded
        if options.limit.is_some() || options.offset > 0 {
            builder.push(" LIMIT ");
            builder.push_bind(options.limit.map(|l| l as i64).unwrap_or(-1));
            builder.push(" OFFSET ");
            builder.push_bind(options.offset as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::query("select", table, e))?;

        debug!(table, rows = rows.len(), "Selected rows");

        rows.iter().map(decode_row).collect()
    }

    async fn insert(&self, table: &str, rows: &[Row], options: &InsertOptions) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = column_union(rows);
        let quoted_table = quote_identifier(table)?;
        let quoted_columns = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let verb = match options.on_duplicate {
            OnDuplicate::Fail => "INSERT INTO ",
            OnDuplicate::Ignore => "INSERT OR IGNORE INTO ",
            OnDuplicate::Replace => "INSERT OR REPLACE INTO ",
        };

        let rows_per_statement = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        let mut written = 0u64;

        for chunk in rows.chunks(rows_per_statement) {
            let mut builder = QueryBuilder::<Sqlite>::new(verb);
            builder.push(&quoted_table);
            builder.push(" (");
            builder.push(&quoted_columns);
            builder.push(") VALUES ");

            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push("(");
                for (j, column) in columns.iter().enumerate() {
                    if j > 0 {
                        builder.push(", ");
                    }
                    push_value(&mut builder, row.get(column).unwrap_or(&Value::Null));
                }
                builder.push(")");
            }

            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::query("insert", table, e))?;
            written += result.rows_affected();
        }

        debug!(table, written, "Inserted rows");
        Ok(written)
    }

    async fn delete(&self, table: &str, predicate: &Predicate) -> Result<u64> {
        let quoted_table = quote_identifier(table)?;
        let pieces = predicate.split_set(MAX_BIND_PARAMS);

        // Chunked key sets are deleted all or nothing
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::query("delete", table, e))?;
        let mut deleted = 0u64;

        for piece in &pieces {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM ");
            builder.push(&quoted_table);
            builder.push(" WHERE ");
            push_predicate(&mut builder, piece)?;

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::query("delete", table, e))?;
            deleted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::query("delete", table, e))?;

        debug!(table, deleted, statements = pieces.len(), "Deleted rows");
        Ok(deleted)
    }
}
