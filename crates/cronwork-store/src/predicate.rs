// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row predicates shared by every store backend.
//!
//! SQL backends render a [`Predicate`] into a `WHERE` clause with bound
//! parameters; the in-memory backend evaluates it directly with
//! [`Predicate::matches`]. Both follow SQL's three-valued logic for `NULL`:
//! a comparison against `NULL` never matches.

use std::cmp::Ordering;

use serde_json::Value;

use crate::traits::Row;

/// Comparison operator for [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    /// SQL spelling of the operator.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Whether `left <op> right` holds given `left.cmp(right)`.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// Boolean row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    All,
    /// `column <op> value`
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CmpOp,
        /// Right-hand side.
        value: Value,
    },
    /// `column IN (values...)`; an empty list matches nothing.
    In {
        /// Column name.
        column: String,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// `(columns...) IN ((values...), ...)`: row-value membership for
    /// composite keys. Each tuple lines up with `columns`; an empty set
    /// matches nothing.
    Keys {
        /// Key column names.
        columns: Vec<String>,
        /// One value per key column for every matched row.
        tuples: Vec<Vec<Value>>,
    },
    /// Conjunction; empty matches everything.
    And(Vec<Predicate>),
    /// Disjunction; empty matches nothing.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// `column <op> value`
    pub fn compare(column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CmpOp::Eq, value)
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CmpOp::Lt, value)
    }

    /// `column >= value`
    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CmpOp::Ge, value)
    }

    /// `column IN (values...)`
    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            column: column.into(),
            values,
        }
    }

    /// Set-membership predicate identifying `rows` by their key columns.
    ///
    /// A single key column becomes `col IN (...)`. Composite keys become a
    /// [`Predicate::Keys`] row-value set, so rows are matched by their full
    /// key and never by a cross product of the column values.
    pub fn for_keys(key_columns: &[String], rows: &[Row]) -> Self {
        match key_columns {
            [] => Self::Or(Vec::new()),
            [column] => {
                let mut values: Vec<Value> = Vec::with_capacity(rows.len());
                for row in rows {
                    let value = row.get(column).cloned().unwrap_or(Value::Null);
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
                Self::is_in(column.clone(), values)
            }
            columns => {
                let mut tuples: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
                for row in rows {
                    let tuple: Vec<Value> = columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                        .collect();
                    if !tuples.contains(&tuple) {
                        tuples.push(tuple);
                    }
                }
                Self::Keys {
                    columns: columns.to_vec(),
                    tuples,
                }
            }
        }
    }

    /// Number of bound values the predicate renders to in SQL.
    pub fn bind_count(&self) -> usize {
        match self {
            Self::All => 0,
            Self::Compare { .. } => 1,
            Self::In { values, .. } => values.len(),
            Self::Keys { columns, tuples } => columns.len() * tuples.len(),
            Self::And(parts) | Self::Or(parts) => parts.iter().map(Self::bind_count).sum(),
        }
    }

    /// Split a set-membership predicate into pieces of at most `max_binds`
    /// bound values whose union matches the same rows.
    ///
    /// Anything other than a top-level `In` or `Keys` is returned whole.
    pub fn split_set(&self, max_binds: usize) -> Vec<Predicate> {
        match self {
            Self::In { column, values } if values.len() > max_binds => values
                .chunks(max_binds.max(1))
                .map(|chunk| Self::is_in(column.clone(), chunk.to_vec()))
                .collect(),
            Self::Keys { columns, tuples } if columns.len() * tuples.len() > max_binds => tuples
                .chunks((max_binds / columns.len().max(1)).max(1))
                .map(|chunk| Self::Keys {
                    columns: columns.clone(),
                    tuples: chunk.to_vec(),
                })
                .collect(),
            other => vec![other.clone()],
        }
    }

    /// Evaluate the predicate against a row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::Compare { column, op, value } => row
                .get(column)
                .and_then(|v| compare_values(v, value))
                .is_some_and(|ordering| op.holds(ordering)),
            Self::In { column, values } => row.get(column).is_some_and(|v| {
                values
                    .iter()
                    .any(|candidate| compare_values(v, candidate) == Some(Ordering::Equal))
            }),
            Self::Keys { columns, tuples } => tuples.iter().any(|tuple| {
                columns.iter().zip(tuple).all(|(column, candidate)| {
                    row.get(column)
                        .and_then(|v| compare_values(v, candidate))
                        .is_some_and(|ordering| ordering == Ordering::Equal)
                })
            }),
            Self::And(parts) => parts.iter().all(|p| p.matches(row)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }
}

/// Order two row values the way a SQL comparison would.
///
/// Returns `None` when either side is `NULL` or the types are not comparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_compare_null_never_matches() {
        let r = row(&[("expires", Value::Null)]);
        assert!(!Predicate::lt("expires", 10).matches(&r));
        assert!(!Predicate::compare("expires", CmpOp::Ne, 10).matches(&r));
    }

    #[test]
    fn test_mixed_integer_and_float_compare() {
        let r = row(&[("created", json!(1700000000.5))]);
        assert!(Predicate::ge("created", 1700000000).matches(&r));
        assert!(Predicate::lt("created", 1700000001).matches(&r));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let r = row(&[("id", json!(1))]);
        assert!(!Predicate::is_in("id", vec![]).matches(&r));
        assert!(Predicate::And(vec![]).matches(&r));
        assert!(!Predicate::Or(vec![]).matches(&r));
    }

    #[test]
    fn test_for_keys_single_column_dedupes() {
        let rows = vec![
            row(&[("id", json!(1))]),
            row(&[("id", json!(2))]),
            row(&[("id", json!(1))]),
        ];
        let predicate = Predicate::for_keys(&["id".to_string()], &rows);
        assert_eq!(predicate, Predicate::is_in("id", vec![json!(1), json!(2)]));
    }

    #[test]
    fn test_for_keys_composite_matches_exact_pairs() {
        let rows = vec![
            row(&[("a", json!(1)), ("b", json!("x"))]),
            row(&[("a", json!(2)), ("b", json!("y"))]),
        ];
        let predicate = Predicate::for_keys(&["a".to_string(), "b".to_string()], &rows);

        assert!(predicate.matches(&row(&[("a", json!(1)), ("b", json!("x"))])));
        assert!(predicate.matches(&row(&[("a", json!(2)), ("b", json!("y"))])));
        // Cross-product pair must not match
        assert!(!predicate.matches(&row(&[("a", json!(1)), ("b", json!("y"))])));
    }

    #[test]
    fn test_for_keys_composite_is_a_flat_key_set() {
        let rows: Vec<Row> = (0..1500)
            .map(|i| row(&[("shop", json!(i % 3)), ("order", json!(i))]))
            .collect();
        let predicate = Predicate::for_keys(&["shop".to_string(), "order".to_string()], &rows);

        match &predicate {
            Predicate::Keys { columns, tuples } => {
                assert_eq!(columns, &vec!["shop".to_string(), "order".to_string()]);
                assert_eq!(tuples.len(), 1500);
            }
            other => panic!("expected a key set, got {:?}", other),
        }
        assert_eq!(predicate.bind_count(), 3000);
    }

    #[test]
    fn test_split_set_covers_every_key_once() {
        let rows: Vec<Row> = (0..1001)
            .map(|i| row(&[("shop", json!(1)), ("order", json!(i))]))
            .collect();
        let predicate = Predicate::for_keys(&["shop".to_string(), "order".to_string()], &rows);

        let pieces = predicate.split_set(900);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.bind_count() <= 900));
        for r in &rows {
            assert_eq!(pieces.iter().filter(|p| p.matches(r)).count(), 1);
        }

        let single = Predicate::is_in("id", (0..10).map(|i| json!(i)).collect());
        assert_eq!(single.split_set(4).len(), 3);
        assert_eq!(Predicate::All.split_set(4), vec![Predicate::All]);
    }

    #[test]
    fn test_cmp_op_sql() {
        assert_eq!(CmpOp::Le.as_sql(), "<=");
        assert_eq!(CmpOp::Ne.as_sql(), "<>");
        assert!(CmpOp::Le.holds(Ordering::Equal));
        assert!(!CmpOp::Gt.holds(Ordering::Equal));
    }
}
