//! SQL dialect abstraction for tabsync-rdbc
//!
//! Statements are assembled with positional `?` markers. A dialect then
//! renders them into its native placeholder syntax, binding the parameters
//! in order:
//!
//! ```rust,ignore
//! let (sql, params) = PostgresDialect.render(
//!     "SELECT * FROM \"t\" WHERE \"a\" = ? AND \"b\" = ?",
//!     vec![Value::Int64(1), Value::Null],
//! )?;
//! assert_eq!(sql, "SELECT * FROM \"t\" WHERE \"a\" = $1::int8 AND \"b\" = NULL");
//! assert_eq!(params, vec![Value::Int64(1)]);
//! ```

use crate::error::{Error, Result};
use crate::types::Value;

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter (e.g., $1, ?, @p1)
    fn placeholder(&self, index: usize) -> String;

    /// Placeholder for a parameter that will carry `value`.
    ///
    /// Dialects that cannot infer parameter types from context annotate the
    /// placeholder here.
    fn typed_placeholder(&self, index: usize, _value: &Value) -> String {
        self.placeholder(index)
    }

    /// Get the LIMIT/OFFSET syntax (leading space included when non-empty)
    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(l) = limit {
            sql.push_str(&format!(" LIMIT {}", l));
        }
        if let Some(o) = offset {
            sql.push_str(&format!(" OFFSET {}", o));
        }
        sql
    }

    /// Rewrite `?` markers into native placeholders.
    ///
    /// `NULL` parameters are written inline and dropped from the bound list;
    /// markers inside quoted literals or identifiers are left alone. Fails if
    /// the number of markers and parameters differ.
    fn render(&self, sql: &str, params: Vec<Value>) -> Result<(String, Vec<Value>)> {
        let mut out = String::with_capacity(sql.len() + params.len() * 8);
        let mut bound = Vec::with_capacity(params.len());
        let mut pending = params.into_iter();
        let mut in_literal = false;
        let mut in_identifier = false;

        for c in sql.chars() {
            match c {
                '\'' if !in_identifier => {
                    in_literal = !in_literal;
                    out.push(c);
                }
                '"' if !in_literal => {
                    in_identifier = !in_identifier;
                    out.push(c);
                }
                '?' if !in_literal && !in_identifier => {
                    let value = pending.next().ok_or_else(|| {
                        Error::query_with_sql("more placeholders than parameters", sql)
                    })?;
                    if value.is_null() {
                        out.push_str("NULL");
                    } else {
                        bound.push(value);
                        let index = bound.len();
                        out.push_str(&self.typed_placeholder(index, &bound[index - 1]));
                    }
                }
                _ => out.push(c),
            }
        }

        if pending.next().is_some() {
            return Err(Error::query_with_sql(
                "more parameters than placeholders",
                sql,
            ));
        }

        Ok((out, bound))
    }

    /// Build a SELECT statement. An empty column list selects `*`.
    fn build_select(
        &self,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: Option<(&str, bool)>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> String {
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!(
            "SELECT {} FROM {}",
            projection,
            self.quote_identifier(table)
        );

        if let Some(w) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }

        if let Some((col, asc)) = order_by {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                self.quote_identifier(col),
                if asc { "ASC" } else { "DESC" }
            ));
        }

        sql.push_str(&self.limit_offset_sql(limit, offset));
        sql
    }

    /// Build an INSERT statement with one `?` marker per column
    fn build_insert(&self, table: &str, columns: &[&str]) -> String {
        let cols = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let markers = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_identifier(table),
            cols,
            markers
        )
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Parameter type annotation for a bound value
    pub fn cast_type(value: &Value) -> &'static str {
        match value {
            Value::Bool(_) => "boolean",
            Value::Int64(_) => "int8",
            Value::Float64(_) => "float8",
            Value::String(_) | Value::Null => "text",
            Value::DateTime(_) => "timestamptz",
        }
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    // Explicit casts keep numeric comparisons working against integer
    // columns and let text parameters compare with LOWER(...).
    fn typed_placeholder(&self, index: usize, value: &Value) -> String {
        format!("${}::{}", index, Self::cast_type(value))
    }
}
