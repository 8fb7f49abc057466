//! Query executor
//!
//! Rows are read through a server-side cursor in fixed-size batches and
//! handed to the caller one instance at a time, so memory stays bounded no
//! matter how large the result is.

use tabsync_rdbc::pool::PooledCursor;
use tabsync_rdbc::security::escape_like_pattern;
use tabsync_rdbc::types::Value;
use tracing::debug;

use crate::db::Database;
use crate::error::Result;
use crate::field::{Field, FieldType, Instance};
use crate::filter::{CompiledCondition, FilterTree};
use crate::registry::Source;

/// Rows fetched per cursor round trip
pub const FETCH_BATCH_SIZE: usize = 100;

/// Maximum number of values returned by [`QueryExecutor::nominal_values`]
pub const NOMINAL_VALUES_LIMIT: u64 = 128;

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending (default)
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl SortDirection {
    /// `"desc"` (any case) is descending; anything else ascending
    pub fn from_wire(s: Option<&str>) -> Self {
        match s {
            Some(s) if s.eq_ignore_ascii_case("desc") => Self::Desc,
            _ => Self::Asc,
        }
    }
}

/// Parameters of a streaming query
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Row filter
    pub filter: Option<FilterTree>,
    /// Field to order by
    pub order_by: Option<i64>,
    /// Order direction
    pub direction: SortDirection,
    /// Rows to skip; ignored unless positive
    pub skip: i64,
    /// Maximum rows; ignored unless positive
    pub limit: i64,
    /// Fields to return, in this order; `None` returns every field
    pub projection: Option<Vec<i64>>,
}

impl QueryRequest {
    /// Request for every row and field
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter
    pub fn with_filter(mut self, filter: FilterTree) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set ordering
    pub fn with_order(mut self, field_index: i64, direction: SortDirection) -> Self {
        self.order_by = Some(field_index);
        self.direction = direction;
        self
    }

    /// Set offset and limit
    pub fn with_page(mut self, skip: i64, limit: i64) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }

    /// Set the projection
    pub fn with_projection(mut self, indices: Vec<i64>) -> Self {
        self.projection = Some(indices);
        self
    }
}

/// A statement ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
    /// SQL with `?` markers
    pub sql: String,
    /// Parameters in marker order
    pub params: Vec<Value>,
    /// Fields each result row maps to
    pub fields: Vec<Field>,
}

/// Runs queries, counts and nominal-value lookups against sources
#[derive(Clone)]
pub struct QueryExecutor {
    db: Database,
    batch_size: usize,
}

impl QueryExecutor {
    /// Create an executor fetching [`FETCH_BATCH_SIZE`] rows per round trip
    pub fn new(db: Database) -> Self {
        Self {
            db,
            batch_size: FETCH_BATCH_SIZE,
        }
    }

    /// Resolve projection, filter, ordering and paging into a statement
    pub fn prepare(&self, source: &Source, request: &QueryRequest) -> PreparedQuery {
        let dialect = self.db.dialect();

        let projected: Vec<Field> = request
            .projection
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|&i| source.field(i).cloned())
            .collect();

        let (fields, columns) = if projected.is_empty() {
            (source.fields().to_vec(), Vec::new())
        } else {
            let columns = projected.iter().map(|f| f.name.clone()).collect();
            (projected, columns)
        };
        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();

        let condition =
            CompiledCondition::from_filter(request.filter.as_ref(), source.fields(), dialect);
        let where_clause = (!condition.is_empty()).then_some(condition.sql.as_str());

        let order_by = request
            .order_by
            .and_then(|i| source.field(i))
            .map(|f| (f.name.as_str(), request.direction == SortDirection::Asc));

        let sql = dialect.build_select(
            source.table(),
            &column_refs,
            where_clause,
            order_by,
            positive(request.limit),
            positive(request.skip),
        );

        PreparedQuery {
            sql,
            params: condition.params,
            fields,
        }
    }

    /// Stream matching rows of `source`.
    ///
    /// `on_schema` runs once, after the cursor is open and before the first
    /// row, with the fields rows map to. `on_row` runs once per row. Returns
    /// the number of rows delivered.
    ///
    /// The cursor is closed on success and on error. If this future is
    /// dropped midway, the pool discards the connection rather than reuse a
    /// session that may still hold the cursor's transaction.
    pub async fn query<S, R>(
        &self,
        source: &Source,
        request: &QueryRequest,
        on_schema: S,
        mut on_row: R,
    ) -> Result<u64>
    where
        S: FnOnce(&[Field]) + Send,
        R: FnMut(Instance) + Send,
    {
        let prepared = self.prepare(source, request);
        let (sql, params) = self.db.dialect().render(&prepared.sql, prepared.params)?;

        let conn = self.db.pool().get().await?;
        let mut cursor = conn.open_cursor(&sql, &params).await?;

        on_schema(&prepared.fields);

        let pumped = self
            .pump(&mut cursor, &prepared.fields, &mut on_row)
            .await;
        let closed = cursor.close().await;

        let delivered = pumped?;
        closed?;

        debug!(
            table = %source.table(),
            rows = delivered,
            "query completed"
        );
        Ok(delivered)
    }

    async fn pump<R>(
        &self,
        cursor: &mut PooledCursor<'_>,
        fields: &[Field],
        on_row: &mut R,
    ) -> Result<u64>
    where
        R: FnMut(Instance) + Send,
    {
        let mut delivered = 0u64;
        loop {
            let rows = cursor.fetch(self.batch_size).await?;
            let fetched = rows.len();
            for row in &rows {
                on_row(Instance::from_row(fields, row));
            }
            delivered += fetched as u64;
            if fetched < self.batch_size {
                return Ok(delivered);
            }
        }
    }

    /// Collect matching rows into memory
    pub async fn query_all(&self, source: &Source, request: &QueryRequest) -> Result<Vec<Instance>> {
        let mut rows = Vec::new();
        self.query(source, request, |_| {}, |i| rows.push(i)).await?;
        Ok(rows)
    }

    /// Number of rows matching `filter`
    pub async fn count(&self, source: &Source, filter: Option<&FilterTree>) -> Result<u64> {
        let dialect = self.db.dialect();
        let condition = CompiledCondition::from_filter(filter, source.fields(), dialect);

        let mut sql = format!(
            "SELECT COUNT(*) FROM {}",
            dialect.quote_identifier(source.table())
        );
        if !condition.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&condition.sql);
        }

        let (sql, params) = dialect.render(&sql, condition.params)?;
        let conn = self.db.pool().get().await?;
        let count = conn
            .query_one(&sql, &params)
            .await?
            .and_then(|row| row.get(0).and_then(Value::as_i64))
            .unwrap_or(0);

        Ok(count.max(0) as u64)
    }

    /// Up to [`NOMINAL_VALUES_LIMIT`] distinct values of a nominal field.
    ///
    /// `text_query` restricts results to a case-insensitive prefix; `filter`
    /// is combined with `AND`. Returns nothing for invalid or non-nominal
    /// fields.
    pub async fn nominal_values(
        &self,
        source: &Source,
        filter: Option<&FilterTree>,
        feature: i64,
        text_query: Option<&str>,
    ) -> Result<Vec<String>> {
        let Some(field) = source
            .field(feature)
            .filter(|f| f.field_type == FieldType::Nominal)
        else {
            return Ok(Vec::new());
        };

        let dialect = self.db.dialect();
        let column = dialect.quote_identifier(&field.name);
        let mut params = Vec::new();

        let mut sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL",
            col = column,
            table = dialect.quote_identifier(source.table())
        );

        if let Some(prefix) = text_query.filter(|q| !q.is_empty()) {
            sql.push_str(&format!(
                " AND LOWER({}) LIKE LOWER(?) ESCAPE '\\'",
                column
            ));
            params.push(Value::String(format!("{}%", escape_like_pattern(prefix))));
        }

        let condition = CompiledCondition::from_filter(filter, source.fields(), dialect);
        if !condition.is_empty() {
            sql.push_str(&format!(" AND ({})", condition.sql));
            params.extend(condition.params);
        }

        sql.push_str(&format!(" ORDER BY {}", column));
        sql.push_str(&dialect.limit_offset_sql(Some(NOMINAL_VALUES_LIMIT), None));

        let (sql, params) = dialect.render(&sql, params)?;
        let conn = self.db.pool().get().await?;
        let rows = conn.query(&sql, &params).await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get(0).and_then(Value::as_string))
            .collect())
    }
}

fn positive(n: i64) -> Option<u64> {
    (n > 0).then_some(n as u64)
}
