//! Chunked `INSERT OR REPLACE` writer.
//!
//! SQLite rejects statements with more bound parameters than its compile-time
//! limit, so rows are split into batches of `ceiling / columns` rows each.
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, instrument};

use crate::error::SyncError;
use crate::model::TableRow;

/// Bound-parameter ceiling of a default SQLite build (`SQLITE_MAX_VARIABLE_NUMBER`).
pub const SQLITE_MAX_VARIABLES: usize = 999;

/// A dynamically typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(value: Option<&str>) -> Self {
        value.map(SqlValue::from).unwrap_or(SqlValue::Null)
    }
}

#[derive(Debug, Clone)]
pub struct BatchUpsert {
    table: String,
    columns: Vec<String>,
    ceiling: usize,
}

impl BatchUpsert {
    pub fn new(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ceiling: SQLITE_MAX_VARIABLES,
        }
    }

    /// Writer for the table owned by `T`.
    pub fn for_row<T: TableRow>() -> Self {
        Self::new(T::TABLE, T::COLUMNS)
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Rows per statement, never below one.
    pub fn batch_size(&self) -> usize {
        (self.ceiling / self.columns.len().max(1)).max(1)
    }

    fn validate(&self, rows: &[Vec<SqlValue>]) -> Result<(), SyncError> {
        if self.columns.len() > self.ceiling {
            return Err(SyncError::BatchTooWide {
                table: self.table.clone(),
                columns: self.columns.len(),
                ceiling: self.ceiling,
            });
        }
        if let Some((row, values)) = rows
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != self.columns.len())
        {
            return Err(SyncError::RowWidth {
                table: self.table.clone(),
                row,
                got: values.len(),
                expected: self.columns.len(),
            });
        }
        Ok(())
    }

    fn statement_prefix(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        format!(
            "INSERT OR REPLACE INTO \"{}\" ({}) ",
            self.table,
            columns.join(", ")
        )
    }

    /// Writes `rows` and returns the number of statements executed.
    ///
    /// Every row is validated before the first statement runs, so a width
    /// violation performs no writes.
    #[instrument(skip_all, fields(table = %self.table, rows = rows.len()))]
    pub async fn execute(
        &self,
        conn: &mut SqliteConnection,
        rows: &[Vec<SqlValue>],
    ) -> Result<usize, SyncError> {
        self.validate(rows)?;
        let mut statements = 0;
        for chunk in rows.chunks(self.batch_size()) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(self.statement_prefix());
            builder.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        SqlValue::Text(s) => b.push_bind(s.clone()),
                        SqlValue::Int(i) => b.push_bind(*i),
                        SqlValue::Bool(v) => b.push_bind(*v),
                        SqlValue::Null => b.push_bind(None::<String>),
                    };
                }
            });
            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(SyncError::storage("upsert", self.table.clone()))?;
            statements += 1;
        }
        debug!(statements, "batch upsert complete");
        Ok(statements)
    }

    /// Convenience wrapper taking typed rows.
    pub async fn execute_rows<T: TableRow>(
        &self,
        conn: &mut SqliteConnection,
        rows: &[T],
    ) -> Result<usize, SyncError> {
        let values: Vec<Vec<SqlValue>> = rows.iter().map(TableRow::values).collect();
        self.execute(conn, &values).await
    }
}
