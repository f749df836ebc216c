use std::sync::Arc;

use crate::driver::{ResultSet, Statement};
use crate::error::DbError;
use crate::pool::PoolGuard;
use crate::value::{ColumnType, FromValue, Value};

/// One materialized row, detached from its cursor.
///
/// Column order is the driver's; reads go through [`FromValue`] so the
/// conversion rules match [`Rows::read`].
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_name(&self, idx: usize) -> &str {
        &self.columns[idx]
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Typed read by column index.
    pub fn get<T: FromValue>(&self, idx: usize) -> Result<T, DbError> {
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| DbError::General(format!("no column {}", idx)))?;
        T::from_value(value)
    }

    /// Typed read by column name.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T, DbError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| DbError::General(format!("no column named {}", name)))?;
        T::from_value(&self.values[idx])
    }
}

/// 把一行映射为目标类型
/// Maps one materialized [`Row`] into a caller type; what
/// `Database::query_as` collects.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, DbError>;
}

/// Forward cursor surfaced to callers.
///
/// Keeps the driver statement and the leased connection alive until the
/// cursor is closed; the connection returns to the pool on [`Rows::close`],
/// or on drop as a backstop.
pub struct Rows {
    inner: Box<dyn ResultSet>,
    // Held so the driver statement outlives its open cursor.
    _stmt: Arc<dyn Statement>,
    guard: Option<PoolGuard>,
}

impl Rows {
    pub(crate) fn new(inner: Box<dyn ResultSet>, stmt: Arc<dyn Statement>, guard: PoolGuard) -> Self {
        Self {
            inner,
            _stmt: stmt,
            guard: Some(guard),
        }
    }

    /// Advance to the next row. `false` once the cursor is exhausted.
    pub async fn move_next(&mut self) -> Result<bool, DbError> {
        self.inner.move_next().await
    }

    pub fn column_count(&self) -> usize {
        self.inner.column_count()
    }

    pub fn column_name(&self, idx: usize) -> &str {
        self.inner.column_name(idx)
    }

    pub fn column_type(&self, idx: usize) -> ColumnType {
        self.inner.column_type(idx)
    }

    /// Raw value of column `idx` in the current row.
    pub fn value(&self, idx: usize) -> Result<Value, DbError> {
        self.inner.value(idx)
    }

    /// Typed read of column `idx` in the current row.
    pub fn read<T: FromValue>(&self, idx: usize) -> Result<T, DbError> {
        T::from_value(&self.inner.value(idx)?)
    }

    /// Materialize the current row.
    pub fn row(&self) -> Result<Row, DbError> {
        let count = self.column_count();
        let mut columns = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            columns.push(self.column_name(i).to_string());
            values.push(self.inner.value(i)?);
        }
        Ok(Row { columns, values })
    }

    /// Close the cursor and return the connection to the pool.
    pub async fn close(&mut self) -> Result<(), DbError> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let result = self.inner.close().await;
        if let Err(e) = &result {
            if e.is_retryable() {
                guard.mark_broken();
            }
        }
        guard.release().await;
        result
    }
}
