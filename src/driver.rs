use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::database::Database;
use crate::error::DbError;
use crate::options::PoolOptions;
use crate::value::{ColumnType, Value};

/// 数据库驱动：按 URL scheme 注册的连接工厂
/// Scheme-bound factory producing connections and parsing its own URL
/// parameters.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The URL scheme this driver is registered under.
    fn scheme(&self) -> &str;

    /// Pool configuration parsed from the URL query parameters.
    ///
    /// The default recognizes the standard pool keys; drivers override this
    /// to change defaults. Keys the pool does not recognize stay in the URI
    /// for [`Driver::build_connection`] to read.
    fn pool_options(&self, params: &HashMap<String, String>) -> Result<PoolOptions, DbError> {
        PoolOptions::from_params(params)
    }

    /// Build one new live connection for `db`. Called whenever the pool
    /// grows; connection details come from `db.uri()`.
    async fn build_connection(&self, db: &Database) -> Result<Arc<dyn Connection>, DbError>;
}

/// 一次到后端数据库的会话
/// One live session to a backing database. The holder of the current
/// checkout is the only mutator; drivers keep any internal state behind
/// their own locks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Prepare `query` on this connection. The returned statement is bound
    /// to this connection for the connection's lifetime.
    async fn build_statement(&self, query: &str) -> Result<Arc<dyn Statement>, DbError>;

    /// Cheap liveness check consulted when the connection returns to the
    /// pool; it must not block. A connection interrupted or desynchronized
    /// mid-operation must report `false` so the pool discards it.
    fn is_valid(&self) -> bool;

    async fn close(&self) -> Result<(), DbError>;
}

/// A prepared statement on one specific connection.
#[async_trait]
pub trait Statement: Send + Sync {
    /// Execute with `args`, producing a row cursor.
    async fn query(&self, args: &[Value]) -> Result<Box<dyn ResultSet>, DbError>;

    /// Execute with `args`, producing no cursor.
    async fn exec(&self, args: &[Value]) -> Result<ExecResult, DbError>;

    async fn close(&self) -> Result<(), DbError>;
}

/// Outcome of a statement execution that produced no cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// Forward cursor over rows.
///
/// The cursor starts positioned before the first row; [`ResultSet::value`]
/// is only meaningful after `move_next` returned `true`.
#[async_trait]
pub trait ResultSet: Send {
    /// Advance to the next row. `false` once the cursor is exhausted.
    async fn move_next(&mut self) -> Result<bool, DbError>;

    fn column_count(&self) -> usize;

    fn column_name(&self, idx: usize) -> &str;

    fn column_type(&self, idx: usize) -> ColumnType;

    /// Raw value of column `idx` in the current row, normalized into the
    /// framework [`Value`] set.
    fn value(&self, idx: usize) -> Result<Value, DbError>;

    async fn close(&mut self) -> Result<(), DbError>;
}
