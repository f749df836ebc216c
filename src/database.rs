use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::debug;
use tokio::sync::Mutex;
use url::Url;

use crate::driver::{Connection, Driver, ExecResult};
use crate::error::DbError;
use crate::options::PoolOptions;
use crate::pool::{ConnectionFactory, Pool};
use crate::rows::{FromRow, Rows};
use crate::statement::PoolStatement;
use crate::value::Value;

/// Hook run on every connection right after the driver builds it, and
/// re-applied to the available connections whenever it is (re)installed.
pub type ConnectionHook =
    Arc<dyn Fn(Arc<dyn Connection>) -> BoxFuture<'static, Result<(), DbError>> + Send + Sync>;

/// 数据库门面：一个连接池 + 一个语句缓存 + 一个驱动
/// Ties the pool, the statement cache and the driver together. Cheap to
/// clone; all clones share the same pool.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

struct DatabaseInner {
    driver: Arc<dyn Driver>,
    uri: Url,
    pool: Pool,
    statements: Mutex<HashMap<String, Arc<PoolStatement>>>,
    setup_hook: Mutex<Option<ConnectionHook>>,
    closed: AtomicBool,
}

// The pool's factory captures the database by non-owning back-reference;
// everything else in the ownership graph is tree-structured.
struct PoolConnectionFactory {
    db: std::sync::Weak<DatabaseInner>,
}

#[async_trait]
impl ConnectionFactory for PoolConnectionFactory {
    async fn build(&self) -> Result<Arc<dyn Connection>, DbError> {
        let inner = self.db.upgrade().ok_or(DbError::PoolClosed)?;
        let db = Database {
            inner: inner.clone(),
        };
        let conn = inner.driver.build_connection(&db).await?;
        let hook = inner.setup_hook.lock().await.clone();
        if let Some(hook) = hook {
            hook(conn.clone()).await?;
        }
        Ok(conn)
    }
}

impl Database {
    /// Two-phase construction: the inner handle is created with a pool whose
    /// factory holds a weak back-reference, then the pool is warmed.
    pub(crate) async fn new(
        driver: Arc<dyn Driver>,
        uri: Url,
        options: PoolOptions,
    ) -> Result<Database, DbError> {
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<DatabaseInner>| DatabaseInner {
            driver,
            uri,
            pool: Pool::new(
                options,
                Arc::new(PoolConnectionFactory { db: weak.clone() }),
            ),
            statements: Mutex::new(HashMap::new()),
            setup_hook: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let db = Database { inner };
        db.inner.pool.warm().await?;
        Ok(db)
    }

    /// Parsed connection URI. Pool params live in its query string alongside
    /// any driver-specific keys.
    pub fn uri(&self) -> &Url {
        &self.inner.uri
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(DbError::PoolClosed)
        } else {
            Ok(())
        }
    }

    /// Scoped checkout: `body` runs with a leased connection and the lease
    /// returns to the pool on every exit path, including cancellation.
    pub async fn using_connection<T, F, Fut>(&self, body: F) -> Result<T, DbError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        self.ensure_open()?;
        let guard = self.inner.pool.checkout().await?;
        let result = body(guard.connection()).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                guard.mark_broken();
            }
        }
        guard.release().await;
        result
    }

    /// 预编译语句，按 SQL 文本缓存
    /// The same query text returns the same pool statement.
    pub async fn prepare(&self, query: &str) -> Result<Arc<PoolStatement>, DbError> {
        self.ensure_open()?;
        let mut statements = self.inner.statements.lock().await;
        if let Some(stmt) = statements.get(query) {
            return Ok(stmt.clone());
        }
        let stmt = Arc::new(PoolStatement::new(
            query.to_string(),
            self.inner.pool.clone(),
        ));
        statements.insert(query.to_string(), stmt.clone());
        Ok(stmt)
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, DbError> {
        let start = Instant::now();
        let stmt = self.prepare(sql).await?;
        let result = stmt.query(args).await;
        let elapsed_ms = start.elapsed().as_millis();
        let err = result.as_ref().err().map(|e| e.to_string());
        debug!("query: sql={}, elapsed_ms={}, error={:?}", sql, elapsed_ms, err);
        result
    }

    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        let start = Instant::now();
        let stmt = self.prepare(sql).await?;
        let result = stmt.exec(args).await;
        let elapsed_ms = start.elapsed().as_millis();
        let affected = result.as_ref().ok().map(|r| r.rows_affected);
        let err = result.as_ref().err().map(|e| e.to_string());
        debug!(
            "exec: sql={}, elapsed_ms={}, affected={:?}, error={:?}",
            sql, elapsed_ms, affected, err
        );
        result
    }

    /// First column of the first row, or `Value::Null` when the result is
    /// empty.
    pub async fn scalar(&self, sql: &str, args: &[Value]) -> Result<Value, DbError> {
        let mut rows = self.query(sql, args).await?;
        let value = if rows.move_next().await? {
            rows.value(0)?
        } else {
            Value::Null
        };
        rows.close().await?;
        Ok(value)
    }

    /// 查询并把每一行映射为 R
    pub async fn query_as<R>(&self, sql: &str, args: &[Value]) -> Result<Vec<R>, DbError>
    where
        R: FromRow,
    {
        let mut rows = self.query(sql, args).await?;
        let mut out = Vec::new();
        while rows.move_next().await? {
            out.push(R::from_row(&rows.row()?)?);
        }
        rows.close().await?;
        Ok(out)
    }

    /// Replay `body` on retryable failures, per the pool's retry options.
    pub async fn retry<T, F, Fut>(&self, body: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        self.ensure_open()?;
        self.inner.pool.retry(body).await
    }

    /// Install the connection setup hook and apply it to every currently
    /// available connection.
    pub async fn setup_connection<F>(&self, hook: F) -> Result<(), DbError>
    where
        F: Fn(Arc<dyn Connection>) -> BoxFuture<'static, Result<(), DbError>>
            + Send
            + Sync
            + 'static,
    {
        self.ensure_open()?;
        let hook: ConnectionHook = Arc::new(hook);
        *self.inner.setup_hook.lock().await = Some(hook.clone());
        self.inner.pool.each_resource(move |conn| hook(conn)).await
    }

    /// Close every cached pool statement, clear the cache, close the pool.
    /// Every subsequent operation fails with `PoolClosed`. Idempotent.
    pub async fn close(&self) -> Result<(), DbError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let statements: Vec<Arc<PoolStatement>> = {
            let mut statements = self.inner.statements.lock().await;
            statements.drain().map(|(_, stmt)| stmt).collect()
        };
        for stmt in statements {
            stmt.close().await;
        }
        self.inner.pool.close().await;
        Ok(())
    }
}
