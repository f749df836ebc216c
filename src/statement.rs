use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use crate::driver::{ExecResult, Statement};
use crate::error::DbError;
use crate::pool::{ConnEntry, Pool, PoolGuard};
use crate::rows::Rows;
use crate::value::Value;

/// 池化预编译语句：一条 SQL 在整个池上的缓存前端
///
/// What callers hold instead of a physical prepared statement. Keeps at most
/// one weakly-referenced driver statement per pooled connection and
/// re-prepares on whichever connection the pool hands out. Strong ownership
/// of each driver statement lives on its connection, so the cache never pins
/// a connection the pool has decided to discard.
pub struct PoolStatement {
    query: String,
    pool: Pool,
    cache: Mutex<HashMap<u64, CachedStatement>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PoolStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolStatement").field("query", &self.query).finish_non_exhaustive()
    }
}

struct CachedStatement {
    conn: Weak<ConnEntry>,
    stmt: Weak<dyn Statement>,
}

impl PoolStatement {
    pub(crate) fn new(query: String, pool: Pool) -> Self {
        Self {
            query,
            pool,
            cache: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn query_string(&self) -> &str {
        &self.query
    }

    /// Execute with no cursor; the connection returns to the pool
    /// immediately.
    pub async fn exec(&self, args: &[Value]) -> Result<ExecResult, DbError> {
        let (guard, stmt) = self.bound_statement().await?;
        let result = stmt.exec(args).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                guard.mark_broken();
            }
        }
        guard.release().await;
        result
    }

    /// Execute producing a cursor; the connection stays leased until the
    /// returned [`Rows`] is closed.
    pub async fn query(&self, args: &[Value]) -> Result<Rows, DbError> {
        let (guard, stmt) = self.bound_statement().await?;
        match stmt.query(args).await {
            Ok(rs) => Ok(Rows::new(rs, stmt, guard)),
            Err(e) => {
                if e.is_retryable() {
                    guard.mark_broken();
                }
                guard.release().await;
                Err(e)
            }
        }
    }

    /// Check out a connection, preferring one this statement is already
    /// prepared on, and return the driver statement bound to it.
    async fn bound_statement(&self) -> Result<(PoolGuard, Arc<dyn Statement>), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }
        let candidates: Vec<Weak<ConnEntry>> = {
            let mut cache = self.cache.lock().await;
            // Prune stale back-references. Dropping a weak never closes a
            // live statement.
            cache.retain(|_, c| c.conn.strong_count() > 0 && c.stmt.strong_count() > 0);
            cache.values().map(|c| c.conn.clone()).collect()
        };
        let (guard, reused) = self.pool.checkout_some(&candidates).await?;
        if reused {
            let cached = self
                .cache
                .lock()
                .await
                .get(&guard.id())
                .and_then(|c| c.stmt.upgrade());
            if let Some(stmt) = cached {
                return Ok((guard, stmt));
            }
        }
        let stmt = match guard.connection().build_statement(&self.query).await {
            Ok(stmt) => stmt,
            Err(e) => {
                if e.is_retryable() {
                    guard.mark_broken();
                }
                guard.release().await;
                return Err(e);
            }
        };
        guard.entry().own_statement(&self.query, stmt.clone()).await;
        self.cache.lock().await.insert(
            guard.id(),
            CachedStatement {
                conn: Arc::downgrade(guard.entry()),
                stmt: Arc::downgrade(&stmt),
            },
        );
        Ok((guard, stmt))
    }

    /// Invalidate once the owning database closes.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cache.lock().await.clear();
    }
}
