use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::driver::{Connection, Statement};
use crate::error::DbError;
use crate::options::PoolOptions;

/// Builds one new connection when the pool grows.
///
/// The database facade implements this with a non-owning back-reference to
/// itself so driver construction and the setup hook run outside the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn build(&self) -> Result<Arc<dyn Connection>, DbError>;
}

/// One pooled connection plus the bookkeeping the statement cache keys on.
pub struct ConnEntry {
    id: u64,
    raw: Arc<dyn Connection>,
    broken: AtomicBool,
    // Strong owner of the driver statements prepared on this connection,
    // keyed by query text. Discarding the entry drops them.
    statements: Mutex<HashMap<String, Arc<dyn Statement>>>,
}

impl ConnEntry {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.raw.clone()
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) async fn own_statement(&self, query: &str, stmt: Arc<dyn Statement>) {
        self.statements
            .lock()
            .await
            .insert(query.to_string(), stmt);
    }
}

/// Counts of a pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    /// Connections created and not discarded.
    pub total: usize,
    /// Idle connections in the free set.
    pub available: usize,
    /// Connections currently checked out.
    pub in_use: usize,
}

struct PoolState {
    idle: Vec<Arc<ConnEntry>>, // LIFO
    in_use: HashSet<u64>,
    total: usize,
    closed: bool,
}

struct PoolShared {
    options: PoolOptions,
    factory: Arc<dyn ConnectionFactory>,
    // Permits bound in_use; one permit is held per checkout, so a release
    // wakes exactly one waiter, in FIFO order.
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

/// 有界连接池
/// Bounded multiset of connections shared by one database. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(options: PoolOptions, factory: Arc<dyn ConnectionFactory>) -> Self {
        let permits = match options.max_pool_size {
            0 => Semaphore::MAX_PERMITS, // unbounded
            max => max,
        };
        Self {
            shared: Arc::new(PoolShared {
                options,
                factory,
                semaphore: Arc::new(Semaphore::new(permits)),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: HashSet::new(),
                    total: 0,
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    pub async fn counts(&self) -> PoolCounts {
        let state = self.shared.state.lock().await;
        PoolCounts {
            total: state.total,
            available: state.idle.len(),
            in_use: state.in_use.len(),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    /// Eagerly build the configured initial connections into the free set.
    /// The build loop stops at the idle cap (and the pool bound): warm-up
    /// must not leave more idle connections than a release could.
    pub async fn warm(&self) -> Result<(), DbError> {
        let target = self
            .shared
            .options
            .initial_pool_size
            .min(self.shared.options.max_idle_pool_size);
        let target = match self.shared.options.max_pool_size {
            0 => target,
            max => target.min(max),
        };
        for _ in 0..target {
            let entry = self.build_entry().await?;
            let mut state = self.shared.state.lock().await;
            if state.closed {
                drop(state);
                let _ = entry.raw.close().await;
                return Err(DbError::PoolClosed);
            }
            state.total += 1;
            state.idle.push(entry);
        }
        Ok(())
    }

    async fn build_entry(&self) -> Result<Arc<ConnEntry>, DbError> {
        let raw = self.shared.factory.build().await?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("pool: built connection id={}", id);
        Ok(Arc::new(ConnEntry {
            id,
            raw,
            broken: AtomicBool::new(false),
            statements: Mutex::new(HashMap::new()),
        }))
    }

    /// Check out one connection, waiting up to `checkout_timeout` when the
    /// pool is saturated.
    pub async fn checkout(&self) -> Result<PoolGuard, DbError> {
        let (guard, _) = self.checkout_some(&[]).await?;
        Ok(guard)
    }

    /// Preferred checkout: the first candidate that is still alive and
    /// currently idle is taken and returned with `reused = true`; otherwise
    /// this behaves like [`Pool::checkout`] and returns `reused = false`.
    /// The candidate scan and the removal from the free set are atomic with
    /// respect to other checkouts.
    pub async fn checkout_some(
        &self,
        candidates: &[Weak<ConnEntry>],
    ) -> Result<(PoolGuard, bool), DbError> {
        if self.is_closed().await {
            return Err(DbError::PoolClosed);
        }
        let timeout = self.shared.options.checkout_timeout;
        let permit =
            match tokio::time::timeout(timeout, self.shared.semaphore.clone().acquire_owned())
                .await
            {
                Err(_) => return Err(DbError::PoolTimeout(timeout)),
                Ok(Err(_)) => return Err(DbError::PoolClosed),
                Ok(Ok(permit)) => permit,
            };
        self.take_with_permit(candidates, permit).await
    }

    async fn take_with_permit(
        &self,
        candidates: &[Weak<ConnEntry>],
        permit: OwnedSemaphorePermit,
    ) -> Result<(PoolGuard, bool), DbError> {
        enum Taken {
            Have(Arc<ConnEntry>, bool),
            Build,
        }

        let taken = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            let mut found = None;
            for cand in candidates {
                let Some(wanted) = cand.upgrade() else { continue };
                if let Some(pos) = state.idle.iter().position(|e| e.id == wanted.id) {
                    found = Some(state.idle.remove(pos));
                    break;
                }
            }
            match found {
                Some(entry) => {
                    state.in_use.insert(entry.id);
                    Taken::Have(entry, true)
                }
                None => match state.idle.pop() {
                    Some(entry) => {
                        state.in_use.insert(entry.id);
                        Taken::Have(entry, false)
                    }
                    None => {
                        // Reserve the slot before building so total never
                        // overshoots max_pool_size.
                        state.total += 1;
                        Taken::Build
                    }
                },
            }
        };

        match taken {
            Taken::Have(entry, reused) => Ok((self.guard(entry, permit), reused)),
            Taken::Build => match self.build_entry().await {
                Ok(entry) => {
                    let mut state = self.shared.state.lock().await;
                    if state.closed {
                        state.total -= 1;
                        drop(state);
                        let _ = entry.raw.close().await;
                        return Err(DbError::PoolClosed);
                    }
                    state.in_use.insert(entry.id);
                    drop(state);
                    Ok((self.guard(entry, permit), false))
                }
                Err(e) => {
                    self.shared.state.lock().await.total -= 1;
                    Err(e)
                }
            },
        }
    }

    fn guard(&self, entry: Arc<ConnEntry>, permit: OwnedSemaphorePermit) -> PoolGuard {
        PoolGuard {
            entry: Some(entry),
            permit: Some(permit),
            pool: self.clone(),
        }
    }

    /// Return a checked-out connection to the pool.
    pub async fn release(&self, guard: PoolGuard) {
        guard.release().await;
    }

    async fn release_entry(&self, entry: Arc<ConnEntry>, permit: Option<OwnedSemaphorePermit>) {
        let discard = {
            let mut state = self.shared.state.lock().await;
            if !state.in_use.remove(&entry.id) {
                // Releasing a connection the pool did not lend out is a
                // programmer error.
                panic!("pool: released a connection that was not checked out (id={})", entry.id);
            }
            if entry.is_broken()
                || !entry.raw.is_valid()
                || state.closed
                || state.idle.len() >= self.shared.options.max_idle_pool_size
            {
                state.total -= 1;
                true
            } else {
                state.idle.push(entry.clone());
                false
            }
        };
        if discard {
            debug!("pool: discarding connection id={}", entry.id);
            if let Err(e) = entry.raw.close().await {
                warn!("pool: error closing connection id={}: {}", entry.id, e);
            }
        }
        // The permit drops after the connection is back in the free set, so
        // the one waiter it wakes can find it.
        drop(permit);
    }

    /// Apply `visit` to every currently-available connection.
    ///
    /// Each visited connection goes through the normal checkout path, so the
    /// pool counts stay consistent throughout. A connection grabbed by a
    /// concurrent checkout between the snapshot and the visit is skipped; it
    /// is no longer available. Must not be called while the calling task
    /// holds a checkout from this pool.
    pub async fn each_resource<F, Fut>(&self, mut visit: F) -> Result<(), DbError>
    where
        F: FnMut(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<(), DbError>>,
    {
        let snapshot: Vec<Weak<ConnEntry>> = {
            let state = self.shared.state.lock().await;
            state.idle.iter().map(Arc::downgrade).collect()
        };
        for weak in snapshot {
            let Some(guard) = self.try_checkout_idle(&weak).await else {
                continue;
            };
            let result = visit(guard.connection()).await;
            guard.release().await;
            result?;
        }
        Ok(())
    }

    async fn try_checkout_idle(&self, weak: &Weak<ConnEntry>) -> Option<PoolGuard> {
        let wanted = weak.upgrade()?;
        let permit = self.shared.semaphore.clone().try_acquire_owned().ok()?;
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return None;
        }
        let pos = state.idle.iter().position(|e| e.id == wanted.id)?;
        let entry = state.idle.remove(pos);
        state.in_use.insert(entry.id);
        drop(state);
        Some(self.guard(entry, permit))
    }

    /// Run `body`, replaying retryable failures up to `retry_attempts`
    /// additional times with `retry_delay` between attempts. Non-retryable
    /// errors propagate immediately; when attempts are exhausted the final
    /// underlying error is surfaced unwrapped.
    pub async fn retry<T, F, Fut>(&self, mut body: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut remaining = self.shared.options.retry_attempts;
        loop {
            match body().await {
                Err(e) if e.is_retryable() && remaining > 0 => {
                    remaining -= 1;
                    debug!("pool: retrying after retryable error: {}", e);
                    tokio::time::sleep(self.shared.options.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    /// Quiesce the pool. New and pending checkouts fail with `PoolClosed`;
    /// idle connections are closed now. Outstanding checkouts are not waited
    /// for — their connections are closed when released. Terminal.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.total -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        self.shared.semaphore.close();
        for entry in drained {
            debug!("pool: closing connection id={}", entry.id);
            if let Err(e) = entry.raw.close().await {
                warn!("pool: error closing connection id={}: {}", entry.id, e);
            }
        }
    }
}

/// RAII lease of one pooled connection.
///
/// Release explicitly on the normal path; dropping the guard without a
/// release (task cancellation) returns the connection from a spawned task so
/// the scoped-release contract holds on every exit path.
pub struct PoolGuard {
    entry: Option<Arc<ConnEntry>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Pool,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl PoolGuard {
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.entry().connection()
    }

    /// Mark the leased connection so release discards it instead of pooling
    /// it.
    pub fn mark_broken(&self) {
        self.entry().mark_broken();
    }

    pub(crate) fn id(&self) -> u64 {
        self.entry().id
    }

    /// The pool entry behind this lease; its [`Weak`] downgrade is what
    /// [`Pool::checkout_some`] accepts as a candidate.
    pub fn entry(&self) -> &Arc<ConnEntry> {
        self.entry
            .as_ref()
            .expect("BUG: PoolGuard used after release")
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        let entry = self
            .entry
            .take()
            .expect("BUG: PoolGuard released twice");
        let permit = self.permit.take();
        let pool = self.pool.clone();
        pool.release_entry(entry, permit).await;
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let permit = self.permit.take();
            let pool = self.pool.clone();
            // During runtime shutdown there is nothing to spawn on; the
            // connection is dropped without returning to the pool, which only
            // happens after no further checkout can succeed.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.release_entry(entry, permit).await;
                });
            } else {
                warn!(
                    "pool: runtime gone during guard drop; connection id={} not returned",
                    entry.id
                );
            }
        }
    }
}
