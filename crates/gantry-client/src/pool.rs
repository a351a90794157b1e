//! Bounded connection pool
//!
//! A semaphore bounds the number of checked-out connections to
//! `max_connections`. Idle connections wait in a queue and a new connection is
//! dialed only when the queue is empty, so the number of open connections
//! (idle plus checked out) never exceeds the bound.

use crate::config::PoolConfig;
use crate::error::{DialError, PoolError};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Opens connections for a [`Pool`]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection
    fn dial(&self) -> impl Future<Output = Result<Self::Connection, DialError>> + Send;

    /// Whether an idle connection can still carry a call
    fn is_reusable(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out
    pub open: usize,
    /// Idle connections
    pub idle: usize,
    /// Configured bound
    pub max_size: usize,
}

struct PoolInner<D: Dialer> {
    dialer: D,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<D::Connection>>,
    open: AtomicUsize,
}

impl<D: Dialer> PoolInner<D> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<D::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, conn: D::Connection, reuse: bool) {
        if reuse && !self.permits.is_closed() {
            self.idle().push_back(conn);
        } else {
            self.open.fetch_sub(1, Ordering::SeqCst);
            drop(conn);
        }
    }
}

/// Bounded pool of connections opened by a [`Dialer`]
pub struct Pool<D: Dialer> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Dialer> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> Pool<D> {
    pub fn new(dialer: D, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                dialer,
                config: PoolConfig {
                    max_connections: max,
                    ..config
                },
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                open: AtomicUsize::new(0),
            }),
        }
    }

    pub fn dialer(&self) -> &D {
        &self.inner.dialer
    }

    /// Check out a connection, dialing one when none is idle
    ///
    /// Waits at most `acquire_timeout` for a free slot.
    pub async fn acquire(&self) -> Result<Pooled<D>, PoolError> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = tokio::time::timeout(self.inner.config.acquire_timeout(), permits.acquire_owned())
            .await
            .map_err(|_| PoolError::Timeout)?
            .map_err(|_| PoolError::Closed)?;

        loop {
            let Some(conn) = self.inner.idle().pop_front() else {
                break;
            };
            if self.inner.dialer.is_reusable(&conn) {
                return Ok(Pooled::new(conn, Arc::clone(&self.inner), permit));
            }
            debug!("Dropping stale pooled connection");
            self.inner.release(conn, false);
        }

        self.inner.open.fetch_add(1, Ordering::SeqCst);
        match self.inner.dialer.dial().await {
            Ok(conn) => Ok(Pooled::new(conn, Arc::clone(&self.inner), permit)),
            Err(err) => {
                self.inner.open.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Dial(err))
            }
        }
    }

    /// Close the pool: idle connections are dropped, checked-out connections
    /// are dropped when returned and further acquires fail
    pub fn close(&self) {
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        self.inner.open.fetch_sub(drained.len(), Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            open: self.inner.open.load(Ordering::SeqCst),
            idle: self.inner.idle().len(),
            max_size: self.inner.config.max_connections,
        }
    }
}

/// A checked-out connection
///
/// Goes back to the pool on drop, unless it was discarded or a call on it was
/// left unfinished.
pub struct Pooled<D: Dialer> {
    conn: Option<D::Connection>,
    pool: Arc<PoolInner<D>>,
    in_flight: bool,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<D: Dialer> Pooled<D> {
    fn new(conn: D::Connection, pool: Arc<PoolInner<D>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            in_flight: false,
            discard: false,
            _permit: permit,
        }
    }

    /// Mark a call as started; dropping before [`finish`](Self::finish)
    /// discards the connection
    pub fn begin(&mut self) {
        self.in_flight = true;
    }

    /// Mark the current call as completed
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    /// Never reuse this connection
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<D: Dialer> Deref for Pooled<D> {
    type Target = D::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is only taken on drop")
    }
}

impl<D: Dialer> DerefMut for Pooled<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is only taken on drop")
    }
}

impl<D: Dialer> Drop for Pooled<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let reuse = !self.discard && !self.in_flight;
            if !reuse {
                debug!("Discarding pooled connection (in flight: {})", self.in_flight);
            }
            self.pool.release(conn, reuse);
        }
    }
}
