use rusqlite::{Connection, OpenFlags};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracevault_types::{EngineConfig, Error, Result};

use crate::schema::{configure_connection, init_schema};

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    /// Named shared-cache in-memory database; lives while a connection holds it.
    Memory(String),
}

struct IdleConn {
    conn: Connection,
    since: Instant,
}

struct Inner {
    idle: Vec<IdleConn>,
    /// Connections currently open, idle or handed out. Never exceeds pool_size.
    open_count: usize,
    /// Keeps a shared in-memory database alive for the pool's lifetime.
    /// Lives under the mutex: `Connection` is not `Sync`, so it must not
    /// sit directly on the shared struct.
    anchor: Option<Connection>,
}

/// Bounded connection pool. The single point of serialized access to the
/// store: callers acquire, use, and drop the guard; acquisition past
/// capacity blocks up to the configured timeout and then fails.
pub struct ConnectionPool {
    target: Target,
    config: EngineConfig,
    inner: Mutex<Inner>,
    available: Condvar,
}

impl ConnectionPool {
    pub fn open(path: &Path, config: EngineConfig) -> Result<Arc<Self>> {
        Self::build(Target::File(path.to_path_buf()), config)
    }

    /// Shared in-memory pool for tests; all pooled connections see the same
    /// database.
    pub fn open_in_memory(config: EngineConfig) -> Result<Arc<Self>> {
        let name = format!(
            "tracevault-mem-{}",
            MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self::build(Target::Memory(name), config)
    }

    fn build(target: Target, config: EngineConfig) -> Result<Arc<Self>> {
        let pool = Self {
            target,
            config,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                open_count: 0,
                anchor: None,
            }),
            available: Condvar::new(),
        };

        // First connection initializes the schema; for the in-memory target
        // it is also retained so the database outlives pooled connections.
        let conn = pool.open_connection()?;
        init_schema(&conn)?;
        if matches!(pool.target, Target::Memory(_)) {
            if let Ok(mut inner) = pool.inner.lock() {
                inner.anchor = Some(conn);
            }
        }

        Ok(Arc::new(pool))
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = match &self.target {
            Target::File(path) => Connection::open(path)
                .map_err(|e| Error::Connection(format!("{}: {}", path.display(), e)))?,
            Target::Memory(name) => Connection::open_with_flags(
                format!("file:{}?mode=memory&cache=shared", name),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| Error::Connection(format!("in-memory '{}': {}", name, e)))?,
        };

        configure_connection(&conn, self.config.query_timeout_ms)?;
        conn.set_prepared_statement_cache_capacity(self.config.statement_cache_size);
        Ok(conn)
    }

    /// Acquire a connection, waiting up to the configured timeout for one to
    /// free up or for headroom to open a new one.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.config.connection_timeout();

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Connection("pool mutex poisoned".to_string()))?;

        loop {
            if let Some(idle) = inner.idle.pop() {
                return Ok(PooledConnection::new(Arc::clone(self), idle.conn));
            }

            if inner.open_count < self.config.pool_size {
                inner.open_count += 1;
                drop(inner);

                match self.open_connection() {
                    Ok(conn) => return Ok(PooledConnection::new(Arc::clone(self), conn)),
                    Err(e) => {
                        let mut inner = self
                            .inner
                            .lock()
                            .map_err(|_| Error::Connection("pool mutex poisoned".to_string()))?;
                        inner.open_count -= 1;
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectionTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let (guard, _timeout) = self
                .available
                .wait_timeout(inner, deadline - now)
                .map_err(|_| Error::Connection("pool mutex poisoned".to_string()))?;
            inner = guard;
        }
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        self.available.notify_one();
    }

    /// Close idle connections older than `max_age`, keeping at least `floor`
    /// connections open. Used by both the routine cleanup cycle and the
    /// forced memory-pressure path (which passes a zero max_age).
    pub fn close_idle(&self, max_age: Duration, floor: usize) -> usize {
        let mut closed = 0;
        if let Ok(mut inner) = self.inner.lock() {
            let mut keep = Vec::new();
            // Oldest first so the floor retains the most recently used.
            inner.idle.sort_by_key(|c| c.since);
            let mut open = inner.open_count;
            for idle in inner.idle.drain(..) {
                if open > floor && idle.since.elapsed() >= max_age {
                    open -= 1;
                    closed += 1;
                    // Connection dropped here.
                } else {
                    keep.push(idle);
                }
            }
            inner.idle = keep;
            inner.open_count = open;
        }
        closed
    }

    /// 30% of pool size, the minimum kept open during forced cleanup.
    pub fn idle_floor(&self) -> usize {
        ((self.config.pool_size as f64) * 0.3).ceil() as usize
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().map(|i| i.open_count).unwrap_or(0)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().map(|i| i.idle.len()).unwrap_or(0)
    }

    /// Fraction of the pool currently handed out.
    pub fn utilization(&self) -> f64 {
        match self.inner.lock() {
            Ok(inner) => {
                (inner.open_count.saturating_sub(inner.idle.len())) as f64
                    / self.config.pool_size.max(1) as f64
            }
            Err(_) => 0.0,
        }
    }
}

/// RAII guard over a pooled connection; returns it to the idle set on drop.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(pool_size: usize, timeout_ms: u64) -> EngineConfig {
        EngineConfig {
            pool_size,
            connection_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    // The pool is shared across timer threads behind an Arc; the in-memory
    // anchor connection must not break that.
    #[test]
    fn test_pool_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectionPool>();
        assert_send_sync::<Arc<ConnectionPool>>();
    }

    #[test]
    fn test_acquire_and_release() {
        let pool = ConnectionPool::open_in_memory(small_config(2, 100)).unwrap();

        let conn = pool.acquire().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
        drop(conn);

        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_pool_never_exceeds_capacity() {
        let pool = ConnectionPool::open_in_memory(small_config(2, 50)).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.open_count(), 2);

        // Third acquisition times out instead of over-allocating.
        match pool.acquire() {
            Ok(_) => panic!("acquisition past capacity should time out"),
            Err(e) => assert!(matches!(e, Error::ConnectionTimeout { .. })),
        }

        drop(a);
        drop(b);
    }

    #[test]
    fn test_waiter_gets_released_connection() {
        let pool = ConnectionPool::open_in_memory(small_config(1, 2_000)).unwrap();
        let held = pool.acquire().unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || pool2.acquire().map(|_| ()));

        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_close_idle_respects_floor() {
        let pool = ConnectionPool::open_in_memory(small_config(3, 100)).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle_count(), 3);

        let closed = pool.close_idle(Duration::ZERO, pool.idle_floor());
        assert_eq!(pool.open_count(), pool.idle_floor());
        assert_eq!(closed, 3 - pool.idle_floor());
    }

    #[test]
    fn test_pooled_connections_share_database() {
        let pool = ConnectionPool::open_in_memory(small_config(2, 100)).unwrap();

        let conn = pool.acquire().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, agent_type, mode, start_time)
             VALUES ('s1', 'claude', 'code', '2026-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        drop(conn);

        let other = pool.acquire().unwrap();
        let n: i64 = other
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
