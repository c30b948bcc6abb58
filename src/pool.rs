//!
//! Safe time-sharing of sessions across tasks.
//!
//! Since a session can only be used by one thread of control at a time, a
//! pool of sessions can be shared by multiple workers instead of creating a
//! session per worker. A session is borrowed, used, and returned on every
//! exit path, including panics unwinding out of the borrowing closure.
//!

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::connection::Connection;
use crate::error::ClientError;
use crate::requestor::Requestor;
use crate::server::Server;
use crate::session::{Consumer, Producer, Session, SessionCore, Wait};

/// Pool sizing and diagnostics. The pool only grows as needed and never
/// exceeds `pool_size`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of sessions the pool will create.
    pub pool_size: usize,
    /// How long a borrow may wait before a warning is logged. Diagnostic
    /// only; the wait itself continues.
    pub warn_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: 10,
            warn_timeout_ms: 5000,
        }
    }
}

/// A bounded pool of started sessions shared across tasks.
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connection: Connection,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Session>>,
    tracked: Mutex<Vec<Arc<SessionCore>>>,
    warn_timeout: Duration,
    closed: AtomicBool,
}

impl SessionPool {
    pub fn new(connection: &Connection, config: PoolConfig) -> Self {
        SessionPool {
            inner: Arc::new(PoolInner {
                connection: connection.clone(),
                permits: Arc::new(Semaphore::new(config.pool_size)),
                idle: Mutex::new(Vec::new()),
                tracked: Mutex::new(Vec::new()),
                warn_timeout: Duration::from_millis(config.warn_timeout_ms),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Borrow a session, creating one lazily while under the pool size.
    ///
    /// Blocks while the pool is exhausted; waits longer than the configured
    /// warn timeout are logged and continue. The session returns to the pool
    /// when the guard drops.
    pub async fn acquire(&self) -> Result<PooledSession, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ObjectClosed("session pool"));
        }
        let permit = loop {
            match timeout(
                self.inner.warn_timeout,
                self.inner.permits.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_)) => return Err(ClientError::ObjectClosed("session pool")),
                Err(_) => tracing::warn!(
                    warn_timeout_ms = self.inner.warn_timeout.as_millis() as u64,
                    "still waiting for a pooled session"
                ),
            }
        };

        let idle = self.inner.idle.lock().expect("pool state poisoned").pop();
        let session = match idle {
            Some(session) => session,
            None => {
                let session = self.inner.connection.create_session()?;
                // Started since it will be used immediately upon creation.
                session.start();
                self.inner
                    .tracked
                    .lock()
                    .expect("pool state poisoned")
                    .push(session.core().clone());
                session
            }
        };
        Ok(PooledSession {
            session: Some(session),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Borrow a session and pass it to `f`; the session returns to the pool
    /// once the guard drops, on every exit path.
    pub async fn with_session<F, Fut, T>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(PooledSession) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let session = self.acquire().await?;
        f(session).await
    }

    /// Borrow a session, create a consumer on `queue_name`, and pass both to
    /// `f`. The consumer is closed before the session returns to the pool.
    pub async fn with_consumer<F, Fut, T>(&self, queue_name: &str, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(PooledConsumer) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let session = self.acquire().await?;
        let consumer = session.create_consumer(queue_name)?;
        f(PooledConsumer { consumer, session }).await
    }

    /// Borrow a session, create a producer bound to `address`, and pass both
    /// to `f`. The producer is closed before the session returns to the pool.
    pub async fn with_producer<F, Fut, T>(&self, address: &str, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(PooledProducer) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let session = self.acquire().await?;
        let producer = session.create_producer(address)?;
        f(PooledProducer { producer, session }).await
    }

    /// Borrow a session, create a requestor against `address`, and pass both
    /// to `f`. The requestor is closed before the session returns to the
    /// pool.
    pub async fn with_requestor<F, Fut, T>(&self, address: &str, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(PooledRequestor) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let session = self.acquire().await?;
        let requestor = session.create_requestor(address)?;
        f(PooledRequestor { requestor, session }).await
    }

    /// Borrow a session, create a server on `input_queue`, and pass both to
    /// `f`. The server is closed before the session returns to the pool.
    pub async fn with_server<F, Fut, T>(
        &self,
        input_queue: &str,
        idle_timeout: Wait,
        f: F,
    ) -> Result<T, ClientError>
    where
        F: FnOnce(PooledServer) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let session = self.acquire().await?;
        let server = session.create_server(input_queue, idle_timeout)?;
        f(PooledServer { server, session }).await
    }

    /// Close every session tracked by the pool, idle or checked out, and
    /// refuse further borrows. Callers must ensure no other task is
    /// mid-operation; there is no graceful drain. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let tracked =
            std::mem::take(&mut *self.inner.tracked.lock().expect("pool state poisoned"));
        for session in tracked {
            session.close();
        }
        self.inner.idle.lock().expect("pool state poisoned").clear();
    }
}

/// Guard holding a borrowed session. Dereferences to [`Session`]; the
/// session returns to the pool when the guard drops.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session already returned")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.pool.closed.load(Ordering::SeqCst) {
                session.close();
            } else {
                self.pool
                    .idle
                    .lock()
                    .expect("pool state poisoned")
                    .push(session);
            }
        }
    }
}

macro_rules! pooled_resource {
    ($name:ident, $field:ident, $target:ty, $doc:literal) => {
        #[doc = $doc]
        pub struct $name {
            // Declared ahead of the session so it is dropped, and therefore
            // closed, before the session returns to the pool.
            $field: $target,
            session: PooledSession,
        }

        impl $name {
            pub fn session(&self) -> &Session {
                &self.session
            }
        }

        impl Deref for $name {
            type Target = $target;

            fn deref(&self) -> &$target {
                &self.$field
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut $target {
                &mut self.$field
            }
        }
    };
}

pooled_resource!(
    PooledConsumer,
    consumer,
    Consumer,
    "A consumer created on a borrowed session."
);
pooled_resource!(
    PooledProducer,
    producer,
    Producer,
    "A producer created on a borrowed session."
);
pooled_resource!(
    PooledRequestor,
    requestor,
    Requestor,
    "A requestor created on a borrowed session."
);
pooled_resource!(
    PooledServer,
    server,
    Server,
    "A server created on a borrowed session."
);

/// Tracks sessions created per worker, typically one per long-lived consumer
/// task, so a single `close` tears all of them down.
pub struct SessionManager {
    connection: Connection,
    sessions: Mutex<Vec<Arc<SessionCore>>>,
}

impl SessionManager {
    pub fn new(connection: &Connection) -> Self {
        SessionManager {
            connection: connection.clone(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Create a started session, pass it to `f`, and close and untrack it
    /// when `f` finishes, on every exit path.
    pub async fn with_session<F, Fut, T>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let session = self.connection.create_session()?;
        session.start();
        let core = session.core().clone();
        self.sessions
            .lock()
            .expect("manager state poisoned")
            .push(core.clone());
        let _guard = ManagedSession {
            manager: self,
            core,
        };
        f(session).await
    }

    /// Close all managed sessions.
    pub fn close(&self) {
        let sessions = self.sessions.lock().expect("manager state poisoned");
        for session in sessions.iter() {
            session.close();
        }
    }
}

struct ManagedSession<'a> {
    manager: &'a SessionManager,
    core: Arc<SessionCore>,
}

impl Drop for ManagedSession<'_> {
    fn drop(&mut self) {
        self.core.close();
        self.manager
            .sessions
            .lock()
            .expect("manager state poisoned")
            .retain(|core| !Arc::ptr_eq(core, &self.core));
    }
}
