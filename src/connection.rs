//!
//! Connections and session lifecycle tracking.
//!
//! A connection owns the in-VM broker core and hands out sessions. Sessions
//! created here are tracked so a connection-level close tears all of them
//! down. Wire transports, URIs and broker administration live outside this
//! crate; the in-VM transport is the one built-in mode.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::BrokerCore;
use crate::error::ClientError;
use crate::pool::{PoolConfig, SessionPool};
use crate::session::{Session, SessionCore};

#[derive(Clone)]
pub struct Connection {
    broker: Arc<BrokerCore>,
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    closed: AtomicBool,
    sessions: Mutex<Vec<Arc<SessionCore>>>,
}

impl Connection {
    /// Open an in-VM connection backed by a broker core private to this
    /// connection (and its clones).
    pub fn in_vm() -> Self {
        Connection {
            broker: Arc::new(BrokerCore::new()),
            inner: Arc::new(ConnectionInner {
                closed: AtomicBool::new(false),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn broker(&self) -> &Arc<BrokerCore> {
        &self.broker
    }

    /// Create a new session.
    ///
    /// The returned session must be closed once complete; prefer the scoped
    /// helpers on [`SessionPool`](crate::pool::SessionPool) or
    /// [`SessionManager`](crate::pool::SessionManager) where possible.
    pub fn create_session(&self) -> Result<Session, ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let session = Session::new(self.broker.clone());
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .expect("connection state poisoned");
        // Tracking is only for the bulk close; sessions closed on their own
        // are dropped here so the list does not grow without bound.
        sessions.retain(|core| !core.is_closed());
        sessions.push(session.core().clone());
        Ok(session)
    }

    /// Create a pool of sessions shared safely across tasks.
    pub fn create_session_pool(&self, config: PoolConfig) -> SessionPool {
        SessionPool::new(self, config)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection and every session created from it. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = std::mem::take(
            &mut *self
                .inner
                .sessions
                .lock()
                .expect("connection state poisoned"),
        );
        for session in sessions {
            session.close();
        }
    }
}
