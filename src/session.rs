//!
//! Sessions and the producers/consumers created from them.
//!
//! A session is an exclusive handle to the broker connection: at most one
//! logical thread of control may issue operations on it at any instant.
//! `Session` is deliberately `!Sync`; share sessions across tasks through a
//! [`SessionPool`](crate::pool::SessionPool) instead.
//!

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::broker::{BrokerCore, Queue};
use crate::error::ClientError;
use crate::filter::Filter;
use crate::message::Message;
use crate::requestor::Requestor;
use crate::server::Server;

/// How long a blocking receive waits for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Wait until a message arrives or the queue is deleted.
    Forever,
    /// Return immediately if nothing is queued.
    NoWait,
    /// Wait up to the given number of milliseconds.
    Millis(u64),
}

impl Wait {
    /// Map the conventional integer timeout: `-1` waits forever, `0` returns
    /// immediately, `N` waits up to N milliseconds.
    pub fn from_millis(timeout: i64) -> Self {
        match timeout {
            t if t < 0 => Wait::Forever,
            0 => Wait::NoWait,
            t => Wait::Millis(t as u64),
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SessionCore {
    broker: Arc<BrokerCore>,
    id: u64,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn broker(&self) -> &Arc<BrokerCore> {
        &self.broker
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ObjectClosed("session"));
        }
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        if !self.started.load(Ordering::SeqCst) {
            return Err(ClientError::SessionNotStarted);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// An exclusive, single-threaded handle through which producers, consumers
/// and queues are created.
pub struct Session {
    core: Arc<SessionCore>,
    // Sessions are Send but intentionally not Sync.
    _not_sync: PhantomData<Cell<()>>,
}

impl Session {
    pub(crate) fn new(broker: Arc<BrokerCore>) -> Self {
        Session {
            core: Arc::new(SessionCore {
                broker,
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            _not_sync: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Make the session ready to consume. Consumers created from a session
    /// that has not been started fail their receives.
    pub fn start(&self) {
        self.core.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.core.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// Declare a durable queue bound to `address`.
    ///
    /// Declaring a queue that already exists is treated as success, since
    /// multiple producers and consumers may race to declare the same queue at
    /// startup. Any other error propagates.
    pub fn create_queue(&self, address: &str, durable: bool) -> Result<(), ClientError> {
        self.core.ensure_open()?;
        if address.is_empty() {
            return Err(ClientError::MissingQueueName);
        }
        match self.core.broker.create_queue(address, address, durable, false) {
            Err(ClientError::QueueExists(_)) => Ok(()),
            other => other,
        }
    }

    /// Create an ephemeral queue owned by the caller, to be deleted on close.
    pub fn create_temporary_queue(
        &self,
        address: &str,
        queue_name: &str,
    ) -> Result<(), ClientError> {
        self.core.ensure_open()?;
        if queue_name.is_empty() {
            return Err(ClientError::MissingQueueName);
        }
        self.core.broker.create_queue(address, queue_name, false, true)
    }

    pub fn delete_queue(&self, queue_name: &str) -> Result<(), ClientError> {
        self.core.ensure_open()?;
        self.core.broker.delete_queue(queue_name)
    }

    /// Create a producer bound to `address`.
    pub fn create_producer(&self, address: &str) -> Result<Producer, ClientError> {
        self.core.ensure_open()?;
        Ok(Producer::new(self.core.clone(), Some(address.to_string())))
    }

    /// Create a producer with no bound address; the destination must be
    /// supplied with every send.
    pub fn create_anonymous_producer(&self) -> Result<Producer, ClientError> {
        self.core.ensure_open()?;
        Ok(Producer::new(self.core.clone(), None))
    }

    pub fn create_consumer(&self, queue_name: &str) -> Result<Consumer, ClientError> {
        self.create_consumer_with_filter(queue_name, None)
    }

    pub fn create_consumer_with_filter(
        &self,
        queue_name: &str,
        filter: Option<Filter>,
    ) -> Result<Consumer, ClientError> {
        self.core.ensure_open()?;
        if queue_name.is_empty() {
            return Err(ClientError::MissingQueueName);
        }
        Consumer::attach(self.core.clone(), queue_name, filter)
    }

    /// Create a [`Requestor`] sending requests to `request_address` and
    /// receiving correlated replies on its own temporary queue.
    pub fn create_requestor(&self, request_address: &str) -> Result<Requestor, ClientError> {
        Requestor::new(self, request_address)
    }

    /// Create a [`Server`] consuming requests from `input_queue`.
    pub fn create_server(&self, input_queue: &str, idle_timeout: Wait) -> Result<Server, ClientError> {
        Server::new(self, input_queue, idle_timeout)
    }

    /// Close the session. Subsequent operations fail with a closed error.
    pub fn close(&self) {
        self.core.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Sends messages, bound to an address or per-send destinations.
pub struct Producer {
    session: Arc<SessionCore>,
    address: Option<String>,
    closed: AtomicBool,
}

impl Producer {
    fn new(session: Arc<SessionCore>, address: Option<String>) -> Self {
        Producer {
            session,
            address,
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Send to the bound address.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let address = self
            .address
            .clone()
            .ok_or(ClientError::MissingAddress)?;
        self.transmit(&address, message)
    }

    /// Send to an explicit destination, for unbound producers or overrides.
    pub async fn send_to(&self, address: &str, message: &Message) -> Result<(), ClientError> {
        self.transmit(address, message)
    }

    fn transmit(&self, address: &str, message: &Message) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ObjectClosed("producer"));
        }
        self.session.ensure_open()?;
        match self.session.broker.send(address, message.clone()) {
            // A blocking send unblocked by a connection event is transient:
            // retry exactly once, propagate anything else unmodified.
            Err(ClientError::Unblocked) => {
                tracing::debug!(address, "send unblocked, retrying once");
                self.session
                    .broker
                    .send(address, message.clone())
                    .map_err(|source| ClientError::SendFailed {
                        address: address.to_string(),
                        source: Box::new(source),
                    })
            }
            Err(source) => Err(ClientError::SendFailed {
                address: address.to_string(),
                source: Box::new(source),
            }),
            Ok(()) => Ok(()),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Receives messages from one queue, optionally filtered.
///
/// Messages handed out by [`Consumer::receive`] are held as unacknowledged
/// until [`Consumer::ack`]; anything still unacknowledged when the consumer
/// closes is put back on the queue for redelivery.
pub struct Consumer {
    session: Arc<SessionCore>,
    queue: Arc<Queue>,
    filter: Option<Filter>,
    unacked: Mutex<Vec<Message>>,
    closed: AtomicBool,
}

impl Consumer {
    pub(crate) fn attach(
        session: Arc<SessionCore>,
        queue_name: &str,
        filter: Option<Filter>,
    ) -> Result<Self, ClientError> {
        let queue = session.broker.queue(queue_name)?;
        Ok(Consumer {
            session,
            queue,
            filter,
            unacked: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Receive the next matching message.
    ///
    /// Returns `Ok(None)` when nothing arrived within the wait mode; that is
    /// a normal outcome, not an error. Fails once the consumer, session or
    /// queue is closed.
    pub async fn receive(&self, wait: Wait) -> Result<Option<Message>, ClientError> {
        let deadline = match wait {
            Wait::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
            _ => None,
        };
        loop {
            // Register for wake-up before checking so a concurrent delivery
            // between check and await is not missed.
            let notified = self.queue.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::ObjectClosed("consumer"));
            }
            self.session.ensure_started()?;
            if let Some(message) = self.queue.try_take(self.filter.as_ref())? {
                self.unacked
                    .lock()
                    .expect("consumer state poisoned")
                    .push(message.clone());
                return Ok(Some(message));
            }
            match wait {
                Wait::NoWait => return Ok(None),
                Wait::Forever => notified.await,
                Wait::Millis(_) => {
                    let deadline = deadline.expect("deadline set for Millis");
                    if timeout_at(deadline, notified).await.is_err() {
                        // Deadline hit; one final immediate check.
                        return self.take_immediate();
                    }
                }
            }
        }
    }

    fn take_immediate(&self) -> Result<Option<Message>, ClientError> {
        if let Some(message) = self.queue.try_take(self.filter.as_ref())? {
            self.unacked
                .lock()
                .expect("consumer state poisoned")
                .push(message.clone());
            return Ok(Some(message));
        }
        Ok(None)
    }

    /// Acknowledge a received message, removing it from redelivery tracking.
    pub fn ack(&self, message: &Message) {
        self.unacked
            .lock()
            .expect("consumer state poisoned")
            .retain(|m| m.delivery_id != message.delivery_id);
    }

    /// Close the consumer, requeueing unacknowledged messages. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let unacked = std::mem::take(&mut *self.unacked.lock().expect("consumer state poisoned"));
        if !unacked.is_empty() {
            tracing::debug!(
                queue = self.queue.name(),
                count = unacked.len(),
                "requeueing unacknowledged messages"
            );
            self.queue.requeue_front(unacked);
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    fn started_session(connection: &Connection) -> Session {
        let session = connection.create_session().unwrap();
        session.start();
        session
    }

    #[tokio::test]
    async fn test_send_receive_round_trip() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("greetings", false)?;

        let producer = session.create_producer("greetings")?;
        producer.send(&Message::text("hello")).await?;

        let consumer = session.create_consumer("greetings")?;
        let message = consumer.receive(Wait::NoWait).await?.unwrap();
        assert_eq!(message.as_text(), Some("hello"));
        consumer.ack(&message);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_wait_never_blocks() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("empty", false)?;
        let consumer = session.create_consumer("empty")?;
        assert!(consumer.receive(Wait::NoWait).await?.is_none());
        Ok(())
    }

    #[test]
    fn test_wait_from_millis_maps_conventional_timeouts() {
        assert_eq!(Wait::from_millis(-1), Wait::Forever);
        assert_eq!(Wait::from_millis(0), Wait::NoWait);
        assert_eq!(Wait::from_millis(250), Wait::Millis(250));
    }

    #[tokio::test]
    async fn test_timed_receive_returns_none_after_timeout() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("slow", false)?;
        let consumer = session.create_consumer("slow")?;

        let started = std::time::Instant::now();
        let received = consumer.receive(Wait::from_millis(50)).await?;
        assert!(received.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_receive_wakes_on_delivery() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("wake", false)?;
        let producer = session.create_producer("wake")?;

        let sender = connection.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let session = sender.create_session().unwrap();
            session.start();
            let producer = session.create_producer("wake").unwrap();
            producer.send(&Message::text("late")).await.unwrap();
        });

        let consumer = session.create_consumer("wake")?;
        let message = consumer.receive(Wait::Millis(2000)).await?;
        assert_eq!(message.unwrap().as_text(), Some("late"));
        handle.await.unwrap();
        drop(producer);
        Ok(())
    }

    #[tokio::test]
    async fn test_unacked_messages_redelivered_on_close() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("work", false)?;
        let producer = session.create_producer("work")?;
        producer.send(&Message::text("first")).await?;
        producer.send(&Message::text("second")).await?;

        let consumer = session.create_consumer("work")?;
        let first = consumer.receive(Wait::NoWait).await?.unwrap();
        let second = consumer.receive(Wait::NoWait).await?.unwrap();
        consumer.ack(&second);
        consumer.close();
        assert_eq!(first.as_text(), Some("first"));

        // Only the unacked message comes back, ahead of anything new.
        let consumer = session.create_consumer("work")?;
        let redelivered = consumer.receive(Wait::NoWait).await?.unwrap();
        assert_eq!(redelivered.as_text(), Some("first"));
        assert!(consumer.receive(Wait::NoWait).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_receive_requires_started_session() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = connection.create_session()?;
        session.create_queue("unstarted", false)?;
        let consumer = session.create_consumer("unstarted")?;
        assert!(matches!(
            consumer.receive(Wait::NoWait).await,
            Err(ClientError::SessionNotStarted)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_queue_is_idempotent() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("dup", true)?;
        session.create_queue("dup", true)?;
        Ok(())
    }

    #[tokio::test]
    async fn test_blocked_receive_fails_when_queue_deleted() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_temporary_queue("gone", "gone")?;
        let consumer = session.create_consumer("gone")?;

        let deleter = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let session = deleter.create_session().unwrap();
            session.delete_queue("gone").unwrap();
        });

        assert!(matches!(
            consumer.receive(Wait::Forever).await,
            Err(ClientError::ObjectClosed("queue"))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_retries_once_when_unblocked() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("retry", false)?;
        let producer = session.create_producer("retry")?;

        connection.broker().inject_unblocked_once();
        producer.send(&Message::text("kept")).await?;

        let consumer = session.create_consumer("retry")?;
        assert_eq!(
            consumer.receive(Wait::NoWait).await?.unwrap().as_text(),
            Some("kept")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_send_failure_is_distinct() {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        let producer = session.create_producer("unbound.address").unwrap();
        match producer.send(&Message::text("x")).await {
            Err(ClientError::SendFailed { address, .. }) => assert_eq!(address, "unbound.address"),
            other => panic!("expected SendFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_anonymous_producer_requires_destination() {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("dest", false).unwrap();
        let producer = session.create_anonymous_producer().unwrap();
        assert!(matches!(
            producer.send(&Message::text("x")).await,
            Err(ClientError::MissingAddress)
        ));
        producer.send_to("dest", &Message::text("x")).await.unwrap();
    }
}
