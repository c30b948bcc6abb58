//!
//! In-process broker core backing the in-VM transport.
//!
//! Holds named queues and address bindings behind a single lock; per-queue
//! delivery state is locked independently so senders and blocked receivers
//! on different queues never contend.
//!

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::ClientError;
use crate::filter::Filter;
use crate::message::Message;

pub(crate) struct BrokerCore {
    state: Mutex<BrokerState>,
    next_delivery_id: AtomicU64,
    // Simulates the transient connection-level event that unblocks a
    // blocking send; the producer retries exactly once on it.
    unblock_next_send: AtomicBool,
}

struct BrokerState {
    queues: HashMap<String, Arc<Queue>>,
    bindings: HashMap<String, String>,
}

impl BrokerCore {
    pub(crate) fn new() -> Self {
        BrokerCore {
            state: Mutex::new(BrokerState {
                queues: HashMap::new(),
                bindings: HashMap::new(),
            }),
            next_delivery_id: AtomicU64::new(1),
            unblock_next_send: AtomicBool::new(false),
        }
    }

    /// Declare a queue and bind it to `address`.
    ///
    /// Fails with [`ClientError::QueueExists`] if either the queue name or
    /// the address binding is taken; the idempotent treatment of that error
    /// is up in the session layer.
    pub(crate) fn create_queue(
        &self,
        address: &str,
        queue_name: &str,
        durable: bool,
        temporary: bool,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if state.queues.contains_key(queue_name) {
            return Err(ClientError::QueueExists(queue_name.to_string()));
        }
        if state.bindings.contains_key(address) {
            return Err(ClientError::QueueExists(address.to_string()));
        }
        state.queues.insert(
            queue_name.to_string(),
            Arc::new(Queue::new(queue_name, durable, temporary)),
        );
        state
            .bindings
            .insert(address.to_string(), queue_name.to_string());
        tracing::debug!(address, queue_name, durable, temporary, "queue created");
        Ok(())
    }

    pub(crate) fn delete_queue(&self, queue_name: &str) -> Result<(), ClientError> {
        let queue = {
            let mut state = self.state.lock().expect("broker state poisoned");
            let queue = state
                .queues
                .remove(queue_name)
                .ok_or_else(|| ClientError::NoSuchQueue(queue_name.to_string()))?;
            state.bindings.retain(|_, bound| bound != queue_name);
            queue
        };
        queue.mark_deleted();
        tracing::debug!(queue_name, "queue deleted");
        Ok(())
    }

    pub(crate) fn queue(&self, queue_name: &str) -> Result<Arc<Queue>, ClientError> {
        let state = self.state.lock().expect("broker state poisoned");
        state
            .queues
            .get(queue_name)
            .cloned()
            .ok_or_else(|| ClientError::NoSuchQueue(queue_name.to_string()))
    }

    fn resolve(&self, address: &str) -> Result<Arc<Queue>, ClientError> {
        let state = self.state.lock().expect("broker state poisoned");
        let queue_name = state
            .bindings
            .get(address)
            .ok_or_else(|| ClientError::NoSuchAddress(address.to_string()))?;
        state
            .queues
            .get(queue_name)
            .cloned()
            .ok_or_else(|| ClientError::NoSuchQueue(queue_name.clone()))
    }

    /// Route a message to the queue bound to `address`.
    pub(crate) fn send(&self, address: &str, mut message: Message) -> Result<(), ClientError> {
        if self.unblock_next_send.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Unblocked);
        }
        let queue = self.resolve(address)?;
        message.delivery_id = self.next_delivery_id.fetch_add(1, Ordering::Relaxed);
        queue.push(message)
    }

    #[cfg(test)]
    pub(crate) fn inject_unblocked_once(&self) {
        self.unblock_next_send.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct Queue {
    name: String,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    messages: VecDeque<Message>,
    deleted: bool,
    #[allow(dead_code)]
    durable: bool,
    #[allow(dead_code)]
    temporary: bool,
}

impl Queue {
    fn new(name: &str, durable: bool, temporary: bool) -> Self {
        Queue {
            name: name.to_string(),
            inner: Mutex::new(QueueInner {
                messages: VecDeque::new(),
                deleted: false,
                durable,
                temporary,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, message: Message) -> Result<(), ClientError> {
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if inner.deleted {
                return Err(ClientError::NoSuchQueue(self.name.clone()));
            }
            inner.messages.push_back(message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Remove and return the first message matching `filter`, if any.
    pub(crate) fn try_take(&self, filter: Option<&Filter>) -> Result<Option<Message>, ClientError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.deleted {
            return Err(ClientError::ObjectClosed("queue"));
        }
        let position = inner
            .messages
            .iter()
            .position(|m| filter.map_or(true, |f| f.matches(m)));
        Ok(position.and_then(|p| inner.messages.remove(p)))
    }

    /// Put unacknowledged messages back at the head of the queue, preserving
    /// their original order, so they are redelivered first.
    pub(crate) fn requeue_front(&self, messages: Vec<Message>) {
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if inner.deleted {
                return;
            }
            for message in messages.into_iter().rev() {
                inner.messages.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }

    /// Register for wake-up on the next delivery or queue deletion.
    ///
    /// Callers must register before re-checking [`Queue::try_take`] to avoid
    /// missing a notification.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn mark_deleted(&self) {
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            inner.deleted = true;
            inner.messages.clear();
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").messages.len()
    }
}
