//!
//! Windowed batch submission: keep requests flowing while bounding how far
//! the sender may run ahead of the replies.
//!
//! Rather than a hard in-flight count, admission is gated on a completion
//! ratio over the cumulative `sent`/`replied` counters, so counters never
//! need resetting between batches and a run can proceed once "good enough"
//! coverage is reached even if some requests never complete.
//!

use std::sync::{Arc, RwLock};
use std::time::Duration;

use uuid::Uuid;

use crate::connection::Connection;
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::error::ClientError;
use crate::message::Message;
use crate::session::{Producer, Session};

/// Optional per-reply callback, e.g. to abort a batch run or requeue a
/// response for later.
pub type ReplyHandler = Box<dyn Fn(&Message) -> Result<(), ClientError> + Send + Sync>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ReplyCounters {
    sent: u64,
    replied: i64,
}

/// Submits a batch of requests and waits for replies, admitting further
/// requests only once the configured fraction of everything sent so far has
/// been answered.
///
/// Replies are consumed on a dedicated session and processed one at a time
/// by an async dispatch task; the caller's send loop and the wait loops run
/// concurrently with it. Sending should be done by only one task at a time
/// since the pattern shares one session and producer for all sends.
pub struct BatchRequestor {
    session: Session,
    reply_session: Session,
    producer: Producer,
    reply_address: String,
    completion_ratio: f64,
    poll_interval: Duration,
    counters: Arc<RwLock<ReplyCounters>>,
    dispatcher: Option<Dispatcher>,
    closed: bool,
}

impl BatchRequestor {
    /// Fails fast if `completion_ratio` is outside `[0, 1]`.
    ///
    /// Creates a temporary reply queue named `<server_address>.<uuid>` and
    /// starts consuming replies immediately. The optional `reply_handler` is
    /// called with every reply before it is acknowledged.
    pub fn new(
        connection: &Connection,
        server_address: &str,
        completion_ratio: f64,
        reply_handler: Option<ReplyHandler>,
    ) -> Result<Self, ClientError> {
        if !(0.0..=1.0).contains(&completion_ratio) {
            return Err(ClientError::InvalidCompletionRatio(completion_ratio));
        }

        let session = connection.create_session()?;
        session.start();
        let producer = session.create_producer(server_address)?;
        let reply_address = format!("{}.{}", server_address, Uuid::new_v4());
        session.create_temporary_queue(&reply_address, &reply_address)?;

        // Replies are consumed on their own session so the dispatch task
        // never shares the send session.
        let reply_session = connection.create_session()?;
        reply_session.start();
        let consumer = reply_session.create_consumer(&reply_address)?;

        let counters = Arc::new(RwLock::new(ReplyCounters { sent: 0, replied: 0 }));
        let reply_counters = counters.clone();
        let dispatcher = Dispatcher::register(
            consumer,
            Box::new(move |consumer, message| {
                {
                    let mut counters = reply_counters.write().expect("counters poisoned");
                    counters.replied += 1;
                }
                if let Some(handler) = &reply_handler {
                    handler(message)?;
                }
                consumer.ack(message);
                Ok(())
            }),
            DispatchOptions::default(),
        );

        Ok(BatchRequestor {
            session,
            reply_session,
            producer,
            reply_address,
            completion_ratio,
            poll_interval: DEFAULT_POLL_INTERVAL,
            counters,
            dispatcher: Some(dispatcher),
            closed: false,
        })
    }

    /// Override the interval at which the wait loops re-check the counters.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn completion_ratio(&self) -> f64 {
        self.completion_ratio
    }

    /// Messages sent so far over the whole run.
    pub fn sent_count(&self) -> u64 {
        self.counters.read().expect("counters poisoned").sent
    }

    /// Replies processed so far, net of resends.
    pub fn reply_count(&self) -> i64 {
        self.counters.read().expect("counters poisoned").replied
    }

    /// Send a request, stamping this pattern's reply address onto it.
    /// Returns the total number of messages sent so far in this run.
    ///
    /// The send counter is bumped before the message goes out so a reply
    /// racing back on the dispatch task can never be counted ahead of its
    /// request; a failed send is backed out.
    pub async fn send(&self, message: &mut Message) -> Result<u64, ClientError> {
        message.set_reply_to(self.reply_address.clone());
        let total = {
            let mut counters = self.counters.write().expect("counters poisoned");
            counters.sent += 1;
            counters.sent
        };
        match self.producer.send(message).await {
            Ok(()) => Ok(total),
            Err(error) => {
                let mut counters = self.counters.write().expect("counters poisoned");
                counters.sent -= 1;
                Err(error)
            }
        }
    }

    /// Re-send a previous request after its reply came back.
    ///
    /// Decrements the reply counter by one and does not increment the send
    /// counter, since the message is still part of the original accounting.
    /// The bookkeeping only stays consistent when every logical request,
    /// including its resends, ends up replied to exactly once; a resend
    /// whose original reply also arrives later skews the counters. Callers
    /// must uphold that.
    pub async fn resend(&self, message: &mut Message) -> Result<(), ClientError> {
        message.set_reply_to(self.reply_address.clone());
        {
            let mut counters = self.counters.write().expect("counters poisoned");
            counters.replied -= 1;
        }
        self.producer.send(message).await
    }

    /// Block until the completion ratio is met over everything sent so far.
    ///
    /// With a ratio of 0.8 and 10 requests sent, returns once 8 or more
    /// replies have been processed.
    pub async fn wait_for_outstanding_replies(&self) {
        self.wait_for_ratio(self.completion_ratio).await;
    }

    /// Block until every request sent so far has been replied to.
    pub async fn wait_for_all_outstanding_replies(&self) {
        loop {
            {
                let counters = self.counters.read().expect("counters poisoned");
                if counters.replied >= counters.sent as i64 {
                    return;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_ratio(&self, ratio: f64) {
        loop {
            {
                let counters = self.counters.read().expect("counters poisoned");
                if counters.replied as f64 >= ratio * counters.sent as f64 {
                    return;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop the reply dispatch, delete the temporary reply queue and release
    /// the sessions. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.stop().await;
        }
        if let Err(error) = self.session.delete_queue(&self.reply_address) {
            tracing::debug!(%error, queue = %self.reply_address, "temporary reply queue already gone");
        }
        self.producer.close();
        self.reply_session.close();
        self.session.close();
    }
}
