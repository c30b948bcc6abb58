//!
//! Request/reply correlation over a temporary reply queue.
//!

use uuid::Uuid;

use crate::error::ClientError;
use crate::filter::Filter;
use crate::message::Message;
use crate::session::{Consumer, Producer, Session, SessionCore, Wait};

use std::sync::Arc;

/// Sends a request and waits for the one correlated reply.
///
/// By default each requestor creates its own temporary reply queue named
/// `<request_address>.<uuid>` and deletes it on close. A pre-existing reply
/// queue can be supplied instead, in which case it is left alone on close.
///
/// A reply is only matched when it carries the same user id as the request
/// that was sent. This is critical since a previous receive may have timed
/// out and we do not want to pick up the response to an earlier request.
pub struct Requestor {
    session: Arc<SessionCore>,
    producer: Producer,
    reply_address: String,
    reply_queue: String,
    destroy_temp_queue: bool,
    closed: bool,
}

impl Requestor {
    /// Create a requestor with its own temporary reply queue.
    pub fn new(session: &Session, request_address: &str) -> Result<Self, ClientError> {
        let producer = session.create_producer(request_address)?;
        let reply_address = format!("{}.{}", request_address, Uuid::new_v4());
        session.create_temporary_queue(&reply_address, &reply_address)?;
        Ok(Requestor {
            session: session.core().clone(),
            producer,
            reply_queue: reply_address.clone(),
            reply_address,
            destroy_temp_queue: true,
            closed: false,
        })
    }

    /// Create a requestor over a pre-existing reply queue.
    ///
    /// `reply_queue` may be supplied when the queue name differs from the
    /// reply address. The queue is not deleted on close.
    pub fn with_reply_queue(
        session: &Session,
        request_address: &str,
        reply_address: &str,
        reply_queue: Option<&str>,
    ) -> Result<Self, ClientError> {
        let producer = session.create_producer(request_address)?;
        Ok(Requestor {
            session: session.core().clone(),
            producer,
            reply_address: reply_address.to_string(),
            reply_queue: reply_queue.unwrap_or(reply_address).to_string(),
            destroy_temp_queue: false,
            closed: false,
        })
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    /// Synchronous request: submit, then wait up to `wait` for the reply.
    ///
    /// Returns the reply, or `None` if no correlated reply arrived in time;
    /// a timeout is a defined "no reply" outcome, not an error.
    pub async fn request(
        &self,
        request: &mut Message,
        wait: Wait,
    ) -> Result<Option<Message>, ClientError> {
        let user_id = self.submit_request(request).await?;
        self.wait_for_reply(Some(&user_id), wait).await
    }

    /// Send the request without waiting, returning its correlation user id.
    ///
    /// The supplied message is updated: its reply-to property is set to this
    /// requestor's reply address, and a user id is generated if absent. Call
    /// [`Requestor::wait_for_reply`] later on the same thread of control to
    /// collect the reply.
    pub async fn submit_request(&self, request: &mut Message) -> Result<String, ClientError> {
        request.set_reply_to(self.reply_address.clone());
        let user_id = match request.user_id() {
            Some(id) => id.to_string(),
            None => request.generate_user_id(),
        };
        self.producer.send(request).await?;
        Ok(user_id)
    }

    /// Wait for the reply correlated with `user_id`.
    ///
    /// Opens a consumer filtered on the user id (or unfiltered when `None`,
    /// accepting any message on the reply queue, e.g. to collect a reply
    /// whose original wait timed out), makes one receive attempt and closes
    /// the consumer again.
    pub async fn wait_for_reply(
        &self,
        user_id: Option<&str>,
        wait: Wait,
    ) -> Result<Option<Message>, ClientError> {
        let filter = user_id.map(Filter::user_id);
        let consumer = Consumer::attach(self.session.clone(), &self.reply_queue, filter)?;
        let reply = consumer.receive(wait).await?;
        if let Some(message) = &reply {
            consumer.ack(message);
        }
        consumer.close();
        Ok(reply)
    }

    /// Delete the temporary reply queue if owned and close the producer.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.destroy_temp_queue {
            if let Err(error) = self.session.broker().delete_queue(&self.reply_queue) {
                tracing::debug!(%error, queue = %self.reply_queue, "temporary reply queue already gone");
            }
        }
        self.producer.close();
    }
}

impl Drop for Requestor {
    fn drop(&mut self) {
        self.close();
    }
}
