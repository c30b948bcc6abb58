//!
//! Request-serving loop: consume from one input queue, conditionally reply.
//!
//! Create one instance per task; the consumer and producer inside share the
//! session the server was built from.
//!

use crate::error::ClientError;
use crate::message::Message;
use crate::session::{Consumer, Producer, Session, Wait};

/// Consumes request messages and sends correlated replies to the reply-to
/// address each request carries.
pub struct Server {
    consumer: Consumer,
    producer: Producer,
    idle_timeout: Wait,
    closed: bool,
}

impl Server {
    /// `idle_timeout` bounds each receive: when it elapses with no message
    /// the run loop ends normally. [`Wait::Forever`] runs indefinitely.
    pub fn new(session: &Session, input_queue: &str, idle_timeout: Wait) -> Result<Self, ClientError> {
        Ok(Server {
            consumer: session.create_consumer(input_queue)?,
            producer: session.create_anonymous_producer()?,
            idle_timeout,
            closed: false,
        })
    }

    /// Receive loop. For every message the handler is invoked; when the
    /// message is a request and the handler returned a reply, the reply is
    /// sent back correlated to the request. The request is acknowledged
    /// either way.
    ///
    /// A handler reply for a message that is not a request is silently
    /// discarded: there is nowhere to send it, and that is intentional.
    ///
    /// The loop ending on idle timeout is the server's normal shutdown
    /// condition, not an error.
    pub async fn run<F>(&mut self, mut handler: F) -> Result<(), ClientError>
    where
        F: FnMut(&Message) -> Option<Message>,
    {
        while let Some(request) = self.consumer.receive(self.idle_timeout).await? {
            let reply = handler(&request);
            if request.is_request() {
                if let Some(mut reply) = reply {
                    self.reply(&request, &mut reply).await?;
                }
            }
            self.consumer.ack(&request);
        }
        Ok(())
    }

    /// Send `reply` to the request's reply-to address, stamping the request's
    /// durability and user id onto it. No-op when the message is not a
    /// request.
    pub async fn reply(&self, request: &Message, reply: &mut Message) -> Result<(), ClientError> {
        if let Some(reply_to) = request.reply_to() {
            // Reply should have same durability as the request, and carry its
            // user id back for correlation.
            reply.durable = request.durable;
            if let Some(user_id) = request.user_id() {
                reply.set_user_id(user_id.to_string());
            }
            self.producer.send_to(reply_to, reply).await?;
        }
        self.consumer.ack(request);
        Ok(())
    }

    /// Close consumer and producer. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.consumer.close();
        self.producer.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}
