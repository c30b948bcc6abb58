//!
//! Push-style message delivery: one dispatch task per registration, at most
//! one handler invocation in flight per registration.
//!

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::message::Message;
use crate::session::{Consumer, Wait};

/// Handler invoked once per received message, in delivery order.
///
/// The consumer is passed in so the handler can decide whether to acknowledge
/// the message (drop it) or leave it unacknowledged for redelivery.
pub type DispatchHandler = Box<dyn FnMut(&Consumer, &Message) -> Result<(), ClientError> + Send>;

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Count messages received and timestamp the first and most recent
    /// delivery. Counters never reset except by re-registering.
    pub statistics: bool,
}

/// Cumulative throughput statistics for one registration.
#[derive(Debug, Clone, Copy)]
pub struct DispatchStatistics {
    pub count: u64,
    /// Time from registration to the most recent delivery.
    pub duration: Duration,
    pub messages_per_second: u64,
}

struct StatsInner {
    count: u64,
    started_at: Instant,
    last_at: Option<Instant>,
}

/// A running dispatch registration.
///
/// Dropping the dispatcher aborts the delivery task; prefer
/// [`Dispatcher::stop`] for an orderly shutdown. Handlers for different
/// registrations run concurrently with respect to each other.
pub struct Dispatcher {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
    stats: Option<Arc<Mutex<StatsInner>>>,
}

impl Dispatcher {
    /// Take ownership of `consumer` and deliver each of its messages to
    /// `handler` on a dedicated task.
    ///
    /// A handler error is caught at this boundary, logged with the offending
    /// message content, and swallowed: a poison message never terminates the
    /// dispatch loop. Whether it is redelivered is the handler's decision,
    /// made by acknowledging or not.
    pub fn register(
        consumer: Consumer,
        mut handler: DispatchHandler,
        options: DispatchOptions,
    ) -> Dispatcher {
        let shutdown = Arc::new(Notify::new());
        let stats = options.statistics.then(|| {
            Arc::new(Mutex::new(StatsInner {
                count: 0,
                started_at: Instant::now(),
                last_at: None,
            }))
        });

        let task_shutdown = shutdown.clone();
        let task_stats = stats.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_shutdown.notified() => break,
                    received = consumer.receive(Wait::Forever) => {
                        let message = match received {
                            Ok(Some(message)) => message,
                            // Queue deleted or consumer/session closed.
                            Ok(None) | Err(_) => break,
                        };
                        if let Some(stats) = &task_stats {
                            let mut stats = stats.lock().expect("dispatch stats poisoned");
                            stats.count += 1;
                            stats.last_at = Some(Instant::now());
                        }
                        if let Err(error) = handler(&consumer, &message) {
                            tracing::error!(
                                %error,
                                queue = consumer.queue_name(),
                                message = ?message,
                                "unhandled error processing message, ignoring poison message"
                            );
                        }
                    }
                }
            }
            // Dropping the consumer here closes it and requeues anything
            // left unacknowledged.
        });

        Dispatcher {
            handle: Some(handle),
            shutdown,
            stats,
        }
    }

    /// Statistics gathered so far. Fails unless the registration was made
    /// with [`DispatchOptions::statistics`] enabled.
    pub fn statistics(&self) -> Result<DispatchStatistics, ClientError> {
        let stats = self.stats.as_ref().ok_or(ClientError::StatisticsNotEnabled)?;
        let stats = stats.lock().expect("dispatch stats poisoned");
        let end = stats.last_at.unwrap_or_else(Instant::now);
        let duration = end.duration_since(stats.started_at);
        let rate = stats.count as f64 / duration.as_secs_f64();
        Ok(DispatchStatistics {
            count: stats.count,
            duration,
            messages_per_second: if rate.is_finite() { rate as u64 } else { 0 },
        })
    }

    /// Stop delivering and wait for the dispatch task to wind down.
    pub async fn stop(&mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::session::Session;

    fn started_session(connection: &Connection) -> Session {
        let session = connection.create_session().unwrap();
        session.start();
        session
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_messages_dispatched_in_order() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("ordered", false)?;
        let producer = session.create_producer("ordered")?;
        for n in 0..5 {
            producer.send(&Message::text(format!("m{}", n))).await?;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = session.create_consumer("ordered")?;
        let mut dispatcher = Dispatcher::register(
            consumer,
            Box::new(move |consumer, message| {
                sink.lock().unwrap().push(message.as_text().unwrap().to_string());
                consumer.ack(message);
                Ok(())
            }),
            DispatchOptions::default(),
        );

        wait_until(|| seen.lock().unwrap().len() == 5).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
        dispatcher.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_poison_message_does_not_stop_dispatch() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("poison", false)?;
        let producer = session.create_producer("poison")?;
        for n in 1..=5 {
            producer.send(&Message::text(format!("m{}", n))).await?;
        }

        let handled = Arc::new(Mutex::new(Vec::new()));
        let sink = handled.clone();
        let consumer = session.create_consumer("poison")?;
        let mut dispatcher = Dispatcher::register(
            consumer,
            Box::new(move |consumer, message| {
                let body = message.as_text().unwrap().to_string();
                if body == "m3" {
                    // Left unacknowledged on purpose.
                    return Err(ClientError::Handler("m3 is indigestible".to_string()));
                }
                sink.lock().unwrap().push(body);
                consumer.ack(message);
                Ok(())
            }),
            DispatchOptions::default(),
        );

        // Messages after the poison one are still dispatched.
        wait_until(|| handled.lock().unwrap().len() == 4).await;
        assert_eq!(*handled.lock().unwrap(), vec!["m1", "m2", "m4", "m5"]);
        dispatcher.stop().await;

        // The unacknowledged poison message went back to the queue.
        let consumer = session.create_consumer("poison")?;
        let redelivered = consumer.receive(Wait::Millis(1000)).await?.unwrap();
        assert_eq!(redelivered.as_text(), Some("m3"));
        Ok(())
    }

    #[tokio::test]
    async fn test_statistics_accumulate() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("counted", false)?;
        let producer = session.create_producer("counted")?;
        for _ in 0..3 {
            producer.send(&Message::text("tick")).await?;
        }

        let consumer = session.create_consumer("counted")?;
        let mut dispatcher = Dispatcher::register(
            consumer,
            Box::new(|consumer, message| {
                consumer.ack(message);
                Ok(())
            }),
            DispatchOptions { statistics: true },
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = dispatcher.statistics()?;
            if stats.count == 3 {
                break;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        dispatcher.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_statistics_require_opt_in() -> Result<(), ClientError> {
        let connection = Connection::in_vm();
        let session = started_session(&connection);
        session.create_queue("uncounted", false)?;
        let consumer = session.create_consumer("uncounted")?;
        let mut dispatcher = Dispatcher::register(
            consumer,
            Box::new(|_, _| Ok(())),
            DispatchOptions::default(),
        );
        assert!(matches!(
            dispatcher.statistics(),
            Err(ClientError::StatisticsNotEnabled)
        ));
        dispatcher.stop().await;
        Ok(())
    }
}
