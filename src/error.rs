use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection already closed")]
    ConnectionClosed,

    #[error("{0} is closed")]
    ObjectClosed(&'static str),

    #[error("Session has not been started")]
    SessionNotStarted,

    #[error("Queue `{0}` already exists")]
    QueueExists(String),

    #[error("Queue `{0}` does not exist")]
    NoSuchQueue(String),

    #[error("No queue is bound to address `{0}`")]
    NoSuchAddress(String),

    #[error("Failed to send message to `{address}`: {source}")]
    SendFailed {
        address: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Blocking send was unblocked by a connection event")]
    Unblocked,

    #[error("Producer is not bound to an address and none was supplied")]
    MissingAddress,

    #[error("Missing mandatory queue name")]
    MissingQueueName,

    #[error("Invalid filter expression `{0}`")]
    InvalidFilter(String),

    #[error("Invalid completion ratio {0}, must be between 0 and 1 inclusive")]
    InvalidCompletionRatio(f64),

    #[error("Invalid message body: {0}")]
    InvalidBody(String),

    #[error("Statistics were not enabled when the handler was registered")]
    StatisticsNotEnabled,

    #[error("Message handler failed: {0}")]
    Handler(String),
}
