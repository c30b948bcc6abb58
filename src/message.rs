use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::ClientError;

/// Reserved property naming the address a reply should be sent to.
///
/// Presence of this property is the sole signal that a message is a request.
pub const REPLY_TO_PROPERTY: &str = "_REQMQ_REPLY_TO";

/// Pseudo property key used by filters to select on the message user id.
pub const USER_ID_PROPERTY: &str = "_REQMQ_USER_ID";

/// Payload encoding tag of a [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Bytes,
    Map,
    Object,
    Stream,
}

/// Tagged message payload.
///
/// Each variant has an explicit encode/decode, resolved by a single match at
/// the boundary rather than runtime type probing on the raw body.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    Bytes(Bytes),
    /// Key/value payload, encoded as JSON on the wire.
    Map(HashMap<String, String>),
    /// Pre-serialized application object.
    Object(Bytes),
    Stream(Bytes),
}

impl MessageBody {
    pub fn kind(&self) -> BodyKind {
        match self {
            MessageBody::Text(_) => BodyKind::Text,
            MessageBody::Bytes(_) => BodyKind::Bytes,
            MessageBody::Map(_) => BodyKind::Map,
            MessageBody::Object(_) => BodyKind::Object,
            MessageBody::Stream(_) => BodyKind::Stream,
        }
    }

    /// Encode the payload to raw bytes.
    pub fn encode(&self) -> Result<Bytes, ClientError> {
        match self {
            MessageBody::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            MessageBody::Bytes(raw) | MessageBody::Object(raw) | MessageBody::Stream(raw) => {
                Ok(raw.clone())
            }
            MessageBody::Map(map) => {
                let encoded = serde_json::to_vec(map).map_err(|e| {
                    ClientError::InvalidBody(format!("failed to encode map body: {}", e))
                })?;
                Ok(Bytes::from(encoded))
            }
        }
    }

    /// Decode raw bytes back into a payload of the given kind.
    pub fn decode(kind: BodyKind, raw: Bytes) -> Result<Self, ClientError> {
        match kind {
            BodyKind::Text => {
                let text = String::from_utf8(raw.to_vec()).map_err(|_| {
                    ClientError::InvalidBody("text body is not valid UTF-8".to_string())
                })?;
                Ok(MessageBody::Text(text))
            }
            BodyKind::Bytes => Ok(MessageBody::Bytes(raw)),
            BodyKind::Map => {
                let map: HashMap<String, String> =
                    serde_json::from_slice(&raw).map_err(|e| {
                        ClientError::InvalidBody(format!("map body is not valid JSON: {}", e))
                    })?;
                Ok(MessageBody::Map(map))
            }
            BodyKind::Object => Ok(MessageBody::Object(raw)),
            BodyKind::Stream => Ok(MessageBody::Stream(raw)),
        }
    }
}

/// An opaque payload envelope.
///
/// The `user_id` correlates a request with its reply; the reserved
/// [`REPLY_TO_PROPERTY`] carries the destination a reply should be sent to.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: MessageBody,

    /// Whether the message should survive a broker restart.
    pub durable: bool,

    /// User defined attributes in form of key-value pairs.
    properties: HashMap<String, String>,

    /// Application-assigned correlation identifier.
    user_id: Option<String>,

    /// Broker-assigned delivery tag, used for acknowledgement bookkeeping.
    pub(crate) delivery_id: u64,
}

impl Message {
    pub fn new(body: MessageBody, durable: bool) -> Self {
        Message {
            body,
            durable,
            properties: HashMap::new(),
            user_id: None,
            delivery_id: 0,
        }
    }

    /// A non-durable text message.
    pub fn text(body: impl Into<String>) -> Self {
        Message::new(MessageBody::Text(body.into()), false)
    }

    /// A non-durable bytes message.
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Message::new(MessageBody::Bytes(body.into()), false)
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    /// Assign a new globally-unique user id, returning it.
    pub fn generate_user_id(&mut self) -> String {
        let id = Uuid::new_v4().to_string();
        self.user_id = Some(id.clone());
        id
    }

    /// Is this a request message for which a reply is expected?
    pub fn is_request(&self) -> bool {
        self.properties.contains_key(REPLY_TO_PROPERTY)
    }

    /// The address the receiver should send a reply to, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.property(REPLY_TO_PROPERTY)
    }

    /// Mark this message as a request expecting a reply at `address`.
    ///
    /// Rather than setting this directly, consider creating a
    /// [`Requestor`](crate::requestor::Requestor) which stamps it on every
    /// submitted request.
    pub fn set_reply_to(&mut self, address: impl Into<String>) {
        self.set_property(REPLY_TO_PROPERTY, address);
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub fn contains_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// The text payload, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }
}
