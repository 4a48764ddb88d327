//! Protocol messages exchanged between replicas.
//!
//! Every message is a header plus a type-specific payload. On the wire the
//! header's `messageType` selects the payload shape, so decoding reads the
//! header first and then the body.

use replisync_core::LastWriteWinState;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Message kinds in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Session handshake request
    Connect,
    /// Session handshake reply
    ConnectAck,
    /// Session teardown request
    Disconnect,
    /// Session teardown reply
    DisconnectAck,
    /// First page of a batch
    BatchChangeStart,
    /// Subsequent page of a batch
    BatchChangeContinue,
    /// Batch close marker
    BatchChangeEnd,
    /// Receipt for a batch page
    BatchAck,
    /// Reply to a batch close
    BatchEndAck,
    /// Standalone change feed
    DataGateFeed,
    /// Receipt for a standalone feed
    DataGateFeedAck,
    /// Error report
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Envelope header carried by every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Unique message id
    pub id: String,
    /// Batch or request this message belongs to
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Replicated collection name
    pub collection_name: String,
    /// Authenticated user, if any
    #[serde(default)]
    pub user_name: Option<String>,
    /// Sender time (epoch millis)
    pub timestamp: i64,
    /// Payload kind
    pub message_type: MessageType,
    /// Sender replica id
    pub origin: String,
}

/// Ids referenced by a feed's payload.
///
/// Describes what a message carried, not what the receiver persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Ids of changed documents
    #[serde(default)]
    pub added: BTreeSet<String>,
    /// Ids of removed documents
    #[serde(default)]
    pub removed: BTreeSet<String>,
}

impl Receipt {
    /// Create a receipt from explicit id sets.
    #[must_use]
    pub fn new(added: BTreeSet<String>, removed: BTreeSet<String>) -> Self {
        Self { added, removed }
    }

    /// Receipt describing a state's payload.
    #[must_use]
    pub fn from_state(state: &LastWriteWinState) -> Self {
        Self {
            added: state.change_ids(),
            removed: state.tombstone_ids(),
        }
    }

    /// Check if the receipt references nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Add every id of `other` to this receipt.
    pub fn union(&mut self, other: &Receipt) {
        self.added.extend(other.added.iter().cloned());
        self.removed.extend(other.removed.iter().cloned());
    }

    /// Remove every id of `other` from this receipt.
    pub fn subtract(&mut self, other: &Receipt) {
        self.added.retain(|id| !other.added.contains(id));
        self.removed.retain(|id| !other.removed.contains(id));
    }
}

/// A message whose payload is a [`LastWriteWinState`].
pub trait ReceiptAware {
    /// The carried state.
    fn feed(&self) -> &LastWriteWinState;

    /// Receipt summarising the carried state.
    fn calculate_receipt(&self) -> Receipt {
        Receipt::from_state(self.feed())
    }
}

/// Session handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connect {
    /// Envelope header
    pub header: MessageHeader,
    /// Bearer or basic credential
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Session handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectAck {
    /// Envelope header
    pub header: MessageHeader,
}

/// Session teardown request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Envelope header
    pub header: MessageHeader,
}

/// Session teardown reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectAck {
    /// Envelope header
    pub header: MessageHeader,
}

/// First page of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchChangeStart {
    /// Envelope header
    pub header: MessageHeader,
    /// First page of changes
    #[serde(default)]
    pub feed: LastWriteWinState,
}

/// A subsequent page of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchChangeContinue {
    /// Envelope header
    pub header: MessageHeader,
    /// Page of changes
    #[serde(default)]
    pub feed: LastWriteWinState,
}

/// Batch close marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchChangeEnd {
    /// Envelope header; its timestamp is the batch start time
    pub header: MessageHeader,
}

/// Receipt for a batch page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAck {
    /// Envelope header
    pub header: MessageHeader,
    /// Id of the acknowledged message
    pub correlation_id: String,
    /// Ids the acknowledged page referenced
    pub receipt: Receipt,
}

/// Reply to a batch close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEndAck {
    /// Envelope header
    pub header: MessageHeader,
    /// Id of the acknowledged end marker
    pub correlation_id: String,
}

/// Standalone change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGateFeed {
    /// Envelope header
    pub header: MessageHeader,
    /// Carried changes
    #[serde(default)]
    pub feed: LastWriteWinState,
}

/// Receipt for a standalone feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGateFeedAck {
    /// Envelope header
    pub header: MessageHeader,
    /// Id of the acknowledged feed
    pub correlation_id: String,
    /// Ids the acknowledged feed referenced
    pub receipt: Receipt,
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Envelope header
    pub header: MessageHeader,
    /// Human-readable error
    pub error: String,
    /// Whether the session cannot continue
    #[serde(default)]
    pub fatal: bool,
}

impl ReceiptAware for BatchChangeStart {
    fn feed(&self) -> &LastWriteWinState {
        &self.feed
    }
}

impl ReceiptAware for BatchChangeContinue {
    fn feed(&self) -> &LastWriteWinState {
        &self.feed
    }
}

impl ReceiptAware for DataGateFeed {
    fn feed(&self) -> &LastWriteWinState {
        &self.feed
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// See [`Connect`]
    Connect(Connect),
    /// See [`ConnectAck`]
    ConnectAck(ConnectAck),
    /// See [`Disconnect`]
    Disconnect(Disconnect),
    /// See [`DisconnectAck`]
    DisconnectAck(DisconnectAck),
    /// See [`BatchChangeStart`]
    BatchChangeStart(BatchChangeStart),
    /// See [`BatchChangeContinue`]
    BatchChangeContinue(BatchChangeContinue),
    /// See [`BatchChangeEnd`]
    BatchChangeEnd(BatchChangeEnd),
    /// See [`BatchAck`]
    BatchAck(BatchAck),
    /// See [`BatchEndAck`]
    BatchEndAck(BatchEndAck),
    /// See [`DataGateFeed`]
    DataGateFeed(DataGateFeed),
    /// See [`DataGateFeedAck`]
    DataGateFeedAck(DataGateFeedAck),
    /// See [`ErrorMessage`]
    Error(ErrorMessage),
}

impl Message {
    /// The envelope header.
    #[must_use]
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Connect(m) => &m.header,
            Message::ConnectAck(m) => &m.header,
            Message::Disconnect(m) => &m.header,
            Message::DisconnectAck(m) => &m.header,
            Message::BatchChangeStart(m) => &m.header,
            Message::BatchChangeContinue(m) => &m.header,
            Message::BatchChangeEnd(m) => &m.header,
            Message::BatchAck(m) => &m.header,
            Message::BatchEndAck(m) => &m.header,
            Message::DataGateFeed(m) => &m.header,
            Message::DataGateFeedAck(m) => &m.header,
            Message::Error(m) => &m.header,
        }
    }

    /// The payload kind.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.header().message_type
    }

    /// The carried state, for feed-bearing messages.
    #[must_use]
    pub fn feed(&self) -> Option<&LastWriteWinState> {
        match self {
            Message::BatchChangeStart(m) => Some(m.feed()),
            Message::BatchChangeContinue(m) => Some(m.feed()),
            Message::DataGateFeed(m) => Some(m.feed()),
            _ => None,
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a valid message.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct HeaderProbe {
            message_type: MessageType,
        }
        #[derive(Deserialize)]
        struct EnvelopeProbe {
            header: HeaderProbe,
        }

        let probe: EnvelopeProbe = serde_json::from_value(value.clone())?;
        let message = match probe.header.message_type {
            MessageType::Connect => Message::Connect(serde_json::from_value(value)?),
            MessageType::ConnectAck => Message::ConnectAck(serde_json::from_value(value)?),
            MessageType::Disconnect => Message::Disconnect(serde_json::from_value(value)?),
            MessageType::DisconnectAck => Message::DisconnectAck(serde_json::from_value(value)?),
            MessageType::BatchChangeStart => {
                Message::BatchChangeStart(serde_json::from_value(value)?)
            }
            MessageType::BatchChangeContinue => {
                Message::BatchChangeContinue(serde_json::from_value(value)?)
            }
            MessageType::BatchChangeEnd => Message::BatchChangeEnd(serde_json::from_value(value)?),
            MessageType::BatchAck => Message::BatchAck(serde_json::from_value(value)?),
            MessageType::BatchEndAck => Message::BatchEndAck(serde_json::from_value(value)?),
            MessageType::DataGateFeed => Message::DataGateFeed(serde_json::from_value(value)?),
            MessageType::DataGateFeedAck => {
                Message::DataGateFeedAck(serde_json::from_value(value)?)
            }
            MessageType::Error => Message::Error(serde_json::from_value(value)?),
        };
        Ok(message)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(serde::de::Error::custom)
    }
}

macro_rules! impl_from_message {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(message: $ty) -> Self {
                    Message::$variant(message)
                }
            }
        )*
    };
}

impl_from_message! {
    Connect => Connect,
    ConnectAck => ConnectAck,
    Disconnect => Disconnect,
    DisconnectAck => DisconnectAck,
    BatchChangeStart => BatchChangeStart,
    BatchChangeContinue => BatchChangeContinue,
    BatchChangeEnd => BatchChangeEnd,
    BatchAck => BatchAck,
    BatchEndAck => BatchEndAck,
    DataGateFeed => DataGateFeed,
    DataGateFeedAck => DataGateFeedAck,
    Error => ErrorMessage,
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use replisync_core::Document;

    fn header(message_type: MessageType) -> MessageHeader {
        MessageHeader {
            id: "m-1".to_string(),
            correlation_id: Some("batch-1".to_string()),
            collection_name: "todos".to_string(),
            user_name: Some("alice".to_string()),
            timestamp: 1_704_067_200_000,
            message_type,
            origin: "replica-a".to_string(),
        }
    }

    fn sample_feed() -> LastWriteWinState {
        let mut feed = LastWriteWinState::new();
        feed.add_change(Document::new("a", 10).with("title", "milk"));
        feed.add_tombstone("b", 20);
        feed
    }

    #[test]
    fn header_uses_camel_case_on_the_wire() {
        let msg = Message::BatchChangeEnd(BatchChangeEnd {
            header: header(MessageType::BatchChangeEnd),
        });
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["header"]["correlationId"], "batch-1");
        assert_eq!(json["header"]["collectionName"], "todos");
        assert_eq!(json["header"]["messageType"], "BatchChangeEnd");
    }

    #[test]
    fn message_type_selects_payload_shape() {
        let text = r#"{
            "header": {
                "id": "f-1",
                "collectionName": "todos",
                "timestamp": 5,
                "messageType": "DataGateFeedAck",
                "origin": "replica-b"
            },
            "correlationId": "feed-9",
            "receipt": {"added": ["a"], "removed": []}
        }"#;

        let msg = Message::from_json(text).unwrap();
        let Message::DataGateFeedAck(ack) = msg else {
            panic!("expected DataGateFeedAck");
        };
        assert_eq!(ack.correlation_id, "feed-9");
        assert!(ack.receipt.added.contains("a"));
        assert_eq!(ack.header.correlation_id, None);
    }

    #[test]
    fn feed_survives_json_and_cbor() {
        let msg = Message::DataGateFeed(DataGateFeed {
            header: header(MessageType::DataGateFeed),
            feed: sample_feed(),
        });

        let from_json = Message::from_json(&msg.to_json().unwrap()).unwrap();
        let from_cbor = Message::from_cbor(&msg.to_cbor().unwrap()).unwrap();

        for decoded in [from_json, from_cbor] {
            let feed = decoded.feed().unwrap();
            assert_eq!(feed.changes[0].get("title").unwrap(), "milk");
            assert_eq!(feed.tombstones.get("b"), Some(&20));
            assert_eq!(decoded.header().origin, "replica-a");
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let text = r#"{"header":{"id":"x","collectionName":"c","timestamp":1,
            "messageType":"Teleport","origin":"o"}}"#;
        assert!(matches!(
            Message::from_json(text),
            Err(MessageError::Deserialize(_))
        ));
    }

    #[test]
    fn receipt_reflects_payload() {
        let start = BatchChangeStart {
            header: header(MessageType::BatchChangeStart),
            feed: sample_feed(),
        };
        let receipt = start.calculate_receipt();

        assert_eq!(receipt.added, BTreeSet::from(["a".to_string()]));
        assert_eq!(receipt.removed, BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn receipt_set_operations() {
        let mut pending = Receipt::new(
            BTreeSet::from(["a".to_string(), "b".to_string()]),
            BTreeSet::from(["x".to_string()]),
        );
        let acked = Receipt::new(BTreeSet::from(["a".to_string()]), BTreeSet::new());

        pending.subtract(&acked);
        assert_eq!(pending.added, BTreeSet::from(["b".to_string()]));
        assert!(!pending.is_empty());

        pending.union(&acked);
        assert_eq!(pending.added.len(), 2);
    }
}
