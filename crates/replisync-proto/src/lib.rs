//! # Replisync Protocol
//!
//! Wire messages exchanged between replicas of a collection.
//!
//! ## Messages
//!
//! - `Connect` / `ConnectAck`: session handshake
//! - `BatchChangeStart` / `BatchChangeContinue` / `BatchChangeEnd`: paged
//!   "changes since" transfer
//! - `DataGateFeed`: standalone change feed
//! - `BatchAck` / `DataGateFeedAck`: receipts naming the ids a feed carried
//!
//! ## Framing
//!
//! Messages travel as JSON text frames or CBOR binary frames. Either way the
//! header's `messageType` selects the payload shape.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod factory;
pub mod messages;

pub use factory::MessageFactory;
pub use messages::{
    BatchAck, BatchChangeContinue, BatchChangeEnd, BatchChangeStart, BatchEndAck, Connect,
    ConnectAck, DataGateFeed, DataGateFeedAck, Disconnect, DisconnectAck, ErrorMessage, Message,
    MessageError, MessageHeader, MessageType, Receipt, ReceiptAware,
};
