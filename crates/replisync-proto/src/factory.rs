//! Message construction with consistent header stamping.

use crate::messages::{
    BatchAck, BatchChangeContinue, BatchChangeEnd, BatchChangeStart, BatchEndAck, Connect,
    ConnectAck, DataGateFeed, DataGateFeedAck, Disconnect, DisconnectAck, ErrorMessage,
    MessageHeader, MessageType, Receipt,
};
use replisync_core::{now_millis, LastWriteWinState};

/// Builds outbound messages for one replica and collection.
///
/// Every message gets a fresh id, the current time, and this replica as
/// origin.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    replica_id: String,
    collection_name: String,
    user_name: Option<String>,
}

impl MessageFactory {
    /// Create a factory.
    #[must_use]
    pub fn new(
        replica_id: impl Into<String>,
        collection_name: impl Into<String>,
        user_name: Option<String>,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            collection_name: collection_name.into(),
            user_name,
        }
    }

    /// Replica id stamped as origin.
    #[must_use]
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Collection name stamped on headers.
    #[must_use]
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// A header of the given type.
    #[must_use]
    pub fn header(&self, message_type: MessageType, correlation_id: Option<&str>) -> MessageHeader {
        MessageHeader {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.map(str::to_string),
            collection_name: self.collection_name.clone(),
            user_name: self.user_name.clone(),
            timestamp: now_millis(),
            message_type,
            origin: self.replica_id.clone(),
        }
    }

    /// Session handshake request.
    #[must_use]
    pub fn create_connect(&self, auth_token: Option<String>) -> Connect {
        Connect {
            header: self.header(MessageType::Connect, None),
            auth_token,
        }
    }

    /// Handshake reply to `connect_id`.
    #[must_use]
    pub fn create_connect_ack(&self, connect_id: &str) -> ConnectAck {
        ConnectAck {
            header: self.header(MessageType::ConnectAck, Some(connect_id)),
        }
    }

    /// Session teardown request.
    #[must_use]
    pub fn create_disconnect(&self) -> Disconnect {
        Disconnect {
            header: self.header(MessageType::Disconnect, None),
        }
    }

    /// Teardown reply to `disconnect_id`.
    #[must_use]
    pub fn create_disconnect_ack(&self, disconnect_id: &str) -> DisconnectAck {
        DisconnectAck {
            header: self.header(MessageType::DisconnectAck, Some(disconnect_id)),
        }
    }

    /// First page of a new batch; the batch id is the message id.
    #[must_use]
    pub fn create_change_start(&self, feed: LastWriteWinState) -> BatchChangeStart {
        let mut header = self.header(MessageType::BatchChangeStart, None);
        header.correlation_id = Some(header.id.clone());
        BatchChangeStart { header, feed }
    }

    /// Subsequent page of batch `batch_id`.
    #[must_use]
    pub fn create_change_continue(
        &self,
        batch_id: &str,
        feed: LastWriteWinState,
    ) -> BatchChangeContinue {
        BatchChangeContinue {
            header: self.header(MessageType::BatchChangeContinue, Some(batch_id)),
            feed,
        }
    }

    /// Close marker for batch `batch_id`, stamped with the batch start time.
    #[must_use]
    pub fn create_change_end(&self, batch_id: &str, start_time: i64) -> BatchChangeEnd {
        let mut header = self.header(MessageType::BatchChangeEnd, Some(batch_id));
        header.timestamp = start_time;
        BatchChangeEnd { header }
    }

    /// Receipt for page `acked_id` of batch `batch_id`.
    #[must_use]
    pub fn create_batch_ack(&self, batch_id: Option<&str>, acked_id: &str, receipt: Receipt) -> BatchAck {
        BatchAck {
            header: self.header(MessageType::BatchAck, batch_id),
            correlation_id: acked_id.to_string(),
            receipt,
        }
    }

    /// Reply to end marker `acked_id` of batch `batch_id`.
    #[must_use]
    pub fn create_batch_end_ack(&self, batch_id: Option<&str>, acked_id: &str) -> BatchEndAck {
        BatchEndAck {
            header: self.header(MessageType::BatchEndAck, batch_id),
            correlation_id: acked_id.to_string(),
        }
    }

    /// Standalone feed of local changes.
    #[must_use]
    pub fn create_feed_message(&self, feed: LastWriteWinState) -> DataGateFeed {
        let mut header = self.header(MessageType::DataGateFeed, None);
        header.correlation_id = Some(header.id.clone());
        DataGateFeed { header, feed }
    }

    /// Receipt for feed `acked_id`.
    #[must_use]
    pub fn create_feed_ack(&self, acked_id: &str, receipt: Receipt) -> DataGateFeedAck {
        DataGateFeedAck {
            header: self.header(MessageType::DataGateFeedAck, Some(acked_id)),
            correlation_id: acked_id.to_string(),
            receipt,
        }
    }

    /// Error report, optionally correlated with the offending message.
    #[must_use]
    pub fn create_error(
        &self,
        correlation_id: Option<&str>,
        error: impl Into<String>,
        fatal: bool,
    ) -> ErrorMessage {
        ErrorMessage {
            header: self.header(MessageType::Error, correlation_id),
            error: error.into(),
            fatal,
        }
    }
}
