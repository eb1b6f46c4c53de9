// Logbus message layer: the payload types exchanged with a hub and the codex
// that frames them on a byte stream.
use std::sync::Arc;

use logbus_sof::SofObject;

mod aggregation;
mod channel;
mod codex;
pub mod compression;
mod event;
mod history;
pub mod registry;
mod subscription;

pub use aggregation::{AggregatedPatternData, AggregationKey, AggregationType};
pub use channel::{ChannelMessage, Channels, join_channel, parse_channel};
pub use codex::{
    DISCRIMINATOR_EXTENDED, DISCRIMINATOR_LOG_EVENT, DISCRIMINATOR_LOG_EVENT_COLLECTION,
    DISCRIMINATOR_SERIALISABLE_OBJECT, LoggingMessageCodex,
};
pub use compression::{
    CompressedBlock, CompressionRegistry, CompressionStrategy, NoopCompression,
    SerialisationStrategy,
};
pub use event::{DefaultLogEvent, Level};
pub use history::{
    HistoricalDataRequest, HistoricalDataResponse, HistoricalIndexElement,
    HistoricalIndexRequest, HistoricalIndexResponse,
};
pub use subscription::{
    ChannelSubscriptionRequest, ChannelSubscriptionResponse, EventSubscriptionRequest,
    EventSubscriptionResponse, FilterRequest, LogEventMessage, SubscriptionRequest,
    SubscriptionResponse, UnsubscriptionRequest, UnsubscriptionResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("incomplete message")]
    PartialMessage,
    #[error("unknown message discriminator {0}")]
    UnknownDiscriminator(i8),
    #[error(transparent)]
    Sof(#[from] logbus_sof::Error),
    #[error("compression strategy {0} is not registered")]
    UnknownCompression(i8),
    #[error("serialisation strategy {0} is not supported")]
    UnknownSerialisation(i8),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("compressed block declared {expected} items but held {found}")]
    ItemCount { expected: usize, found: usize },
}

impl Error {
    /// Errors on the decode path that leave the byte stream out of sync.
    ///
    /// A partial message is the only condition that is resolved by waiting for
    /// more bytes; everything else means the connection has to be dropped.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::PartialMessage => false,
            Error::Sof(err) => !err.is_recoverable(),
            _ => true,
        }
    }
}

/// Every message that travels between a client and a hub.
#[derive(Debug, Clone)]
pub enum LoggingMessage {
    LogEvent(DefaultLogEvent),
    LogEventCollection(Vec<DefaultLogEvent>),
    Channel(ChannelMessage),
    SubscriptionRequest(SubscriptionRequest),
    SubscriptionResponse(SubscriptionResponse),
    UnsubscriptionRequest(UnsubscriptionRequest),
    UnsubscriptionResponse(UnsubscriptionResponse),
    EventSubscriptionRequest(EventSubscriptionRequest),
    EventSubscriptionResponse(EventSubscriptionResponse),
    ChannelSubscriptionRequest(ChannelSubscriptionRequest),
    ChannelSubscriptionResponse(ChannelSubscriptionResponse),
    FilterRequest(FilterRequest),
    HistoricalIndexRequest(HistoricalIndexRequest),
    HistoricalIndexResponse(HistoricalIndexResponse),
    HistoricalDataRequest(HistoricalDataRequest),
    HistoricalDataResponse(HistoricalDataResponse),
    AggregatedPatternData(AggregatedPatternData),
    /// Any other registered payload type.
    Opaque(Arc<dyn SofObject>),
}

impl LoggingMessage {
    /// Request id carried by request/response messages.
    pub fn request_id(&self) -> Option<i32> {
        match self {
            LoggingMessage::EventSubscriptionRequest(message) => Some(message.request_id),
            LoggingMessage::EventSubscriptionResponse(message) => Some(message.request_id),
            LoggingMessage::ChannelSubscriptionRequest(message) => Some(message.request_id),
            LoggingMessage::ChannelSubscriptionResponse(message) => Some(message.request_id),
            LoggingMessage::HistoricalIndexRequest(message) => Some(message.request_id),
            LoggingMessage::HistoricalIndexResponse(message) => Some(message.request_id),
            LoggingMessage::HistoricalDataRequest(message) => Some(message.request_id),
            LoggingMessage::HistoricalDataResponse(message) => Some(message.request_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LoggingMessage::LogEvent(_) => "log_event",
            LoggingMessage::LogEventCollection(_) => "log_event_collection",
            LoggingMessage::Channel(_) => "channel",
            LoggingMessage::SubscriptionRequest(_) => "subscription_request",
            LoggingMessage::SubscriptionResponse(_) => "subscription_response",
            LoggingMessage::UnsubscriptionRequest(_) => "unsubscription_request",
            LoggingMessage::UnsubscriptionResponse(_) => "unsubscription_response",
            LoggingMessage::EventSubscriptionRequest(_) => "event_subscription_request",
            LoggingMessage::EventSubscriptionResponse(_) => "event_subscription_response",
            LoggingMessage::ChannelSubscriptionRequest(_) => "channel_subscription_request",
            LoggingMessage::ChannelSubscriptionResponse(_) => "channel_subscription_response",
            LoggingMessage::FilterRequest(_) => "filter_request",
            LoggingMessage::HistoricalIndexRequest(_) => "historical_index_request",
            LoggingMessage::HistoricalIndexResponse(_) => "historical_index_response",
            LoggingMessage::HistoricalDataRequest(_) => "historical_data_request",
            LoggingMessage::HistoricalDataResponse(_) => "historical_data_response",
            LoggingMessage::AggregatedPatternData(_) => "aggregated_pattern_data",
            LoggingMessage::Opaque(_) => "opaque",
        }
    }
}

impl From<DefaultLogEvent> for LoggingMessage {
    fn from(event: DefaultLogEvent) -> Self {
        LoggingMessage::LogEvent(event)
    }
}

impl From<ChannelMessage> for LoggingMessage {
    fn from(message: ChannelMessage) -> Self {
        LoggingMessage::Channel(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_message_is_not_fatal() {
        assert!(!Error::PartialMessage.is_fatal());
        assert!(Error::UnknownDiscriminator(7).is_fatal());
        assert!(!Error::Sof(logbus_sof::Error::PartialDecode).is_fatal());
        assert!(Error::Sof(logbus_sof::Error::Malformed("bad".into())).is_fatal());
    }

    #[test]
    fn request_id_is_exposed_for_correlated_messages() {
        let message = LoggingMessage::ChannelSubscriptionResponse(ChannelSubscriptionResponse {
            subscribe: true,
            channels: vec!["a".into()],
            request_id: 12,
            success: true,
            reason: None,
        });
        assert_eq!(message.request_id(), Some(12));
        assert_eq!(message.kind(), "channel_subscription_response");
        let event = LoggingMessage::from(DefaultLogEvent::default());
        assert_eq!(event.request_id(), None);
    }
}
