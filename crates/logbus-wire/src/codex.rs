// Message framing on the connection byte stream: a one-byte discriminator then
// the body it announces.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use logbus_sof::{ObjectFrame, SofConfiguration, SofObject, SofRead, SofReader};
use tracing::{trace, warn};

use crate::registry::{self, type_ids};
use crate::{
    AggregatedPatternData, ChannelMessage, ChannelSubscriptionRequest, ChannelSubscriptionResponse,
    DefaultLogEvent, Error, EventSubscriptionRequest, EventSubscriptionResponse, FilterRequest,
    HistoricalDataRequest, HistoricalDataResponse, HistoricalIndexRequest,
    HistoricalIndexResponse, LogEventMessage, LoggingMessage, Result, SubscriptionRequest,
    SubscriptionResponse, UnsubscriptionRequest, UnsubscriptionResponse,
};

pub const DISCRIMINATOR_LOG_EVENT: i8 = 1;
pub const DISCRIMINATOR_LOG_EVENT_COLLECTION: i8 = 2;
pub const DISCRIMINATOR_SERIALISABLE_OBJECT: i8 = 98;
/// Reserved for a future extension header; never written.
pub const DISCRIMINATOR_EXTENDED: i8 = -127;

/// Encodes and decodes [`LoggingMessage`]s.
///
/// Decoding is resumable: an incomplete message reports
/// [`Error::PartialMessage`] and consumes nothing, so the caller retries from
/// the same position once more bytes have arrived.
///
/// ```
/// use bytes::BytesMut;
/// use logbus_wire::{FilterRequest, LoggingMessage, LoggingMessageCodex};
///
/// let codex = LoggingMessageCodex::new().expect("codex");
/// let mut buf = BytesMut::new();
/// codex
///     .encode(&mut buf, &LoggingMessage::FilterRequest(FilterRequest { level_filter: 900 }))
///     .expect("encode");
/// let decoded = codex.decode(&mut buf).expect("decode");
/// assert!(matches!(
///     decoded,
///     Some(LoggingMessage::FilterRequest(FilterRequest { level_filter: 900 }))
/// ));
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct LoggingMessageCodex {
    config: SofConfiguration,
    log_unknown_types: bool,
}

impl LoggingMessageCodex {
    pub fn new() -> Result<Self> {
        Ok(Self::with_configuration(registry::sof_configuration()?))
    }

    pub fn with_configuration(config: SofConfiguration) -> Self {
        Self {
            config,
            log_unknown_types: true,
        }
    }

    /// Turn off the warning logged for every skipped unknown type.
    pub fn log_unknown_types(mut self, enabled: bool) -> Self {
        self.log_unknown_types = enabled;
        self
    }

    pub fn configuration(&self) -> &SofConfiguration {
        &self.config
    }

    /// Append `message` to `buf`. On error the buffer is left as it was.
    pub fn encode(&self, buf: &mut BytesMut, message: &LoggingMessage) -> Result<()> {
        let mark = buf.len();
        let result = self.encode_message(buf, message);
        if result.is_err() {
            buf.truncate(mark);
        }
        result
    }

    pub fn encode_to_bytes(&self, message: &LoggingMessage) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, message)?;
        Ok(buf.freeze())
    }

    /// Decode the message at the front of `buf`, advancing past it on success.
    ///
    /// `Ok(None)` means a message of an unregistered type was skipped.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<LoggingMessage>> {
        let (message, used) = self.decode_slice(buf)?;
        buf.advance(used);
        Ok(message)
    }

    /// Decode from a borrowed slice, returning the message and the bytes it used.
    pub fn decode_slice(&self, input: &[u8]) -> Result<(Option<LoggingMessage>, usize)> {
        let Some((&first, body)) = input.split_first() else {
            return Err(Error::PartialMessage);
        };
        let discriminator = first as i8;
        trace!(discriminator, available = input.len(), "decoding message");
        match discriminator {
            DISCRIMINATOR_LOG_EVENT => {
                let (event, used) = self.decode_event(body)?;
                Ok((Some(LoggingMessage::LogEvent(event)), 1 + used))
            }
            DISCRIMINATOR_LOG_EVENT_COLLECTION => {
                let (events, used) = self.decode_collection(body)?;
                Ok((Some(LoggingMessage::LogEventCollection(events)), 1 + used))
            }
            DISCRIMINATOR_SERIALISABLE_OBJECT => {
                let frame = logbus_sof::decode_frame(body).map_err(partial)?;
                let used = 1 + frame.encoded_len();
                match self.decode_object(frame, body) {
                    Ok(message) => Ok((Some(message), used)),
                    Err(Error::Sof(logbus_sof::Error::UnknownType { type_id, length })) => {
                        metrics::counter!("logbus_codec_unknown_types_total").increment(1);
                        if self.log_unknown_types {
                            warn!(
                                type_id,
                                length,
                                frame_type_id = frame.type_id,
                                "skipping message with unknown sof type"
                            );
                        }
                        Ok((None, used))
                    }
                    Err(err) => Err(err),
                }
            }
            other => Err(Error::UnknownDiscriminator(other)),
        }
    }

    fn decode_event(&self, input: &[u8]) -> Result<(DefaultLogEvent, usize)> {
        logbus_sof::decode_object_as::<DefaultLogEvent>(input, &self.config).map_err(partial)
    }

    fn decode_collection(&self, input: &[u8]) -> Result<(Vec<DefaultLogEvent>, usize)> {
        if input.len() < 4 {
            return Err(Error::PartialMessage);
        }
        let count = (&input[..4]).get_i32();
        let count = usize::try_from(count).map_err(|_| {
            logbus_sof::Error::Malformed(format!("negative collection size {count}"))
        })?;
        let mut used = 4;
        let mut events = Vec::with_capacity(count.min(input.len() / logbus_sof::FRAME_HEADER_LEN));
        for _ in 0..count {
            let (event, len) = self.decode_event(&input[used..])?;
            events.push(event);
            used += len;
        }
        Ok((events, used))
    }

    // `framed` is the input from the frame header on, for types decoded through the registry.
    fn decode_object(&self, frame: ObjectFrame<'_>, framed: &[u8]) -> Result<LoggingMessage> {
        let mut reader = SofReader::new(frame.body, &self.config);
        macro_rules! read {
            ($variant:ident, $ty:ty) => {
                LoggingMessage::$variant(<$ty>::read_fields(&mut reader)?)
            };
        }

        let message = match frame.type_id {
            type_ids::DEFAULT_LOG_EVENT => read!(LogEvent, DefaultLogEvent),
            type_ids::LOG_EVENT_MESSAGE => {
                LoggingMessage::LogEvent(LogEventMessage::read_fields(&mut reader)?.event)
            }
            type_ids::CHANNEL_MESSAGE => read!(Channel, ChannelMessage),
            type_ids::SUBSCRIPTION_REQUEST => read!(SubscriptionRequest, SubscriptionRequest),
            type_ids::SUBSCRIPTION_RESPONSE => read!(SubscriptionResponse, SubscriptionResponse),
            type_ids::UNSUBSCRIPTION_REQUEST => {
                read!(UnsubscriptionRequest, UnsubscriptionRequest)
            }
            type_ids::UNSUBSCRIPTION_RESPONSE => {
                read!(UnsubscriptionResponse, UnsubscriptionResponse)
            }
            type_ids::EVENT_SUBSCRIPTION_REQUEST => {
                read!(EventSubscriptionRequest, EventSubscriptionRequest)
            }
            type_ids::EVENT_SUBSCRIPTION_RESPONSE => {
                read!(EventSubscriptionResponse, EventSubscriptionResponse)
            }
            type_ids::CHANNEL_SUBSCRIPTION_REQUEST => {
                read!(ChannelSubscriptionRequest, ChannelSubscriptionRequest)
            }
            type_ids::CHANNEL_SUBSCRIPTION_RESPONSE => {
                read!(ChannelSubscriptionResponse, ChannelSubscriptionResponse)
            }
            type_ids::FILTER_REQUEST => read!(FilterRequest, FilterRequest),
            type_ids::HISTORICAL_INDEX_REQUEST => {
                read!(HistoricalIndexRequest, HistoricalIndexRequest)
            }
            type_ids::HISTORICAL_INDEX_RESPONSE => {
                read!(HistoricalIndexResponse, HistoricalIndexResponse)
            }
            type_ids::HISTORICAL_DATA_REQUEST => read!(HistoricalDataRequest, HistoricalDataRequest),
            type_ids::HISTORICAL_DATA_RESPONSE => {
                read!(HistoricalDataResponse, HistoricalDataResponse)
            }
            type_ids::AGGREGATED_PATTERN_DATA => read!(AggregatedPatternData, AggregatedPatternData),
            _ => LoggingMessage::Opaque(logbus_sof::decode_object(framed, &self.config)?.0),
        };
        Ok(message)
    }

    fn encode_message(&self, buf: &mut BytesMut, message: &LoggingMessage) -> Result<()> {
        match message {
            LoggingMessage::LogEvent(event) => {
                buf.put_i8(DISCRIMINATOR_LOG_EVENT);
                logbus_sof::encode_object(buf, event, &self.config)?;
            }
            LoggingMessage::LogEventCollection(events) => {
                buf.put_i8(DISCRIMINATOR_LOG_EVENT_COLLECTION);
                buf.put_i32(i32::try_from(events.len()).map_err(|_| logbus_sof::Error::TooLarge)?);
                for event in events {
                    logbus_sof::encode_object(buf, event, &self.config)?;
                }
            }
            LoggingMessage::Channel(message) => self.put_object(buf, message)?,
            LoggingMessage::SubscriptionRequest(message) => self.put_object(buf, message)?,
            LoggingMessage::SubscriptionResponse(message) => self.put_object(buf, message)?,
            LoggingMessage::UnsubscriptionRequest(message) => self.put_object(buf, message)?,
            LoggingMessage::UnsubscriptionResponse(message) => self.put_object(buf, message)?,
            LoggingMessage::EventSubscriptionRequest(message) => self.put_object(buf, message)?,
            LoggingMessage::EventSubscriptionResponse(message) => self.put_object(buf, message)?,
            LoggingMessage::ChannelSubscriptionRequest(message) => {
                self.put_object(buf, message)?
            }
            LoggingMessage::ChannelSubscriptionResponse(message) => {
                self.put_object(buf, message)?
            }
            LoggingMessage::FilterRequest(message) => self.put_object(buf, message)?,
            LoggingMessage::HistoricalIndexRequest(message) => self.put_object(buf, message)?,
            LoggingMessage::HistoricalIndexResponse(message) => self.put_object(buf, message)?,
            LoggingMessage::HistoricalDataRequest(message) => self.put_object(buf, message)?,
            LoggingMessage::HistoricalDataResponse(message) => self.put_object(buf, message)?,
            LoggingMessage::AggregatedPatternData(message) => self.put_object(buf, message)?,
            LoggingMessage::Opaque(object) => self.put_object(buf, &**object)?,
        }
        Ok(())
    }

    fn put_object<T: SofObject + ?Sized>(&self, buf: &mut BytesMut, object: &T) -> Result<()> {
        buf.put_i8(DISCRIMINATOR_SERIALISABLE_OBJECT);
        logbus_sof::encode_object(buf, object, &self.config)?;
        Ok(())
    }
}

fn partial(err: logbus_sof::Error) -> Error {
    match err {
        logbus_sof::Error::PartialDecode => Error::PartialMessage,
        other => Error::Sof(other),
    }
}
