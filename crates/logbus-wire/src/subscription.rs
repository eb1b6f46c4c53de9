// Subscription handshakes and the level filter.
use logbus_sof::{SofObject, SofRead, SofReader, SofWriter};

use crate::DefaultLogEvent;

macro_rules! empty_message {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl SofObject for $name {
            fn write_fields(&self, _writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
                Ok(())
            }
        }

        impl SofRead for $name {
            fn read_fields(_reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
                Ok($name)
            }
        }
    };
}

empty_message!(
    /// Ask the hub for every log event it receives.
    SubscriptionRequest
);
empty_message!(SubscriptionResponse);
empty_message!(
    /// Stop receiving the global event stream.
    UnsubscriptionRequest
);
empty_message!(UnsubscriptionResponse);

macro_rules! channel_handshake {
    ($request:ident, $response:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $request {
            pub subscribe: bool,
            pub channels: Vec<String>,
            pub request_id: i32,
        }

        impl $request {
            pub fn new(subscribe: bool, channels: Vec<String>, request_id: i32) -> Self {
                Self {
                    subscribe,
                    channels,
                    request_id,
                }
            }

            /// The hub's answer to this request.
            pub fn respond(&self, success: bool, reason: Option<String>) -> $response {
                $response {
                    subscribe: self.subscribe,
                    channels: self.channels.clone(),
                    request_id: self.request_id,
                    success,
                    reason,
                }
            }
        }

        impl SofObject for $request {
            fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
                writer.write(1, self.subscribe)?;
                writer.write_string_array(2, Some(self.channels.as_slice()))?;
                writer.write(3, self.request_id)
            }
        }

        impl SofRead for $request {
            fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
                Ok(Self {
                    subscribe: reader.read(1)?.unwrap_or_default(),
                    channels: reader.read_string_array(2)?.unwrap_or_default(),
                    request_id: reader.read(3)?.unwrap_or_default(),
                })
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $response {
            pub subscribe: bool,
            pub channels: Vec<String>,
            pub request_id: i32,
            pub success: bool,
            pub reason: Option<String>,
        }

        impl SofObject for $response {
            fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
                writer.write(1, self.subscribe)?;
                writer.write_string_array(2, Some(self.channels.as_slice()))?;
                writer.write(3, self.request_id)?;
                writer.write(4, self.success)?;
                writer.write_string(5, self.reason.as_deref())
            }
        }

        impl SofRead for $response {
            fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
                Ok(Self {
                    subscribe: reader.read(1)?.unwrap_or_default(),
                    channels: reader.read_string_array(2)?.unwrap_or_default(),
                    request_id: reader.read(3)?.unwrap_or_default(),
                    success: reader.read(4)?.unwrap_or_default(),
                    reason: reader.read_string(5)?,
                })
            }
        }
    };
}

channel_handshake!(ChannelSubscriptionRequest, ChannelSubscriptionResponse);
channel_handshake!(EventSubscriptionRequest, EventSubscriptionResponse);

/// Ask the hub to only forward events at or above `level_filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterRequest {
    pub level_filter: i32,
}

impl SofObject for FilterRequest {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(0, self.level_filter)
    }
}

impl SofRead for FilterRequest {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            level_filter: reader.read(0)?.unwrap_or_default(),
        })
    }
}

/// A log event wrapped as a nested object rather than sent with the log event
/// discriminator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogEventMessage {
    pub event: DefaultLogEvent,
}

impl SofObject for LogEventMessage {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write_object(1, Some(&self.event))
    }
}

impl SofRead for LogEventMessage {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            event: reader.read_object_as(1)?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use bytes::BytesMut;

    fn round_trip<T: SofObject + SofRead>(message: &T) -> T {
        let config = registry::sof_configuration().expect("config");
        let mut buf = BytesMut::new();
        logbus_sof::encode_object(&mut buf, message, &config).expect("encode");
        logbus_sof::decode_object_as::<T>(&buf, &config)
            .expect("decode")
            .0
    }

    #[test]
    fn response_echoes_request() {
        let request = ChannelSubscriptionRequest::new(true, vec!["a/b".into()], 5);
        let response = request.respond(false, Some("denied".into()));
        assert_eq!(response.request_id, 5);
        assert_eq!(response.channels, vec!["a/b"]);
        assert!(response.subscribe);
        assert_eq!(round_trip(&response), response);
    }

    #[test]
    fn event_subscription_shares_layout() {
        let request = EventSubscriptionRequest::new(false, vec!["x".into(), "y".into()], 9);
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn filter_request_uses_field_zero() {
        let config = registry::sof_configuration().expect("config");
        let mut buf = BytesMut::new();
        {
            let mut writer = SofWriter::new(&mut buf, &config);
            FilterRequest { level_filter: 900 }
                .write_fields(&mut writer)
                .expect("write");
        }
        assert_eq!(&buf[..4], &0i32.to_be_bytes());
        assert_eq!(round_trip(&FilterRequest { level_filter: 900 }).level_filter, 900);
    }

    #[test]
    fn empty_messages_have_no_body() {
        let config = registry::sof_configuration().expect("config");
        let mut buf = BytesMut::new();
        logbus_sof::encode_object(&mut buf, &SubscriptionRequest, &config).expect("encode");
        assert_eq!(buf.len(), logbus_sof::FRAME_HEADER_LEN);
        assert_eq!(round_trip(&UnsubscriptionResponse), UnsubscriptionResponse);
    }
}
