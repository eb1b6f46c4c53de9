// Client side of a logbus connection: talks to a hub through a `Connector`,
// keeps channel subscriptions alive across reconnects and publishes log events
// through a bounded dispatch queue.
//
// CLIENT DESIGN NOTES
// -------------------
// - Every outbound byte goes through one writer task per client, fed by a
//   bounded queue. Sends leave in call order and nothing writes to the
//   connector concurrently.
// - Inbound bytes arrive on the connector's thread of control. They are
//   buffered, decoded into whole messages and handled outside the buffer lock.
// - Hook callbacks from the subscription router run under the router lock, so
//   they only queue work (`try_send` on the writer queue) and never await.
// - With `keep_connected` a manager task owns reconnection. Connector callbacks
//   only record the state change and wake it; it never holds the client alive
//   while sleeping.
use std::time::Duration;

pub mod appender;
pub mod client;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod inprocess;

pub use appender::Appender;
pub use client::client::{MessageListener, SocketClient};
pub use client::manager::{ConnectionState, ConnectionStateListener};
pub use client::subscription::ChannelSubscriber;
pub use config::{ClientConfig, DispatchConfig};
pub use connector::{ConnectionListener, Connector, ConnectorError};
pub use dispatch::backoff::Backoff;
pub use dispatch::{DispatchQueue, EventSink, EventSnapshot, PublishingListener};
pub use inprocess::{InProcessConnector, InProcessHub};

pub use logbus_router::AckFuture;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Codec(#[from] logbus_wire::Error),
    #[error("timed out after {waited:?} waiting for {request}")]
    Timeout {
        waited: Duration,
        request: &'static str,
    },
    #[error("hub rejected subscription to {channel:?}: {reason}")]
    SubscriptionRejected { channel: String, reason: String },
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Conditions worth retrying: the hub may answer or come back later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Timeout { .. } => true,
            ClientError::Connector(err) => err.is_hub_unavailable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests;
