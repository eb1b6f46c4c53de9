// The transport seam. A connector owns the raw byte stream to one hub; the
// client above it only sees whole sends and inbound byte chunks.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Weak;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("not connected to a hub")]
    NotConnected,
    #[error("connector is closed")]
    Closed,
    #[error("hub refused the connection: {0}")]
    Refused(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl ConnectorError {
    /// The hub could not be reached; the caller may retry later.
    pub fn is_hub_unavailable(&self) -> bool {
        matches!(
            self,
            ConnectorError::NotConnected | ConnectorError::Refused(_) | ConnectorError::SendFailed(_)
        )
    }
}

/// Connection lifecycle and inbound data, reported by a [`Connector`].
pub trait ConnectionListener: Send + Sync {
    fn on_connection_established(&self);

    fn on_connection_lost(&self, reason: &str);

    /// A chunk of the inbound byte stream. Chunks need not align with messages.
    fn on_bytes(&self, bytes: &[u8]);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(), ConnectorError>;

    async fn disconnect(&self);

    /// Disconnect and refuse any later `connect`.
    async fn close(&self);

    async fn send(&self, bytes: Bytes) -> Result<(), ConnectorError>;

    fn is_connected(&self) -> bool;

    /// Install the listener. Held weakly so the connector never keeps its client alive.
    fn set_listener(&self, listener: Weak<dyn ConnectionListener>);
}
