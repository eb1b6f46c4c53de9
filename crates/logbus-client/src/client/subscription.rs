// Channel subscribers and the router hooks that turn first/last subscriptions
// into hub handshakes.
use futures::FutureExt;
use futures::future::BoxFuture;
use logbus_common::ids::SubscriberId;
use logbus_router::SubscriptionHooks;
use logbus_wire::ChannelMessage;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use super::client::ClientInner;

type Handler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// A destination for channel messages.
///
/// Identity is the [`SubscriberId`]: two clones of one subscriber compare
/// equal, so the same subscriber can be removed or excluded from dispatch.
///
/// ```
/// use logbus_client::ChannelSubscriber;
/// use logbus_wire::ChannelMessage;
///
/// let (subscriber, mut rx) = ChannelSubscriber::channel(4);
/// subscriber.deliver(&ChannelMessage::default());
/// assert!(rx.try_recv().is_ok());
/// assert_eq!(subscriber.clone(), subscriber);
/// ```
#[derive(Clone)]
pub struct ChannelSubscriber {
    id: SubscriberId,
    handler: Handler,
}

impl ChannelSubscriber {
    pub fn new(handler: impl Fn(&ChannelMessage) + Send + Sync + 'static) -> Self {
        Self {
            id: SubscriberId::new(),
            handler: Arc::new(handler),
        }
    }

    /// A subscriber that forwards into a bounded queue. Messages that do not
    /// fit are dropped and counted.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Self::new(move |message| {
            if let Err(err) = tx.try_send(message.clone()) {
                metrics::counter!("logbus_client_channel_drops_total").increment(1);
                debug!(error = %err, channel = %message.channel_path(), "dropping channel message");
            }
        });
        (subscriber, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn deliver(&self, message: &ChannelMessage) {
        (self.handler)(message);
    }
}

impl PartialEq for ChannelSubscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelSubscriber {}

impl fmt::Debug for ChannelSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscriber")
            .field("id", &self.id)
            .finish()
    }
}

pub(crate) struct ClientHooks {
    pub(crate) client: Weak<ClientInner>,
}

impl SubscriptionHooks<ChannelSubscriber> for ClientHooks {
    fn handle_first_subscription(
        &self,
        channel: &str,
        _destination: &ChannelSubscriber,
    ) -> BoxFuture<'static, bool> {
        match self.client.upgrade() {
            Some(client) => client.start_channel_handshake(channel),
            None => futures::future::ready(false).boxed(),
        }
    }

    fn handle_last_subscription(&self, channel: &str, _destination: &ChannelSubscriber) {
        if let Some(client) = self.client.upgrade() {
            client.end_channel_subscription(channel);
        }
    }
}
