// A hub that lives in the same process. Connectors exchange encoded bytes with
// it directly, so clients run the same codec and handshake paths as over a
// socket without any network transport.
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use logbus_common::ids::ConnectionId;
use logbus_router::SubscriptionRouter;
use logbus_wire::{
    HistoricalDataResponse, HistoricalIndexResponse, Level, LoggingMessage, LoggingMessageCodex,
    SubscriptionResponse, UnsubscriptionResponse, parse_channel,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::connector::{ConnectionListener, Connector, ConnectorError};

const REJECTION_REASON: &str = "subscription rejected by hub";

/// In-process hub.
///
/// Answers subscription handshakes, applies level filters, fans log events
/// out to subscribed connections and routes channel messages. Switches on the
/// hub simulate an unresponsive or unreachable hub.
///
/// ```
/// use logbus_client::{ClientConfig, InProcessHub, SocketClient};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let hub = InProcessHub::new().expect("hub");
///     let client = SocketClient::new(hub.connector(), ClientConfig::default()).expect("client");
///     client.connect().await.expect("connect");
///     client.subscribe().await.expect("subscribe");
///     assert_eq!(hub.connection_count(), 1);
/// });
/// ```
#[derive(Clone)]
pub struct InProcessHub {
    state: Arc<HubState>,
}

struct HubConnection {
    listener: Weak<dyn ConnectionListener>,
    connected: Arc<AtomicBool>,
    global: bool,
    level_filter: Level,
    inbound: BytesMut,
}

struct HubState {
    codex: LoggingMessageCodex,
    connections: Mutex<HashMap<ConnectionId, HubConnection>>,
    // Channel messages by channel, and log events by their channel field.
    channel_router: SubscriptionRouter<ConnectionId>,
    event_router: SubscriptionRouter<ConnectionId>,
    answer_subscriptions: AtomicBool,
    refuse_sends: AtomicBool,
    refuse_connections: AtomicBool,
    rejecting: AtomicBool,
    received: Mutex<Vec<&'static str>>,
}

type Outbound = Vec<(ConnectionId, LoggingMessage)>;

impl InProcessHub {
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: Arc::new(HubState {
                codex: LoggingMessageCodex::new()?,
                connections: Mutex::new(HashMap::new()),
                channel_router: SubscriptionRouter::default(),
                event_router: SubscriptionRouter::default(),
                answer_subscriptions: AtomicBool::new(true),
                refuse_sends: AtomicBool::new(false),
                refuse_connections: AtomicBool::new(false),
                rejecting: AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
            }),
        })
    }

    /// A connector for one client. Each connector is a separate connection.
    pub fn connector(&self) -> Arc<InProcessConnector> {
        Arc::new(InProcessConnector {
            id: ConnectionId::new(),
            hub: Arc::downgrade(&self.state),
            listener: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// When off, subscription requests are accepted but never answered.
    pub fn set_answer_subscriptions(&self, answer: bool) {
        self.state
            .answer_subscriptions
            .store(answer, Ordering::SeqCst);
    }

    pub fn set_refuse_sends(&self, refuse: bool) {
        self.state.refuse_sends.store(refuse, Ordering::SeqCst);
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Answer channel and event subscriptions with `success = false`.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Drop every connection as if the hub restarted.
    pub fn drop_connections(&self) {
        let dropped: Vec<(ConnectionId, HubConnection)> =
            self.state.connections.lock().drain().collect();
        for (id, connection) in dropped {
            self.state.forget(&id);
            connection.connected.store(false, Ordering::SeqCst);
            if let Some(listener) = connection.listener.upgrade() {
                listener.on_connection_lost("hub dropped the connection");
            }
        }
    }

    /// Push raw bytes to every connection, bypassing the codec.
    pub fn send_raw_to_all(&self, bytes: &[u8]) {
        let listeners: Vec<Weak<dyn ConnectionListener>> = self
            .state
            .connections
            .lock()
            .values()
            .map(|connection| connection.listener.clone())
            .collect();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.on_bytes(bytes);
        }
    }

    pub fn send_to_all(&self, message: &LoggingMessage) -> Result<()> {
        let bytes = self.state.codex.encode_to_bytes(message)?;
        self.send_raw_to_all(&bytes);
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Channels with at least one subscribed connection.
    pub fn channels(&self) -> Vec<String> {
        self.state.channel_router.channels()
    }

    /// Kinds of every message the hub decoded, in arrival order.
    pub fn received_kinds(&self) -> Vec<&'static str> {
        self.state.received.lock().clone()
    }
}

impl HubState {
    fn forget(&self, id: &ConnectionId) {
        self.channel_router.remove_all_subscriptions(id);
        self.event_router.remove_all_subscriptions(id);
    }

    fn receive(&self, from: ConnectionId, bytes: &[u8]) -> Outbound {
        let mut messages = Vec::new();
        {
            let mut connections = self.connections.lock();
            let Some(connection) = connections.get_mut(&from) else {
                return Vec::new();
            };
            connection.inbound.extend_from_slice(bytes);
            while !connection.inbound.is_empty() {
                match self.codex.decode(&mut connection.inbound) {
                    Ok(Some(message)) => messages.push(message),
                    Ok(None) => continue,
                    Err(err) if !err.is_fatal() => break,
                    Err(err) => {
                        warn!(connection = %from, error = %err, "discarding undecodable client bytes");
                        connection.inbound.clear();
                        break;
                    }
                }
            }
        }

        let mut outbound = Vec::new();
        for message in messages {
            self.received.lock().push(message.kind());
            self.handle(from, message, &mut outbound);
        }
        outbound
    }

    fn handle(&self, from: ConnectionId, message: LoggingMessage, outbound: &mut Outbound) {
        let answer = self.answer_subscriptions.load(Ordering::SeqCst);
        let rejecting = self.rejecting.load(Ordering::SeqCst);
        let reason = rejecting.then(|| REJECTION_REASON.to_string());
        match message {
            LoggingMessage::SubscriptionRequest(_) => {
                self.update(from, |connection| connection.global = true);
                if answer {
                    outbound.push((from, LoggingMessage::SubscriptionResponse(SubscriptionResponse)));
                }
            }
            LoggingMessage::UnsubscriptionRequest(_) => {
                self.update(from, |connection| connection.global = false);
                if answer {
                    outbound.push((
                        from,
                        LoggingMessage::UnsubscriptionResponse(UnsubscriptionResponse),
                    ));
                }
            }
            LoggingMessage::FilterRequest(request) => {
                let level = Level(request.level_filter);
                debug!(connection = %from, %level, "level filter updated");
                self.update(from, |connection| connection.level_filter = level);
            }
            LoggingMessage::EventSubscriptionRequest(request) => {
                if !rejecting {
                    apply_subscription(&self.event_router, from, request.subscribe, &request.channels);
                }
                if answer {
                    let response = request.respond(!rejecting, reason);
                    outbound.push((from, LoggingMessage::EventSubscriptionResponse(response)));
                }
            }
            LoggingMessage::ChannelSubscriptionRequest(request) => {
                if !rejecting {
                    apply_subscription(&self.channel_router, from, request.subscribe, &request.channels);
                }
                if answer {
                    let response = request.respond(!rejecting, reason);
                    outbound.push((from, LoggingMessage::ChannelSubscriptionResponse(response)));
                }
            }
            LoggingMessage::LogEvent(event) => self.fan_out(vec![event], outbound),
            LoggingMessage::LogEventCollection(events) => self.fan_out(events, outbound),
            LoggingMessage::Channel(channel_message) => {
                // A connection gets one copy however many of its channels match;
                // the client routes it on from there.
                let mut targets = self.channel_router.destinations(&channel_message.channel);
                targets.retain(|id| *id != from);
                targets.sort_by_key(|id| id.as_uuid());
                targets.dedup();
                for id in targets {
                    outbound.push((id, LoggingMessage::Channel(channel_message.clone())));
                }
            }
            LoggingMessage::HistoricalIndexRequest(request) => {
                outbound.push((
                    from,
                    LoggingMessage::HistoricalIndexResponse(HistoricalIndexResponse {
                        elements: Vec::new(),
                        request_id: request.request_id,
                        last_batch: true,
                    }),
                ));
            }
            LoggingMessage::HistoricalDataRequest(request) => {
                outbound.push((
                    from,
                    LoggingMessage::HistoricalDataResponse(HistoricalDataResponse {
                        request_id: request.request_id,
                        block: None,
                        last_batch: true,
                    }),
                ));
            }
            other => trace!(kind = other.kind(), "hub ignoring message"),
        }
    }

    fn update(&self, id: ConnectionId, apply: impl FnOnce(&mut HubConnection)) {
        if let Some(connection) = self.connections.lock().get_mut(&id) {
            apply(connection);
        }
    }

    fn fan_out(&self, events: Vec<logbus_wire::DefaultLogEvent>, outbound: &mut Outbound) {
        for event in events {
            let mut targets: Vec<ConnectionId> = match &event.channel {
                Some(channel) => self.event_router.destinations(&parse_channel(channel)),
                None => Vec::new(),
            };
            {
                let connections = self.connections.lock();
                targets.extend(
                    connections
                        .iter()
                        .filter(|(_, connection)| connection.global)
                        .map(|(id, _)| *id),
                );
                targets.retain(|id| {
                    connections
                        .get(id)
                        .is_some_and(|connection| event.level().passes(connection.level_filter))
                });
            }
            targets.sort_by_key(|id| id.as_uuid());
            targets.dedup();
            for id in targets {
                outbound.push((id, LoggingMessage::LogEvent(event.clone())));
            }
        }
    }

    // Encode and hand messages to their connections, outside every hub lock.
    fn deliver(&self, outbound: Outbound) {
        for (to, message) in outbound {
            let bytes = match self.codex.encode_to_bytes(&message) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(kind = message.kind(), error = %err, "hub failed to encode message");
                    continue;
                }
            };
            let listener = self
                .connections
                .lock()
                .get(&to)
                .and_then(|connection| connection.listener.upgrade());
            if let Some(listener) = listener {
                listener.on_bytes(&bytes);
            }
        }
    }
}

fn apply_subscription(
    router: &SubscriptionRouter<ConnectionId>,
    from: ConnectionId,
    subscribe: bool,
    channels: &[String],
) {
    for channel in channels {
        if subscribe {
            drop(router.add_subscription(channel, from));
        } else {
            router.remove_subscription(channel, &from);
        }
    }
}

/// One client's connection to an [`InProcessHub`].
pub struct InProcessConnector {
    id: ConnectionId,
    hub: Weak<HubState>,
    listener: Mutex<Option<Weak<dyn ConnectionListener>>>,
    connected: Arc<AtomicBool>,
}

impl InProcessConnector {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> std::result::Result<(), ConnectorError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| ConnectorError::Refused("hub stopped".to_string()))?;
        if hub.refuse_connections.load(Ordering::SeqCst) {
            return Err(ConnectorError::Refused("hub refused the connection".to_string()));
        }
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            return Err(ConnectorError::Refused("no connection listener set".to_string()));
        };
        hub.connections.lock().insert(
            self.id,
            HubConnection {
                listener,
                connected: Arc::clone(&self.connected),
                global: false,
                level_filter: Level::ALL,
                inbound: BytesMut::new(),
            },
        );
        self.connected.store(true, Ordering::SeqCst);
        debug!(connection = %self.id, "in-process connection established");
        if let Some(listener) = self.listener() {
            listener.on_connection_established();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.connections.lock().remove(&self.id);
            hub.forget(&self.id);
        }
        if let Some(listener) = self.listener() {
            listener.on_connection_lost("disconnected");
        }
    }

    async fn close(&self) {
        self.disconnect().await;
    }

    async fn send(&self, bytes: Bytes) -> std::result::Result<(), ConnectorError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectorError::NotConnected);
        }
        let hub = self.hub.upgrade().ok_or(ConnectorError::Closed)?;
        if hub.refuse_sends.load(Ordering::SeqCst) {
            return Err(ConnectorError::SendFailed("hub refused the send".to_string()));
        }
        let outbound = hub.receive(self.id, &bytes);
        hub.deliver(outbound);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_listener(&self, listener: Weak<dyn ConnectionListener>) {
        *self.listener.lock() = Some(listener);
    }
}

impl Drop for InProcessConnector {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.connections.lock().remove(&self.id);
            hub.forget(&self.id);
        }
    }
}
