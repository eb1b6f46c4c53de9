// SocketClient: subscriptions, request/response correlation and inbound decoding
// on top of a `Connector`.
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::FutureExt;
use futures::future::BoxFuture;
use logbus_router::{AckFuture, SubscriptionRouter};
use logbus_wire::{
    ChannelSubscriptionRequest, DefaultLogEvent, EventSubscriptionRequest, FilterRequest,
    HistoricalDataRequest, HistoricalIndexRequest, Level, LoggingMessage, LoggingMessageCodex,
    SubscriptionRequest, UnsubscriptionRequest,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::correlation::{Correlation, PendingRequests};
use super::manager::{ConnectionManager, ConnectionState};
use super::subscription::{ChannelSubscriber, ClientHooks};
use super::writer::{WriterCommand, spawn_writer};
use crate::config::ClientConfig;
use crate::connector::{ConnectionListener, Connector, ConnectorError};
use crate::dispatch::EventSink;
use crate::dispatch::backoff::Backoff;
use crate::{ClientError, Result};

/// Callback for every message the client receives.
pub type MessageListener = Arc<dyn Fn(&LoggingMessage) + Send + Sync>;

/// Connection to one hub.
///
/// Cloning is cheap and every clone drives the same connection. Must be
/// created inside a tokio runtime: construction spawns the writer task.
///
/// ```
/// use logbus_client::{ChannelSubscriber, ClientConfig, InProcessHub, SocketClient};
/// use logbus_wire::{ChannelMessage, Level, LoggingMessage};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let hub = InProcessHub::new().expect("hub");
///     let consumer = SocketClient::new(hub.connector(), ClientConfig::default()).expect("client");
///     let producer = SocketClient::new(hub.connector(), ClientConfig::default()).expect("client");
///     consumer.connect().await.expect("connect");
///     producer.connect().await.expect("connect");
///
///     let (subscriber, mut rx) = ChannelSubscriber::channel(8);
///     assert!(consumer.add_subscription("metrics", subscriber).await);
///
///     let payload = Arc::new(logbus_wire::DefaultLogEvent::new(Level::INFO, "demo", "cpu high"));
///     producer
///         .send_blocking(&LoggingMessage::Channel(ChannelMessage::new("metrics/cpu", payload)))
///         .await
///         .expect("send");
///     let message = rx.recv().await.expect("delivered");
///     assert_eq!(message.channel_path(), "metrics/cpu");
/// });
/// ```
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    codex: LoggingMessageCodex,
    connector: Arc<dyn Connector>,
    router: SubscriptionRouter<ChannelSubscriber>,
    pending: PendingRequests,
    // Listener registry mutated on add/remove; the snapshot is read per message.
    listeners: Mutex<Vec<(u64, MessageListener)>>,
    listeners_snapshot: ArcSwap<Vec<MessageListener>>,
    next_listener_id: AtomicU64,
    next_request_id: AtomicI32,
    auto_channels: Mutex<BTreeSet<String>>,
    level_filter: AtomicI32,
    // Inbound bytes not yet forming a whole message.
    inbound: Mutex<BytesMut>,
    writer_tx: mpsc::Sender<WriterCommand>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    manager: ConnectionManager,
    closed: AtomicBool,
}

impl SocketClient {
    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Self> {
        let codex = LoggingMessageCodex::new()?;
        let (writer_tx, writer_handle) =
            spawn_writer(Arc::clone(&connector), config.outbound_queue_depth);
        let auto_channels = config.auto_channels.iter().cloned().collect();
        let level_filter = config.level_filter.value();
        let inner = Arc::new_cyclic(|client: &Weak<ClientInner>| ClientInner {
            router: SubscriptionRouter::new(Arc::new(ClientHooks {
                client: client.clone(),
            })),
            config,
            codex,
            connector,
            pending: PendingRequests::default(),
            listeners: Mutex::new(Vec::new()),
            listeners_snapshot: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            next_request_id: AtomicI32::new(0),
            auto_channels: Mutex::new(auto_channels),
            level_filter: AtomicI32::new(level_filter),
            inbound: Mutex::new(BytesMut::new()),
            writer_tx,
            writer_handle: Mutex::new(Some(writer_handle)),
            manager: ConnectionManager::new(),
            closed: AtomicBool::new(false),
        });
        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        let listener: Weak<dyn ConnectionListener> = weak;
        inner.connector.set_listener(listener);
        Ok(Self { inner })
    }

    pub(super) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connect, then replay the auto subscriptions and level filter when
    /// `auto_subscribe` is set. Channel subscriptions held by the router are
    /// re-sent as soon as the connector reports the connection.
    ///
    /// With `keep_connected` set, a connection manager then reconnects after
    /// every loss until [`disconnect`](Self::disconnect) or [`close`](Self::close).
    pub async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        debug!("connecting to hub");
        if !self.inner.connector.is_connected() {
            self.inner.manager.set_state(ConnectionState::Connecting);
        }
        if let Err(err) = self.inner.connector.connect().await {
            if !self.inner.connector.is_connected() {
                self.inner.manager.set_state(ConnectionState::NotConnected);
            }
            return Err(err.into());
        }
        if self.inner.config.keep_connected {
            self.start_connection_manager();
        }
        self.replay_auto_subscriptions().await
    }

    /// Keep the client connected from now on, connecting in the background
    /// if it is not connected yet.
    pub fn keep_connected(&self) -> Result<()> {
        self.ensure_open()?;
        self.start_connection_manager();
        Ok(())
    }

    fn start_connection_manager(&self) {
        self.inner.manager.start(
            Arc::downgrade(&self.inner),
            Backoff::from_config(&self.inner.config.dispatch),
        );
    }

    pub(super) async fn replay_auto_subscriptions(&self) -> Result<()> {
        if !self.inner.config.auto_subscribe {
            return Ok(());
        }
        if self.inner.config.auto_global_subscription {
            debug!("auto-subscribing to the global event stream");
            self.subscribe().await?;
        }
        for channel in self.auto_subscriptions() {
            info!(channel = %channel, "auto-subscribing to channel");
            self.subscribe_to(&channel).await?;
        }
        let level = self.level_filter();
        if level != Level::ALL {
            debug!(%level, "sending level filter");
            self.send(&LoggingMessage::FilterRequest(FilterRequest {
                level_filter: level.value(),
            }))
            .await?;
        }
        Ok(())
    }

    /// Drop the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        self.inner.manager.stop();
        self.inner.connector.disconnect().await;
    }

    /// Close the connector and stop the writer task. Outstanding waiters fail
    /// and later calls return [`ClientError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.manager.stop();
        self.inner.pending.fail_all();
        self.inner.connector.close().await;
        let _ = self.inner.writer_tx.send(WriterCommand::Shutdown).await;
        let handle = self.inner.writer_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "writer task ended abnormally");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connector.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Register `listener` for connection state changes, called with
    /// `(from, to)`. Returns an id for removal.
    pub fn add_connection_state_listener(
        &self,
        listener: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> u64 {
        self.inner.manager.add_listener(Arc::new(listener))
    }

    pub fn remove_connection_state_listener(&self, id: u64) -> bool {
        self.inner.manager.remove_listener(id)
    }

    /// Queue `message` on the writer task. A failed send is only logged.
    pub async fn send(&self, message: &LoggingMessage) -> Result<()> {
        self.ensure_open()?;
        let bytes = self.inner.codex.encode_to_bytes(message)?;
        self.inner
            .writer_tx
            .send(WriterCommand::Send {
                bytes,
                kind: message.kind(),
                response: None,
            })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Send `message` and wait for the connector's result.
    pub async fn send_blocking(&self, message: &LoggingMessage) -> Result<()> {
        self.ensure_open()?;
        let bytes = self.inner.codex.encode_to_bytes(message)?;
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        self.inner
            .writer_tx
            .send(WriterCommand::Send {
                bytes,
                kind: message.kind(),
                response: Some(response_tx),
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        response_rx
            .await
            .map_err(|_| ClientError::Closed)?
            .map_err(ClientError::from)
    }

    /// Subscribe to the hub's global event stream.
    pub async fn subscribe(&self) -> Result<()> {
        self.request(
            Correlation::Subscribe,
            &LoggingMessage::SubscriptionRequest(SubscriptionRequest),
            "subscription response",
        )
        .await
        .map(|_| ())
    }

    /// Ask the hub for log events published on `channel`.
    pub async fn subscribe_to(&self, channel: &str) -> Result<()> {
        let request_id = self.next_request_id();
        let request = EventSubscriptionRequest::new(true, vec![channel.to_string()], request_id);
        let response = self
            .request(
                Correlation::Request(request_id),
                &LoggingMessage::EventSubscriptionRequest(request),
                "event subscription response",
            )
            .await?;
        match response {
            LoggingMessage::EventSubscriptionResponse(response) if !response.success => {
                Err(ClientError::SubscriptionRejected {
                    channel: channel.to_string(),
                    reason: response
                        .reason
                        .unwrap_or_else(|| "no reason given".to_string()),
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.request(
            Correlation::Unsubscribe,
            &LoggingMessage::UnsubscriptionRequest(UnsubscriptionRequest),
            "unsubscription response",
        )
        .await
        .map(|_| ())
    }

    /// Route channel messages on `channel` (and below it) to `subscriber`.
    ///
    /// The first subscriber on a channel triggers one hub handshake; the
    /// returned future resolves with its outcome for every subscriber.
    pub fn add_subscription(&self, channel: &str, subscriber: ChannelSubscriber) -> AckFuture {
        self.inner.router.add_subscription(channel, subscriber)
    }

    pub fn remove_subscription(&self, channel: &str, subscriber: &ChannelSubscriber) -> bool {
        self.inner.router.remove_subscription(channel, subscriber)
    }

    pub fn remove_all_subscriptions(&self, subscriber: &ChannelSubscriber) -> usize {
        self.inner.router.remove_all_subscriptions(subscriber)
    }

    /// Channels with at least one local subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.inner.router.channels()
    }

    /// Channel to subscribe to on every `connect()`.
    pub fn add_auto_subscription(&self, channel: &str) {
        self.inner.auto_channels.lock().insert(channel.to_string());
    }

    pub fn remove_auto_subscription(&self, channel: &str) -> bool {
        self.inner.auto_channels.lock().remove(channel)
    }

    pub fn auto_subscriptions(&self) -> Vec<String> {
        self.inner.auto_channels.lock().iter().cloned().collect()
    }

    /// Ask the hub to only forward events at or above `level`.
    pub async fn set_level_filter(&self, level: Level) -> Result<()> {
        self.inner.level_filter.store(level.value(), Ordering::SeqCst);
        self.send(&LoggingMessage::FilterRequest(FilterRequest {
            level_filter: level.value(),
        }))
        .await
    }

    pub fn level_filter(&self) -> Level {
        Level(self.inner.level_filter.load(Ordering::SeqCst))
    }

    /// Returns the request id the response will carry.
    pub async fn send_historical_index_request(&self, start: i64, end: i64) -> Result<i32> {
        let request_id = self.next_request_id();
        info!(request_id, start, end, "sending history index request");
        self.send(&LoggingMessage::HistoricalIndexRequest(
            HistoricalIndexRequest {
                request_id,
                start,
                end,
            },
        ))
        .await?;
        Ok(request_id)
    }

    /// Sends `request` under a fresh request id, which is returned.
    pub async fn send_historical_data_request(
        &self,
        mut request: HistoricalDataRequest,
    ) -> Result<i32> {
        request.request_id = self.next_request_id();
        let request_id = request.request_id;
        self.send(&LoggingMessage::HistoricalDataRequest(request))
            .await?;
        Ok(request_id)
    }

    /// Register `listener` for every inbound message. Returns an id for removal.
    pub fn add_message_listener(
        &self,
        listener: impl Fn(&LoggingMessage) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.inner.listeners.lock();
        listeners.push((id, Arc::new(listener)));
        self.inner.rebuild_listener_snapshot(&listeners);
        id
    }

    pub fn remove_message_listener(&self, id: u64) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            self.inner.rebuild_listener_snapshot(&listeners);
        }
        removed
    }

    /// Next request id. Ids start at 0 and are shared by every request kind.
    pub fn next_request_id(&self) -> i32 {
        self.inner.next_request_id()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn request(
        &self,
        key: Correlation,
        message: &LoggingMessage,
        awaiting: &'static str,
    ) -> Result<LoggingMessage> {
        let waiter = self.inner.pending.register(key);
        if let Err(err) = self.send_blocking(message).await {
            self.inner.abandon(key);
            return Err(err);
        }
        let waited = self.inner.config.request_timeout;
        match tokio::time::timeout(waited, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.inner.abandon(key);
                metrics::counter!("logbus_client_request_timeouts_total").increment(1);
                warn!(?waited, awaiting, "hub did not answer in time");
                Err(ClientError::Timeout {
                    waited,
                    request: awaiting,
                })
            }
        }
    }
}

impl fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClient")
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("channels", &self.inner.router.channels())
            .finish()
    }
}

#[async_trait]
impl EventSink for SocketClient {
    async fn publish(&self, event: &DefaultLogEvent) -> Result<()> {
        self.send_blocking(&LoggingMessage::LogEvent(event.clone()))
            .await
    }

    async fn close(&self) {
        SocketClient::close(self).await;
    }
}

impl ClientInner {
    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(super) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub(super) fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    fn next_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    // Global handshakes share one key with concurrent callers; only drop
    // waiters that belong to a single request.
    fn abandon(&self, key: Correlation) {
        if matches!(key, Correlation::Request(_)) {
            self.pending.cancel(key);
        }
    }

    fn rebuild_listener_snapshot(&self, listeners: &[(u64, MessageListener)]) {
        let snapshot = listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        self.listeners_snapshot.store(Arc::new(snapshot));
    }

    // Queue without waiting; used from callbacks that must not await.
    fn queue(&self, message: &LoggingMessage) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let bytes = self.codex.encode_to_bytes(message)?;
        self.writer_tx
            .try_send(WriterCommand::Send {
                bytes,
                kind: message.kind(),
                response: None,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => ClientError::Connector(ConnectorError::SendFailed(
                    "outbound queue full".to_string(),
                )),
                TrySendError::Closed(_) => ClientError::Closed,
            })
    }

    pub(crate) fn start_channel_handshake(&self, channel: &str) -> BoxFuture<'static, bool> {
        let request_id = self.next_request_id();
        let waiter = self.pending.register_handshake(request_id);
        // While disconnected the handshake goes out with the reconnect replay.
        if self.connector.is_connected() {
            let request =
                ChannelSubscriptionRequest::new(true, vec![channel.to_string()], request_id);
            if let Err(err) = self.queue(&LoggingMessage::ChannelSubscriptionRequest(request)) {
                debug!(channel, error = %err, "channel subscription deferred until reconnect");
            }
        }
        async move {
            match waiter.await {
                Ok(LoggingMessage::ChannelSubscriptionResponse(response)) => response.success,
                _ => false,
            }
        }
        .boxed()
    }

    pub(crate) fn end_channel_subscription(&self, channel: &str) {
        let request = ChannelSubscriptionRequest::new(
            false,
            vec![channel.to_string()],
            self.next_request_id(),
        );
        if let Err(err) = self.queue(&LoggingMessage::ChannelSubscriptionRequest(request)) {
            warn!(channel, error = %err, "failed to send channel unsubscription");
        }
    }

    fn reestablish_subscriptions(&self) {
        let channels = self.router.channels();
        if channels.is_empty() {
            return;
        }
        let request_id = self.next_request_id();
        let rekeyed = self.pending.rekey_handshakes(request_id);
        debug!(
            request_id,
            channels = channels.len(),
            rekeyed,
            "re-establishing channel subscriptions"
        );
        let request = ChannelSubscriptionRequest::new(true, channels, request_id);
        if let Err(err) = self.queue(&LoggingMessage::ChannelSubscriptionRequest(request)) {
            warn!(error = %err, "failed to re-establish channel subscriptions");
        }
    }

    fn handle_message(&self, message: LoggingMessage) {
        trace!(kind = message.kind(), "message received");
        for listener in self.listeners_snapshot.load().iter() {
            listener(&message);
        }
        if let LoggingMessage::Channel(channel_message) = &message {
            self.router
                .dispatch(&channel_message.channel, None, |subscriber| {
                    subscriber.deliver(channel_message)
                });
        }
        if let Some(key) = Correlation::of_response(&message) {
            self.pending.resolve(key, &message);
        }
    }

    fn request_disconnect(&self, reason: String) {
        if self
            .writer_tx
            .try_send(WriterCommand::Disconnect { reason })
            .is_err()
        {
            warn!("writer unavailable; connection left open after desync");
        }
    }
}

impl ConnectionListener for ClientInner {
    fn on_connection_established(&self) {
        info!("connected to hub");
        self.inbound.lock().clear();
        self.manager.set_state(ConnectionState::Connected);
        self.reestablish_subscriptions();
    }

    fn on_connection_lost(&self, reason: &str) {
        info!(reason, "connection to hub lost");
        self.inbound.lock().clear();
        self.manager.connection_lost();
    }

    fn on_bytes(&self, bytes: &[u8]) {
        let mut messages = Vec::new();
        {
            let mut inbound = self.inbound.lock();
            inbound.extend_from_slice(bytes);
            while !inbound.is_empty() {
                match self.codex.decode(&mut inbound) {
                    Ok(Some(message)) => messages.push(message),
                    Ok(None) => continue,
                    Err(err) if !err.is_fatal() => break,
                    Err(err) => {
                        metrics::counter!("logbus_client_desync_total").increment(1);
                        warn!(
                            error = %err,
                            buffered = inbound.len(),
                            "inbound stream out of sync; dropping connection"
                        );
                        inbound.clear();
                        self.request_disconnect(format!("inbound stream out of sync: {err}"));
                        break;
                    }
                }
            }
        }
        for message in messages {
            self.handle_message(message);
        }
    }
}
