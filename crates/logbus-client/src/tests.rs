use super::*;
use logbus_common::LoggingParameters;
use parking_lot::Mutex;
use logbus_wire::{
    ChannelMessage, DefaultLogEvent, HistoricalDataRequest, Level, LoggingMessage,
    LoggingMessageCodex, SubscriptionResponse,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

fn quiet_config() -> ClientConfig {
    ClientConfig {
        auto_subscribe: false,
        ..ClientConfig::default()
    }
}

// Reconnection is driven by the test itself.
fn manual_config() -> ClientConfig {
    ClientConfig {
        keep_connected: false,
        ..quiet_config()
    }
}

fn record_states(client: &SocketClient) -> Arc<Mutex<Vec<(ConnectionState, ConnectionState)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    client.add_connection_state_listener(move |from, to| recorder.lock().push((from, to)));
    seen
}

async fn connected(hub: &InProcessHub, config: ClientConfig) -> SocketClient {
    let client = SocketClient::new(hub.connector(), config).expect("client");
    client.connect().await.expect("connect");
    client
}

fn capture(client: &SocketClient) -> mpsc::UnboundedReceiver<LoggingMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.add_message_listener(move |message| {
        let _ = tx.send(message.clone());
    });
    rx
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<LoggingMessage>) -> LoggingMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message in time")
        .expect("listener alive")
}

// Writer tasks run independently per client, so cross-client effects are polled.
async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn event(level: Level, message: &str) -> LoggingMessage {
    LoggingMessage::LogEvent(DefaultLogEvent::new(level, "tests", message))
}

#[tokio::test]
async fn log_events_reach_globally_subscribed_clients() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, ClientConfig::default()).await;
    let producer = connected(&hub, quiet_config()).await;
    let mut inbound = capture(&consumer);

    producer
        .send_blocking(&event(Level::INFO, "order placed"))
        .await
        .expect("send");
    match next_message(&mut inbound).await {
        LoggingMessage::LogEvent(event) => assert_eq!(event.message, "order placed"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unsubscribe_stops_global_events() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, ClientConfig::default()).await;
    let producer = connected(&hub, quiet_config()).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    consumer.add_message_listener(move |message| {
        if matches!(message, LoggingMessage::LogEvent(_)) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    consumer.unsubscribe().await.expect("unsubscribe");
    producer
        .send_blocking(&event(Level::SEVERE, "nobody listens"))
        .await
        .expect("send");
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn channel_messages_fan_out_to_prefix_subscribers() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, quiet_config()).await;
    let producer = connected(&hub, quiet_config()).await;
    let (root, mut root_rx) = ChannelSubscriber::channel(8);
    let (leaf, mut leaf_rx) = ChannelSubscriber::channel(8);
    let (elsewhere, mut elsewhere_rx) = ChannelSubscriber::channel(8);
    assert!(consumer.add_subscription("updates", root).await);
    assert!(consumer.add_subscription("updates/telemetry/", leaf).await);
    assert!(consumer.add_subscription("requests", elsewhere).await);
    assert_eq!(
        consumer.channels(),
        vec!["requests", "updates", "updates/telemetry"]
    );

    let payload = Arc::new(DefaultLogEvent::new(Level::INFO, "telemetry", "cpu 93%"));
    producer
        .send_blocking(&LoggingMessage::Channel(ChannelMessage::new(
            "updates/telemetry/host-1",
            payload,
        )))
        .await
        .expect("send");

    for rx in [&mut root_rx, &mut leaf_rx] {
        let message = rx.try_recv().expect("delivered");
        assert_eq!(message.channel_path(), "updates/telemetry/host-1");
        let payload = message.payload_as::<DefaultLogEvent>().expect("payload");
        assert_eq!(payload.message, "cpu 93%");
        assert!(rx.try_recv().is_err(), "delivered once");
    }
    assert!(elsewhere_rx.try_recv().is_err());
}

#[tokio::test]
async fn first_subscriptions_share_one_handshake() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let acks: Vec<AckFuture> = (0..8)
        .map(|_| client.add_subscription("updates/history/index", ChannelSubscriber::new(|_| {})))
        .collect();
    for ack in acks {
        assert!(ack.await);
    }
    let handshakes = hub
        .received_kinds()
        .into_iter()
        .filter(|kind| *kind == "channel_subscription_request")
        .count();
    assert_eq!(handshakes, 1);
}

#[tokio::test]
async fn last_removal_unsubscribes_at_the_hub() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let first = ChannelSubscriber::new(|_| {});
    let second = ChannelSubscriber::new(|_| {});
    assert!(client.add_subscription("updates/stacksnapshots", first.clone()).await);
    assert!(client.add_subscription("updates/stacksnapshots", second.clone()).await);

    assert!(client.remove_subscription("updates/stacksnapshots", &first));
    assert_eq!(hub.channels(), vec!["updates/stacksnapshots"]);
    assert_eq!(client.remove_all_subscriptions(&second), 1);
    eventually(|| hub.channels().is_empty()).await;
    assert!(client.channels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_hub_times_out_requests() {
    let hub = InProcessHub::new().expect("hub");
    hub.set_answer_subscriptions(false);
    let config = ClientConfig {
        request_timeout: Duration::from_millis(250),
        ..quiet_config()
    };
    let client = connected(&hub, config).await;

    let err = client.subscribe().await.expect_err("no answer");
    assert!(matches!(
        err,
        ClientError::Timeout { waited, .. } if waited == Duration::from_millis(250)
    ));
    assert!(err.is_recoverable());

    let err = client
        .subscribe_to("updates/telemetry")
        .await
        .expect_err("no answer");
    assert!(matches!(err, ClientError::Timeout { .. }));
}

#[tokio::test]
async fn rejected_event_subscription_surfaces_reason() {
    let hub = InProcessHub::new().expect("hub");
    hub.set_rejecting(true);
    let client = connected(&hub, quiet_config()).await;
    let err = client
        .subscribe_to("updates/patternised")
        .await
        .expect_err("rejected");
    assert!(matches!(
        &err,
        ClientError::SubscriptionRejected { channel, reason }
            if channel == "updates/patternised" && reason.contains("rejected")
    ));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn auto_subscriptions_run_on_connect() {
    let hub = InProcessHub::new().expect("hub");
    let config = ClientConfig {
        auto_channels: vec!["updates/telemetry".to_string()],
        level_filter: Level::WARNING,
        ..ClientConfig::default()
    };
    let client = SocketClient::new(hub.connector(), config).expect("client");
    client.add_auto_subscription("updates/patternised");
    client.add_auto_subscription("requests/stackstrobe");
    assert!(client.remove_auto_subscription("requests/stackstrobe"));
    client.connect().await.expect("connect");

    eventually(|| hub.received_kinds().contains(&"filter_request")).await;
    let kinds = hub.received_kinds();
    assert_eq!(
        kinds,
        vec![
            "subscription_request",
            "event_subscription_request",
            "event_subscription_request",
            "filter_request",
        ]
    );
}

#[tokio::test]
async fn level_filter_limits_forwarded_events() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, ClientConfig::default()).await;
    let producer = connected(&hub, quiet_config()).await;
    let mut inbound = capture(&consumer);
    consumer
        .set_level_filter(Level::WARNING)
        .await
        .expect("filter");
    assert_eq!(consumer.level_filter(), Level::WARNING);
    eventually(|| hub.received_kinds().contains(&"filter_request")).await;

    for (level, message) in [(Level::INFO, "routine"), (Level::SEVERE, "disk full")] {
        producer
            .send_blocking(&event(level, message))
            .await
            .expect("send");
    }
    match next_message(&mut inbound).await {
        LoggingMessage::LogEvent(event) => assert_eq!(event.message, "disk full"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(inbound.try_recv().is_err());
}

#[tokio::test]
async fn reconnect_replays_channel_subscriptions() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, manual_config()).await;
    let producer = connected(&hub, manual_config()).await;
    let (subscriber, mut rx) = ChannelSubscriber::channel(8);
    assert!(consumer.add_subscription("updates/telemetry", subscriber).await);

    hub.drop_connections();
    assert!(!consumer.is_connected());
    assert!(hub.channels().is_empty());

    consumer.connect().await.expect("reconnect");
    producer.connect().await.expect("reconnect");
    eventually(|| hub.channels() == vec!["updates/telemetry".to_string()]).await;

    let payload = Arc::new(DefaultLogEvent::new(Level::INFO, "telemetry", "after restart"));
    producer
        .send_blocking(&LoggingMessage::Channel(ChannelMessage::new(
            "updates/telemetry",
            payload,
        )))
        .await
        .expect("send");
    let message = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("in time")
        .expect("delivered");
    assert_eq!(message.channel_path(), "updates/telemetry");
}

#[tokio::test]
async fn offline_subscription_resolves_once_connected() {
    let hub = InProcessHub::new().expect("hub");
    let client = SocketClient::new(hub.connector(), quiet_config()).expect("client");
    let ack = client.add_subscription("requests/stackstrobe", ChannelSubscriber::new(|_| {}));
    assert!(hub.received_kinds().is_empty());

    client.connect().await.expect("connect");
    assert!(timeout(Duration::from_secs(2), ack).await.expect("in time"));
    assert_eq!(hub.channels(), vec!["requests/stackstrobe"]);
}

#[tokio::test]
async fn split_frames_are_reassembled() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let mut inbound = capture(&client);
    let bytes = LoggingMessageCodex::new()
        .expect("codex")
        .encode_to_bytes(&LoggingMessage::SubscriptionResponse(SubscriptionResponse))
        .expect("encode");
    let (head, tail) = bytes.split_at(bytes.len() / 2);
    hub.send_raw_to_all(head);
    assert!(inbound.try_recv().is_err());
    hub.send_raw_to_all(tail);
    assert!(matches!(
        next_message(&mut inbound).await,
        LoggingMessage::SubscriptionResponse(_)
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn unknown_discriminator_drops_the_connection() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, manual_config()).await;
    hub.send_raw_to_all(&[0x55, 0, 0, 0, 0]);
    eventually(|| !client.is_connected()).await;

    client.connect().await.expect("reconnect");
    assert!(client.is_connected());
}

#[tokio::test]
async fn history_requests_carry_fresh_ids() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let mut inbound = capture(&client);

    let index_id = client
        .send_historical_index_request(0, 60_000)
        .await
        .expect("index request");
    match next_message(&mut inbound).await {
        LoggingMessage::HistoricalIndexResponse(response) => {
            assert_eq!(response.request_id, index_id);
            assert!(response.last_batch);
        }
        other => panic!("unexpected {other:?}"),
    }

    let data_id = client
        .send_historical_data_request(HistoricalDataRequest::default())
        .await
        .expect("data request");
    assert_ne!(data_id, index_id);
    match next_message(&mut inbound).await {
        LoggingMessage::HistoricalDataResponse(response) => {
            assert_eq!(response.request_id, data_id)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn message_listeners_can_be_removed() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let id = client.add_message_listener(|_| {});
    assert!(client.remove_message_listener(id));
    assert!(!client.remove_message_listener(id));
}

#[tokio::test]
async fn closed_client_rejects_work() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    client.close().await;
    assert!(client.is_closed());
    assert!(!client.is_connected());
    let err = client
        .send(&event(Level::INFO, "late"))
        .await
        .expect_err("closed");
    assert!(matches!(err, ClientError::Closed));
    assert!(matches!(
        client.connect().await.expect_err("closed"),
        ClientError::Closed
    ));
}

#[derive(Default)]
struct CountingListener {
    published: AtomicUsize,
    failed: AtomicUsize,
}

impl PublishingListener for CountingListener {
    fn on_published(&self, _event: &DefaultLogEvent) {
        self.published.fetch_add(1, Ordering::SeqCst);
    }

    fn on_publish_failed(&self, _event: &DefaultLogEvent, _error: &ClientError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn appender_publishes_through_client() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, ClientConfig::default()).await;
    let producer = connected(&hub, quiet_config()).await;
    let mut inbound = capture(&consumer);
    let listener = Arc::new(CountingListener::default());
    let appender = Appender::new(
        Arc::new(producer),
        LoggingParameters::new("billing"),
        DispatchConfig::default(),
        Some(listener.clone()),
    );

    for message in ["invoice 1", "invoice 2", "invoice 3"] {
        appender
            .append(appender.snapshot(Level::INFO, "billing.invoices", message))
            .await
            .expect("append");
    }
    appender.wait_until_all_published().await;
    assert_eq!(listener.published.load(Ordering::SeqCst), 3);

    let mut sequence = Vec::new();
    for _ in 0..3 {
        match next_message(&mut inbound).await {
            LoggingMessage::LogEvent(event) => {
                assert_eq!(event.source_application, "billing");
                sequence.push(event.sequence_number);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(sequence, vec![0, 1, 2]);
    appender.close().await;
}

#[tokio::test]
async fn tolerant_appender_drops_events_while_hub_is_down() {
    let hub = InProcessHub::new().expect("hub");
    let client = SocketClient::new(hub.connector(), quiet_config()).expect("client");
    let listener = Arc::new(CountingListener::default());
    let config = DispatchConfig {
        use_dispatch_task: false,
        tolerate_hub_unavailable: true,
        ..DispatchConfig::default()
    };
    let appender = Appender::new(
        Arc::new(client),
        LoggingParameters::default(),
        config,
        Some(listener.clone()),
    );
    appender
        .append(appender.snapshot(Level::WARNING, "offline", "not connected"))
        .await
        .expect("tolerated");
    assert_eq!(listener.failed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_appender_recovers_after_hub_drop() {
    let hub = InProcessHub::new().expect("hub");
    let producer = connected(&hub, quiet_config()).await;
    let listener = Arc::new(CountingListener::default());
    let appender = Appender::new(
        Arc::new(producer.clone()),
        LoggingParameters::new("orders"),
        DispatchConfig::default(),
        Some(listener.clone()),
    );

    hub.drop_connections();
    appender
        .append(appender.snapshot(Level::INFO, "orders", "placed while offline"))
        .await
        .expect("append");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(listener.published.load(Ordering::SeqCst), 1);
    assert!(listener.failed.load(Ordering::SeqCst) >= 1);
    assert!(producer.is_connected());
    assert_eq!(producer.connection_state(), ConnectionState::Connected);
    assert_eq!(appender.queued(), 0);
    appender.close().await;
}

#[tokio::test(start_paused = true)]
async fn desync_is_followed_by_reconnect() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let states = record_states(&client);

    hub.send_raw_to_all(&[0x55, 0, 0, 0, 0]);
    eventually(|| states.lock().len() == 3).await;

    assert_eq!(
        *states.lock(),
        vec![
            (ConnectionState::Connected, ConnectionState::NotConnected),
            (ConnectionState::NotConnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
        ]
    );
    assert!(client.is_connected());
    assert_eq!(hub.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_replays_subscriptions_automatically() {
    let hub = InProcessHub::new().expect("hub");
    let consumer = connected(&hub, ClientConfig::default()).await;
    let producer = connected(&hub, quiet_config()).await;
    let mut inbound = capture(&consumer);
    let (subscriber, mut rx) = ChannelSubscriber::channel(8);
    assert!(consumer.add_subscription("updates/telemetry", subscriber).await);

    hub.drop_connections();
    eventually(|| consumer.is_connected() && producer.is_connected()).await;
    eventually(|| hub.channels() == vec!["updates/telemetry".to_string()]).await;
    let handshakes = hub
        .received_kinds()
        .into_iter()
        .filter(|kind| *kind == "channel_subscription_request")
        .count();
    assert_eq!(handshakes, 2);
    eventually(|| {
        hub.received_kinds()
            .iter()
            .filter(|kind| **kind == "subscription_request")
            .count()
            == 2
    })
    .await;

    let payload = Arc::new(DefaultLogEvent::new(Level::INFO, "telemetry", "back again"));
    producer
        .send_blocking(&LoggingMessage::Channel(ChannelMessage::new(
            "updates/telemetry",
            payload,
        )))
        .await
        .expect("send");
    let message = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("in time")
        .expect("delivered");
    assert_eq!(message.channel_path(), "updates/telemetry");

    producer
        .send_blocking(&event(Level::INFO, "global again"))
        .await
        .expect("send");
    loop {
        if let LoggingMessage::LogEvent(event) = next_message(&mut inbound).await {
            assert_eq!(event.message, "global again");
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn refused_reconnects_back_off_until_the_hub_returns() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    let states = record_states(&client);

    hub.set_refuse_connections(true);
    hub.drop_connections();
    // Attempts at 50, 150, 350 and 750 ms; the next waits until 1550 ms.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let attempts = states
        .lock()
        .iter()
        .filter(|(_, to)| *to == ConnectionState::Connecting)
        .count();
    assert_eq!(attempts, 4);
    assert!(!client.is_connected());
    assert_eq!(client.connection_state(), ConnectionState::NotConnected);

    hub.set_refuse_connections(false);
    eventually(|| client.is_connected()).await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_stops_reconnecting() {
    let hub = InProcessHub::new().expect("hub");
    let client = connected(&hub, quiet_config()).await;
    client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!client.is_connected());
    assert_eq!(client.connection_state(), ConnectionState::NotConnected);

    client.connect().await.expect("connect");
    hub.drop_connections();
    eventually(|| client.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn keep_connected_connects_in_the_background() {
    let hub = InProcessHub::new().expect("hub");
    hub.set_refuse_connections(true);
    let client = SocketClient::new(hub.connector(), quiet_config()).expect("client");
    client.keep_connected().expect("keep connected");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_connected());

    hub.set_refuse_connections(false);
    eventually(|| client.is_connected()).await;
    client.close().await;
    assert!(matches!(
        client.keep_connected().expect_err("closed"),
        ClientError::Closed
    ));
}
