// Glue between a logging front end and the hub: capture snapshots, then either
// queue them for the dispatch task or publish them inline.
use logbus_common::LoggingParameters;
use logbus_wire::{DefaultLogEvent, Level};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::Result;
use crate::config::DispatchConfig;
use crate::dispatch::{DispatchQueue, EventSink, EventSnapshot, PublishingListener};

/// Publishes application log events to a hub.
///
/// ```
/// use logbus_client::{Appender, ClientConfig, InProcessHub, SocketClient};
/// use logbus_common::LoggingParameters;
/// use logbus_wire::Level;
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let hub = InProcessHub::new().expect("hub");
///     let client = SocketClient::new(hub.connector(), ClientConfig::default()).expect("client");
///     client.connect().await.expect("connect");
///     let config = ClientConfig::default().dispatch;
///     let appender = Appender::new(Arc::new(client), LoggingParameters::new("demo"), config, None);
///     appender.append(appender.snapshot(Level::INFO, "demo", "started")).await.expect("append");
///     appender.wait_until_all_published().await;
///     appender.close().await;
/// });
/// ```
pub struct Appender {
    sink: Arc<dyn EventSink>,
    params: Arc<LoggingParameters>,
    config: DispatchConfig,
    listener: Option<Arc<dyn PublishingListener>>,
    queue: Option<DispatchQueue>,
    next_sequence: AtomicI64,
}

impl Appender {
    /// Starts the dispatch task when `use_dispatch_task` is set, so this
    /// must then run inside a tokio runtime.
    pub fn new(
        sink: Arc<dyn EventSink>,
        params: LoggingParameters,
        config: DispatchConfig,
        listener: Option<Arc<dyn PublishingListener>>,
    ) -> Self {
        let queue = config.use_dispatch_task.then(|| {
            let queue = DispatchQueue::new(&config);
            queue.start(Arc::clone(&sink), listener.clone());
            queue
        });
        Self {
            sink,
            params: Arc::new(params),
            config,
            listener,
            queue,
            next_sequence: AtomicI64::new(0),
        }
    }

    pub fn params(&self) -> &LoggingParameters {
        &self.params
    }

    /// Capture an event with the next sequence number.
    pub fn snapshot(
        &self,
        level: Level,
        logger_name: impl Into<String>,
        message: impl Into<String>,
    ) -> EventSnapshot {
        let mut snapshot =
            EventSnapshot::capture(Arc::clone(&self.params), level, logger_name, message);
        snapshot.sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        snapshot
    }

    pub async fn append(&self, snapshot: EventSnapshot) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.enqueue(snapshot);
            return Ok(());
        }
        let event = snapshot.rebuild();
        match self.sink.publish(&event).await {
            Ok(()) => {
                if let Some(listener) = &self.listener {
                    listener.on_published(&event);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(listener) = &self.listener {
                    listener.on_publish_failed(&event, &err);
                }
                if self.config.tolerate_hub_unavailable && err.is_recoverable() {
                    debug!(error = %err, "hub unavailable; event dropped");
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    /// Publish `event` now, bypassing the queue.
    pub async fn send_direct(&self, event: &DefaultLogEvent) -> Result<()> {
        self.sink.publish(event).await
    }

    pub fn discards(&self) -> u64 {
        self.queue.as_ref().map_or(0, DispatchQueue::discards)
    }

    pub fn queued(&self) -> usize {
        self.queue.as_ref().map_or(0, DispatchQueue::len)
    }

    pub async fn wait_until_all_published(&self) {
        if let Some(queue) = &self.queue {
            queue.wait_until_all_published().await;
        }
    }

    /// Stop dispatching and close the sink. Queued events are dropped.
    pub async fn close(&self) {
        if let Some(queue) = &self.queue {
            queue.close();
        }
        self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientError, ConnectorError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        refuse: bool,
        events: Mutex<Vec<DefaultLogEvent>>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn publish(&self, event: &DefaultLogEvent) -> Result<()> {
            if self.refuse {
                return Err(ConnectorError::Refused("hub down".into()).into());
            }
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn inline_config(tolerate: bool) -> DispatchConfig {
        DispatchConfig {
            use_dispatch_task: false,
            tolerate_hub_unavailable: tolerate,
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn inline_append_publishes_with_sequence_numbers() {
        let sink = Arc::new(Recorder::default());
        let appender = Appender::new(
            sink.clone(),
            LoggingParameters::new("orders"),
            inline_config(false),
            None,
        );
        for message in ["a", "b"] {
            appender
                .append(appender.snapshot(Level::INFO, "orders", message))
                .await
                .expect("append");
        }
        let events = sink.events.lock();
        let sequence: Vec<i64> = events.iter().map(|event| event.sequence_number).collect();
        assert_eq!(sequence, vec![0, 1]);
        assert!(events.iter().all(|event| event.source_application == "orders"));
    }

    #[tokio::test]
    async fn inline_failure_surfaces_unless_tolerated() {
        let sink = Arc::new(Recorder {
            refuse: true,
            ..Recorder::default()
        });
        let strict = Appender::new(
            sink.clone(),
            LoggingParameters::default(),
            inline_config(false),
            None,
        );
        let err = strict
            .append(strict.snapshot(Level::SEVERE, "x", "boom"))
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            ClientError::Connector(ConnectorError::Refused(_))
        ));

        let tolerant = Appender::new(sink, LoggingParameters::default(), inline_config(true), None);
        tolerant
            .append(tolerant.snapshot(Level::SEVERE, "x", "boom"))
            .await
            .expect("tolerated");
    }

    #[tokio::test]
    async fn queued_append_drains_through_task() {
        let sink = Arc::new(Recorder::default());
        let appender = Appender::new(
            sink.clone(),
            LoggingParameters::default(),
            DispatchConfig::default(),
            None,
        );
        for index in 0..5 {
            appender
                .append(appender.snapshot(Level::FINE, "queue", format!("event {index}")))
                .await
                .expect("append");
        }
        appender.wait_until_all_published().await;
        assert_eq!(sink.events.lock().len(), 5);
        assert_eq!(appender.discards(), 0);
        appender.close().await;
    }
}
