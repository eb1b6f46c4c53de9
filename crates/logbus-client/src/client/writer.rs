// Single writer: every outbound send for one client goes through this loop.
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::connector::{Connector, ConnectorError};

pub(crate) enum WriterCommand {
    Send {
        bytes: Bytes,
        kind: &'static str,
        response: Option<oneshot::Sender<Result<(), ConnectorError>>>,
    },
    /// Drop the current connection, e.g. after the inbound stream desynced.
    Disconnect { reason: String },
    Shutdown,
}

pub(crate) fn spawn_writer(
    connector: Arc<dyn Connector>,
    depth: usize,
) -> (mpsc::Sender<WriterCommand>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let handle = tokio::spawn(run_writer(connector, rx));
    (tx, handle)
}

pub(crate) async fn run_writer(
    connector: Arc<dyn Connector>,
    mut rx: mpsc::Receiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send {
                bytes,
                kind,
                response,
            } => {
                let len = bytes.len();
                let result = connector.send(bytes).await;
                match &result {
                    Ok(()) => {
                        metrics::counter!("logbus_client_messages_sent_total").increment(1);
                    }
                    Err(err) => {
                        metrics::counter!("logbus_client_send_failures_total").increment(1);
                        debug!(kind, len, error = %err, "send failed");
                    }
                }
                if let Some(response) = response {
                    let _ = response.send(result);
                }
            }
            WriterCommand::Disconnect { reason } => {
                info!(reason = %reason, "dropping hub connection");
                connector.disconnect().await;
            }
            WriterCommand::Shutdown => break,
        }
    }
    drain_writer_queue(&mut rx);
}

// Fail whatever is still queued so no caller waits on a stopped writer.
fn drain_writer_queue(rx: &mut mpsc::Receiver<WriterCommand>) {
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let WriterCommand::Send {
            response: Some(response),
            ..
        } = command
        {
            let _ = response.send(Err(ConnectorError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectionListener;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingConnector {
        sent: Mutex<Vec<Bytes>>,
        connected: AtomicBool,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(&self) -> Result<(), ConnectorError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn close(&self) {
            self.disconnect().await;
        }

        async fn send(&self, bytes: Bytes) -> Result<(), ConnectorError> {
            if !self.is_connected() {
                return Err(ConnectorError::NotConnected);
            }
            self.sent.lock().push(bytes);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn set_listener(&self, _listener: Weak<dyn ConnectionListener>) {}
    }

    async fn send(
        tx: &mpsc::Sender<WriterCommand>,
        payload: &'static [u8],
    ) -> Result<(), ConnectorError> {
        let (response, rx) = oneshot::channel();
        tx.send(WriterCommand::Send {
            bytes: Bytes::from_static(payload),
            kind: "test",
            response: Some(response),
        })
        .await
        .expect("queue");
        rx.await.expect("response")
    }

    #[tokio::test]
    async fn sends_leave_in_order_and_report_failures() {
        let connector = Arc::new(RecordingConnector::default());
        let (tx, handle) = spawn_writer(connector.clone(), 8);
        assert_eq!(send(&tx, b"early").await, Err(ConnectorError::NotConnected));
        connector.connect().await.expect("connect");
        for payload in [&b"one"[..], b"two", b"three"] {
            tx.send(WriterCommand::Send {
                bytes: Bytes::from_static(payload),
                kind: "test",
                response: None,
            })
            .await
            .expect("queue");
        }
        assert_eq!(send(&tx, b"four").await, Ok(()));
        let sent: Vec<Bytes> = connector.sent.lock().clone();
        assert_eq!(sent, vec!["one", "two", "three", "four"]);

        tx.send(WriterCommand::Disconnect {
            reason: "test".into(),
        })
        .await
        .expect("queue");
        assert_eq!(send(&tx, b"late").await, Err(ConnectorError::NotConnected));

        tx.send(WriterCommand::Shutdown).await.expect("queue");
        handle.await.expect("writer task");
    }
}
