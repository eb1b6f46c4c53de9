// Keep-connected worker: watches for a lost hub connection and reconnects
// under exponential backoff, reporting state changes to listeners.
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{ClientInner, SocketClient};
use crate::dispatch::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::NotConnected => "not_connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Callback for connection state transitions, called with `(from, to)`.
pub type ConnectionStateListener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

pub(crate) struct ConnectionManager {
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(u64, ConnectionStateListener)>>,
    listeners_snapshot: ArcSwap<Vec<ConnectionStateListener>>,
    next_listener_id: AtomicU64,
    // Permit stored on every loss while running, so a loss is never missed.
    lost: Arc<Notify>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::NotConnected),
            listeners: Mutex::new(Vec::new()),
            listeners_snapshot: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            lost: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from == to {
            return;
        }
        debug!(%from, %to, "connection state changed");
        for listener in self.listeners_snapshot.load().iter() {
            listener(from, to);
        }
    }

    pub(crate) fn add_listener(&self, listener: ConnectionStateListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock();
        listeners.push((id, listener));
        self.rebuild_snapshot(&listeners);
        id
    }

    pub(crate) fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            self.rebuild_snapshot(&listeners);
        }
        removed
    }

    fn rebuild_snapshot(&self, listeners: &[(u64, ConnectionStateListener)]) {
        let snapshot = listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        self.listeners_snapshot.store(Arc::new(snapshot));
    }

    pub(crate) fn connection_lost(&self) {
        self.set_state(ConnectionState::NotConnected);
        if self.is_running() {
            self.lost.notify_one();
        }
    }

    /// Spawn the worker unless one is already running.
    pub(crate) fn start(&self, client: Weak<ClientInner>, backoff: Backoff) {
        let mut task = self.task.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("starting connection manager");
        *task = Some(tokio::spawn(run_connection_manager(
            client,
            Arc::clone(&self.lost),
            backoff,
        )));
    }

    pub(crate) fn stop(&self) {
        let mut task = self.task.lock();
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = task.take() {
            debug!("stopping connection manager");
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run_connection_manager(
    client: Weak<ClientInner>,
    lost: Arc<Notify>,
    mut backoff: Backoff,
) {
    loop {
        let Some(inner) = client.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        if !inner.connector().is_connected() {
            inner.manager().set_state(ConnectionState::Connecting);
            let attempt = inner.connector().connect().await;
            match attempt {
                Ok(()) => {
                    backoff.on_success();
                    metrics::counter!("logbus_client_reconnects_total").increment(1);
                    info!("reconnected to hub");
                    let client = SocketClient::from_inner(inner);
                    if let Err(err) = client.replay_auto_subscriptions().await {
                        warn!(error = %err, "auto subscriptions failed after reconnect");
                    }
                }
                Err(err) => {
                    inner.manager().set_state(ConnectionState::NotConnected);
                    drop(inner);
                    metrics::counter!("logbus_client_connect_failures_total").increment(1);
                    let delay = backoff.on_failure();
                    info!(
                        error = %err,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "could not connect to hub; waiting before the next attempt"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        } else {
            drop(inner);
        }

        lost.notified().await;
        let delay = backoff.on_failure();
        debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "connection lost; reconnecting after delay"
        );
        tokio::time::sleep(delay).await;
    }
    debug!("connection manager stopped");
}
