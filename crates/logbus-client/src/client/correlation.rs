// Waiters for hub responses, keyed by request id or by the global
// subscribe/unsubscribe handshake.
use logbus_wire::LoggingMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Correlation {
    Subscribe,
    Unsubscribe,
    Request(i32),
}

impl Correlation {
    /// Key a response resolves, or `None` for messages nobody waits on.
    pub(crate) fn of_response(message: &LoggingMessage) -> Option<Self> {
        match message {
            LoggingMessage::SubscriptionResponse(_) => Some(Correlation::Subscribe),
            LoggingMessage::UnsubscriptionResponse(_) => Some(Correlation::Unsubscribe),
            LoggingMessage::ChannelSubscriptionResponse(_)
            | LoggingMessage::EventSubscriptionResponse(_)
            | LoggingMessage::HistoricalIndexResponse(_)
            | LoggingMessage::HistoricalDataResponse(_) => {
                message.request_id().map(Correlation::Request)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct PendingState {
    waiters: HashMap<Correlation, Vec<oneshot::Sender<LoggingMessage>>>,
    // Request ids of channel handshakes started by the first subscriber of a channel.
    handshakes: HashSet<i32>,
}

#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    pub(crate) fn register(&self, key: Correlation) -> oneshot::Receiver<LoggingMessage> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().waiters.entry(key).or_default().push(tx);
        rx
    }

    /// Register a waiter for a first-subscription handshake. These follow the
    /// subscriptions when they are replayed after a reconnect.
    pub(crate) fn register_handshake(&self, request_id: i32) -> oneshot::Receiver<LoggingMessage> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.handshakes.insert(request_id);
        state
            .waiters
            .entry(Correlation::Request(request_id))
            .or_default()
            .push(tx);
        rx
    }

    /// Hand `message` to every waiter on `key`. Waiters are single use.
    pub(crate) fn resolve(&self, key: Correlation, message: &LoggingMessage) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            if let Correlation::Request(id) = key {
                state.handshakes.remove(&id);
            }
            state.waiters.remove(&key).unwrap_or_default()
        };
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(message.clone());
        }
        count
    }

    /// Move every outstanding handshake waiter onto `request_id`.
    pub(crate) fn rekey_handshakes(&self, request_id: i32) -> usize {
        let mut state = self.state.lock();
        let previous: Vec<i32> = state.handshakes.drain().collect();
        let mut moved = Vec::new();
        for id in previous {
            if let Some(waiters) = state.waiters.remove(&Correlation::Request(id)) {
                moved.extend(waiters);
            }
        }
        let count = moved.len();
        if count > 0 {
            state.handshakes.insert(request_id);
            state
                .waiters
                .entry(Correlation::Request(request_id))
                .or_default()
                .extend(moved);
        }
        count
    }

    /// Drop a waiter whose request never went out.
    pub(crate) fn cancel(&self, key: Correlation) {
        let mut state = self.state.lock();
        if let Correlation::Request(id) = key {
            state.handshakes.remove(&id);
        }
        state.waiters.remove(&key);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) {
        let mut state = self.state.lock();
        state.handshakes.clear();
        state.waiters.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().waiters.values().map(Vec::len).sum()
    }
}
