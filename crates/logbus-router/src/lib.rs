// Hierarchical channel subscriptions with one hub handshake per channel.
//
// Channels are `/`-separated paths. A message on `a/b/c` reaches subscribers of
// the global channel `""`, then `a`, `a/b` and `a/b/c`.
use arc_swap::ArcSwap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolves to whether the hub accepted the subscription. Cloneable, so every
/// subscriber of a channel can await the same handshake.
pub type AckFuture = Shared<BoxFuture<'static, bool>>;

/// Callbacks fired when a channel gains its first or loses its last destination.
///
/// Both run while the router's registry lock is held: they must not call back
/// into the router and should only queue work.
pub trait SubscriptionHooks<D>: Send + Sync {
    fn handle_first_subscription(&self, channel: &str, destination: &D)
    -> BoxFuture<'static, bool>;

    fn handle_last_subscription(&self, channel: &str, destination: &D);
}

/// Hooks for a router with no hub behind it: every subscription succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl<D> SubscriptionHooks<D> for NoopHooks {
    fn handle_first_subscription(
        &self,
        _channel: &str,
        _destination: &D,
    ) -> BoxFuture<'static, bool> {
        futures::future::ready(true).boxed()
    }

    fn handle_last_subscription(&self, _channel: &str, _destination: &D) {}
}

/// Strip trailing separators so `a/b/` and `a/b` name the same channel.
pub fn tidy_channel(channel: &str) -> &str {
    channel.trim_end_matches('/')
}

struct ChannelEntry<D> {
    destinations: Vec<D>,
    ack: AckFuture,
}

/// Channel to destination map.
///
/// Mutations are serialised under one lock and publish a fresh snapshot;
/// [`dispatch`](Self::dispatch) only reads the snapshot.
///
/// ```
/// use logbus_router::SubscriptionRouter;
///
/// let router = SubscriptionRouter::<&str>::default();
/// let _ack = router.add_subscription("metrics", "dashboard");
/// let _ack = router.add_subscription("metrics/cpu", "alerts");
///
/// let mut seen = Vec::new();
/// let delivered = router.dispatch(&["metrics", "cpu"], None, |dest| seen.push(*dest));
/// assert_eq!(delivered, 2);
/// assert_eq!(seen, vec!["dashboard", "alerts"]);
/// ```
pub struct SubscriptionRouter<D> {
    hooks: Arc<dyn SubscriptionHooks<D>>,
    // Registry mutated only on subscribe/unsubscribe paths.
    registry: Mutex<HashMap<String, ChannelEntry<D>>>,
    // Snapshot used by the dispatch hot path: lock-free read.
    snapshot: ArcSwap<HashMap<String, Vec<D>>>,
}

impl<D> fmt::Debug for SubscriptionRouter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("channels", &self.snapshot.load().len())
            .finish()
    }
}

impl<D> Default for SubscriptionRouter<D>
where
    D: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Arc::new(NoopHooks))
    }
}

impl<D> SubscriptionRouter<D>
where
    D: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(hooks: Arc<dyn SubscriptionHooks<D>>) -> Self {
        Self {
            hooks,
            registry: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Add `destination` to `channel`.
    ///
    /// The first destination on a channel starts the handshake through
    /// [`SubscriptionHooks::handle_first_subscription`]; later callers get the
    /// same future for as long as the channel has destinations.
    pub fn add_subscription(&self, channel: &str, destination: D) -> AckFuture {
        let channel = tidy_channel(channel);
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get_mut(channel) {
            let ack = entry.ack.clone();
            entry.destinations.push(destination);
            self.rebuild_snapshot(&registry);
            return ack;
        }
        let ack = self
            .hooks
            .handle_first_subscription(channel, &destination)
            .shared();
        registry.insert(
            channel.to_string(),
            ChannelEntry {
                destinations: vec![destination],
                ack: ack.clone(),
            },
        );
        self.rebuild_snapshot(&registry);
        ack
    }

    /// Remove one subscription of `destination` from `channel`. Returns false if
    /// it was not subscribed.
    pub fn remove_subscription(&self, channel: &str, destination: &D) -> bool {
        let channel = tidy_channel(channel);
        let mut registry = self.registry.lock();
        let Some(entry) = registry.get_mut(channel) else {
            return false;
        };
        let Some(position) = entry.destinations.iter().position(|d| d == destination) else {
            return false;
        };
        entry.destinations.remove(position);
        if entry.destinations.is_empty() {
            // Last one out evicts the cached handshake.
            registry.remove(channel);
            self.hooks.handle_last_subscription(channel, destination);
        }
        self.rebuild_snapshot(&registry);
        true
    }

    /// Remove `destination` from every channel. Returns how many channels it left.
    pub fn remove_all_subscriptions(&self, destination: &D) -> usize {
        let mut registry = self.registry.lock();
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (channel, entry) in registry.iter_mut() {
            let before = entry.destinations.len();
            entry.destinations.retain(|d| d != destination);
            if entry.destinations.len() != before {
                removed += 1;
                if entry.destinations.is_empty() {
                    emptied.push(channel.clone());
                }
            }
        }
        for channel in &emptied {
            registry.remove(channel);
            self.hooks.handle_last_subscription(channel, destination);
        }
        if removed > 0 {
            self.rebuild_snapshot(&registry);
        }
        removed
    }

    /// Deliver to every destination on `""` and on each prefix of `segments`,
    /// skipping `exclude`. Returns the number of deliveries.
    pub fn dispatch<S, F>(&self, segments: &[S], exclude: Option<&D>, mut deliver: F) -> usize
    where
        S: AsRef<str>,
        F: FnMut(&D),
    {
        let snapshot = self.snapshot.load();
        let mut delivered = 0;
        visit_prefixes(&snapshot, segments, |destinations| {
            for destination in destinations {
                if exclude.is_some_and(|excluded| excluded == destination) {
                    continue;
                }
                deliver(destination);
                delivered += 1;
            }
        });
        delivered
    }

    /// Destinations a message on `segments` would reach, one per matching subscription.
    pub fn destinations<S: AsRef<str>>(&self, segments: &[S]) -> Vec<D> {
        let snapshot = self.snapshot.load();
        let mut found = Vec::new();
        visit_prefixes(&snapshot, segments, |destinations| {
            found.extend(destinations.iter().cloned())
        });
        found
    }

    /// Destinations subscribed to exactly `channel`.
    pub fn destinations_for(&self, channel: &str) -> Vec<D> {
        self.snapshot
            .load()
            .get(tidy_channel(channel))
            .cloned()
            .unwrap_or_default()
    }

    /// Every channel with at least one destination, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.snapshot.load().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    fn rebuild_snapshot(&self, registry: &HashMap<String, ChannelEntry<D>>) {
        let snapshot = registry
            .iter()
            .map(|(channel, entry)| (channel.clone(), entry.destinations.clone()))
            .collect();
        self.snapshot.store(Arc::new(snapshot));
    }
}

// Global channel first, then each non-empty prefix of the path.
fn visit_prefixes<D, S, F>(snapshot: &HashMap<String, Vec<D>>, segments: &[S], mut visit: F)
where
    S: AsRef<str>,
    F: FnMut(&[D]),
{
    if let Some(destinations) = snapshot.get("") {
        visit(destinations.as_slice());
    }
    let mut prefix = String::new();
    for (index, segment) in segments.iter().enumerate() {
        if index > 0 {
            prefix.push('/');
        }
        prefix.push_str(segment.as_ref());
        if prefix.is_empty() {
            continue;
        }
        if let Some(destinations) = snapshot.get(prefix.as_str()) {
            visit(destinations.as_slice());
        }
    }
}
