// Client-side defaults and environment/YAML overrides.
use anyhow::{Context, Result};
use logbus_wire::Level;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;
pub(crate) const DEFAULT_FAILURE_DELAY: Duration = Duration::from_millis(50);
pub(crate) const DEFAULT_FAILURE_DELAY_MULTIPLIER: f64 = 2.0;
pub(crate) const DEFAULT_FAILURE_DELAY_MAX: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_MAX_DISPATCH_QUEUE: usize = 1000;

/// Connection-level behaviour of a [`SocketClient`](crate::SocketClient).
///
/// ```
/// use logbus_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::optimized_defaults();
/// assert_eq!(config.request_timeout, Duration::from_secs(10));
/// assert!(config.auto_subscribe);
/// assert!(config.keep_connected);
/// assert_eq!(config.dispatch.max_dispatch_queue, 1000);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long global and per-channel subscribe/unsubscribe wait for the hub.
    pub request_timeout: Duration,
    /// Replay the auto subscriptions and level filter on every `connect()`.
    pub auto_subscribe: bool,
    pub auto_global_subscription: bool,
    pub auto_channels: Vec<String>,
    pub level_filter: Level,
    /// Reconnect after every lost connection, pacing attempts with the
    /// dispatch failure delays.
    pub keep_connected: bool,
    /// Capacity of the queue in front of the writer task.
    pub outbound_queue_depth: usize,
    pub dispatch: DispatchConfig,
}

/// Behaviour of the publishing side: dispatch queue, retry delays and how a
/// missing hub is reported.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub failure_delay: Duration,
    pub failure_delay_multiplier: f64,
    pub failure_delay_max: Duration,
    /// Oldest events are dropped once the queue holds more than this.
    pub max_dispatch_queue: usize,
    pub use_dispatch_task: bool,
    /// Swallow "hub unavailable" errors on the synchronous publish path.
    pub tolerate_hub_unavailable: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            failure_delay: DEFAULT_FAILURE_DELAY,
            failure_delay_multiplier: DEFAULT_FAILURE_DELAY_MULTIPLIER,
            failure_delay_max: DEFAULT_FAILURE_DELAY_MAX,
            max_dispatch_queue: DEFAULT_MAX_DISPATCH_QUEUE,
            use_dispatch_task: true,
            tolerate_hub_unavailable: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::optimized_defaults()
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    request_timeout_ms: Option<u64>,
    auto_subscribe: Option<bool>,
    auto_global_subscription: Option<bool>,
    auto_channels: Option<Vec<String>>,
    level_filter: Option<String>,
    keep_connected: Option<bool>,
    outbound_queue_depth: Option<usize>,
    failure_delay_ms: Option<u64>,
    failure_delay_multiplier: Option<f64>,
    failure_delay_max_ms: Option<u64>,
    max_dispatch_queue: Option<usize>,
    use_dispatch_task: Option<bool>,
    tolerate_hub_unavailable: Option<bool>,
}

impl ClientConfig {
    /// Defaults, then `LOGBUS_*` variables, then the YAML file at `config_path`
    /// (or `LOGBUS_CLIENT_CONFIG`) if one is given.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("LOGBUS_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    pub fn optimized_defaults() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auto_subscribe: true,
            auto_global_subscription: true,
            auto_channels: Vec::new(),
            level_filter: Level::ALL,
            keep_connected: true,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            dispatch: DispatchConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::optimized_defaults();
        if let Some(value) = read_u64_env("LOGBUS_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("LOGBUS_AUTO_SUBSCRIBE") {
            config.auto_subscribe = value;
        }
        if let Some(value) = read_bool_env("LOGBUS_AUTO_GLOBAL_SUBSCRIPTION") {
            config.auto_global_subscription = value;
        }
        if let Ok(value) = std::env::var("LOGBUS_AUTO_CHANNELS") {
            config.auto_channels = value
                .split(',')
                .map(str::trim)
                .filter(|channel| !channel.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = read_level_env("LOGBUS_LEVEL_FILTER") {
            config.level_filter = value;
        }
        if let Some(value) = read_bool_env("LOGBUS_KEEP_CONNECTED") {
            config.keep_connected = value;
        }
        if let Some(value) = read_usize_env("LOGBUS_OUTBOUND_QUEUE_DEPTH") {
            config.outbound_queue_depth = value;
        }
        if let Some(value) = read_u64_env("LOGBUS_FAILURE_DELAY_MS") {
            config.dispatch.failure_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_f64_env("LOGBUS_FAILURE_DELAY_MULTIPLIER") {
            config.dispatch.failure_delay_multiplier = value;
        }
        if let Some(value) = read_u64_env("LOGBUS_FAILURE_DELAY_MAX_MS") {
            config.dispatch.failure_delay_max = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("LOGBUS_MAX_DISPATCH_QUEUE") {
            config.dispatch.max_dispatch_queue = value;
        }
        if let Some(value) = read_bool_env("LOGBUS_USE_DISPATCH_TASK") {
            config.dispatch.use_dispatch_task = value;
        }
        if let Some(value) = read_bool_env("LOGBUS_TOLERATE_HUB_UNAVAILABLE") {
            config.dispatch.tolerate_hub_unavailable = value;
        }
        config
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(value) = self.request_timeout_ms
            && value > 0
        {
            config.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.auto_subscribe {
            config.auto_subscribe = value;
        }
        if let Some(value) = self.auto_global_subscription {
            config.auto_global_subscription = value;
        }
        if let Some(value) = &self.auto_channels {
            config.auto_channels = value.clone();
        }
        if let Some(value) = &self.level_filter {
            config.level_filter = value
                .parse()
                .map_err(anyhow::Error::msg)
                .context("parse level_filter")?;
        }
        if let Some(value) = self.keep_connected {
            config.keep_connected = value;
        }
        if let Some(value) = self.outbound_queue_depth
            && value > 0
        {
            config.outbound_queue_depth = value;
        }
        if let Some(value) = self.failure_delay_ms
            && value > 0
        {
            config.dispatch.failure_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.failure_delay_multiplier
            && value >= 1.0
        {
            config.dispatch.failure_delay_multiplier = value;
        }
        if let Some(value) = self.failure_delay_max_ms
            && value > 0
        {
            config.dispatch.failure_delay_max = Duration::from_millis(value);
        }
        if let Some(value) = self.max_dispatch_queue
            && value > 0
        {
            config.dispatch.max_dispatch_queue = value;
        }
        if let Some(value) = self.use_dispatch_task {
            config.dispatch.use_dispatch_task = value;
        }
        if let Some(value) = self.tolerate_hub_unavailable {
            config.dispatch.tolerate_hub_unavailable = value;
        }
        Ok(())
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_f64_env(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 1.0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn read_level_env(key: &str) -> Option<Level> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
}
