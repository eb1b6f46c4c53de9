use logbus_sof::{SofObject, SofRead, SofReader, SofWriter};
use std::sync::Arc;

/// Well-known channels used by hub-side services.
pub struct Channels;

impl Channels {
    pub const GLOBAL: &'static str = "";
    pub const STACK_STROBE_REQUESTS: &'static str = "requests/stackstrobe";
    pub const HISTORY_INDEX_UPDATES: &'static str = "updates/history/index";
    pub const STACK_SNAPSHOTS: &'static str = "updates/stacksnapshots";
    pub const TELEMETRY_UPDATES: &'static str = "updates/telemetry";
    pub const PATTERNISED_UPDATES: &'static str = "updates/patternised";
}

/// Split a channel path into segments.
///
/// Both `/` and `\` separate segments. The whole path and each segment are
/// trimmed, and a trailing separator does not produce an empty segment. The
/// empty path has no segments and names the global channel.
///
/// ```
/// use logbus_wire::parse_channel;
///
/// assert_eq!(parse_channel(" a / b\\c "), vec!["a", "b", "c"]);
/// assert_eq!(parse_channel("updates/"), vec!["updates"]);
/// assert!(parse_channel("   ").is_empty());
/// ```
pub fn parse_channel(channel: &str) -> Vec<String> {
    let trimmed = channel.trim();
    let mut segments = trimmed
        .split(['/', '\\'])
        .map(|segment| segment.trim().to_string())
        .collect::<Vec<_>>();
    if trimmed.is_empty() || trimmed.ends_with(['/', '\\']) {
        segments.pop();
    }
    segments
}

pub fn join_channel<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|segment| segment.as_ref())
        .collect::<Vec<&str>>()
        .join("/")
}

/// A payload published on a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelMessage {
    pub channel: Vec<String>,
    pub payload: Option<Arc<dyn SofObject>>,
}

impl ChannelMessage {
    pub fn new(channel: &str, payload: Arc<dyn SofObject>) -> Self {
        Self {
            channel: parse_channel(channel),
            payload: Some(payload),
        }
    }

    /// The channel as a `/` separated path; empty for the global channel.
    pub fn channel_path(&self) -> String {
        join_channel(&self.channel)
    }

    pub fn payload_as<T: SofObject>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|payload| payload.downcast_ref::<T>())
    }
}

impl SofObject for ChannelMessage {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write_string_array(1, Some(self.channel.as_slice()))?;
        writer.write_object(2, self.payload.as_deref())
    }
}

impl SofRead for ChannelMessage {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            channel: reader.read_string_array(1)?.unwrap_or_default(),
            payload: reader.read_object(2)?,
        })
    }
}
