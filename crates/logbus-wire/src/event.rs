use logbus_sof::{SofObject, SofRead, SofReader, SofWriter};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity on the java.util.logging integer scale. Higher is more severe.
///
/// ```
/// use logbus_wire::Level;
///
/// assert!(Level::WARNING > Level::INFO);
/// assert_eq!("severe".parse::<Level>().unwrap(), Level::SEVERE);
/// assert_eq!(Level(850).to_string(), "850");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(pub i32);

impl Level {
    pub const ALL: Level = Level(i32::MIN);
    pub const FINEST: Level = Level(300);
    pub const FINER: Level = Level(400);
    pub const FINE: Level = Level(500);
    pub const CONFIG: Level = Level(700);
    pub const INFO: Level = Level(800);
    pub const WARNING: Level = Level(900);
    pub const SEVERE: Level = Level(1000);
    pub const OFF: Level = Level(i32::MAX);

    const NAMED: [(Level, &'static str); 9] = [
        (Level::ALL, "ALL"),
        (Level::FINEST, "FINEST"),
        (Level::FINER, "FINER"),
        (Level::FINE, "FINE"),
        (Level::CONFIG, "CONFIG"),
        (Level::INFO, "INFO"),
        (Level::WARNING, "WARNING"),
        (Level::SEVERE, "SEVERE"),
        (Level::OFF, "OFF"),
    ];

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(level, _)| *level == self)
            .map(|(_, name)| *name)
    }

    /// Whether an event at this level passes a filter set to `threshold`.
    pub fn passes(self, threshold: Level) -> bool {
        self >= threshold
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = input.trim();
        if let Some((level, _)) = Self::NAMED
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(trimmed))
        {
            return Ok(*level);
        }
        trimmed
            .parse::<i32>()
            .map(Level)
            .map_err(|_| format!("unknown level '{input}'"))
    }
}

/// One log record as published by an application.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DefaultLogEvent {
    pub local_creation_time_millis: i64,
    pub level: i32,
    pub message: String,
    pub source_host: String,
    pub source_application: String,
    pub pid: i32,
    pub thread_name: String,
    pub logger_name: String,
    pub source_address: String,
    pub channel: Option<String>,
    pub source_class_name: Option<String>,
    pub source_method_name: Option<String>,
    pub formatted_exception: Option<String>,
    pub formatted_object: Option<Vec<String>>,
    pub sequence_number: i64,
}

impl DefaultLogEvent {
    /// Event stamped with the current wall-clock time.
    pub fn new(level: Level, logger_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            local_creation_time_millis: now_millis(),
            level: level.value(),
            logger_name: logger_name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn level(&self) -> Level {
        Level(self.level)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

impl SofObject for DefaultLogEvent {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.local_creation_time_millis)?;
        writer.write(2, self.level)?;
        writer.write_string(3, Some(self.message.as_str()))?;
        writer.write_string(4, Some(self.source_host.as_str()))?;
        writer.write_string(5, Some(self.source_application.as_str()))?;
        writer.write(6, self.pid)?;
        writer.write_string(7, Some(self.thread_name.as_str()))?;
        writer.write_string(8, Some(self.logger_name.as_str()))?;
        writer.write_string(9, Some(self.source_address.as_str()))?;
        writer.write_string(10, self.channel.as_deref())?;
        writer.write_string(11, self.source_class_name.as_deref())?;
        writer.write_string(12, self.source_method_name.as_deref())?;
        writer.write_string(13, self.formatted_exception.as_deref())?;
        writer.write_string_array(14, self.formatted_object.as_deref())?;
        writer.write(15, self.sequence_number)
    }
}

impl SofRead for DefaultLogEvent {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            local_creation_time_millis: reader.read(1)?.unwrap_or_default(),
            level: reader.read(2)?.unwrap_or_default(),
            message: reader.read_string(3)?.unwrap_or_default(),
            source_host: reader.read_string(4)?.unwrap_or_default(),
            source_application: reader.read_string(5)?.unwrap_or_default(),
            pid: reader.read(6)?.unwrap_or_default(),
            thread_name: reader.read_string(7)?.unwrap_or_default(),
            logger_name: reader.read_string(8)?.unwrap_or_default(),
            source_address: reader.read_string(9)?.unwrap_or_default(),
            channel: reader.read_string(10)?,
            source_class_name: reader.read_string(11)?,
            source_method_name: reader.read_string(12)?,
            formatted_exception: reader.read_string(13)?,
            formatted_object: reader.read_string_array(14)?,
            sequence_number: reader.read(15)?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use bytes::BytesMut;

    fn sample_event() -> DefaultLogEvent {
        DefaultLogEvent {
            local_creation_time_millis: 1_700_000_000_000,
            level: Level::WARNING.value(),
            message: "disk almost full".into(),
            source_host: "host-a".into(),
            source_application: "billing".into(),
            pid: 4242,
            thread_name: "main".into(),
            logger_name: "billing.storage".into(),
            source_address: "10.0.0.1".into(),
            channel: Some("alerts/disk".into()),
            source_class_name: None,
            source_method_name: Some("check".into()),
            formatted_exception: None,
            formatted_object: Some(vec!["92%".into()]),
            sequence_number: 17,
        }
    }

    #[test]
    fn level_ordering_follows_severity() {
        assert!(Level::SEVERE.passes(Level::WARNING));
        assert!(!Level::FINE.passes(Level::INFO));
        assert!(Level::FINEST.passes(Level::ALL));
        assert!(!Level::SEVERE.passes(Level::OFF));
    }

    #[test]
    fn level_parses_names_and_numbers() {
        assert_eq!("Warning".parse::<Level>().expect("name"), Level::WARNING);
        assert_eq!(" 850 ".parse::<Level>().expect("number"), Level(850));
        assert!("loud".parse::<Level>().is_err());
        assert_eq!(Level::CONFIG.to_string(), "CONFIG");
    }

    #[test]
    fn event_round_trips_with_optional_fields() {
        let config = registry::sof_configuration().expect("config");
        let event = sample_event();
        let mut buf = BytesMut::new();
        logbus_sof::encode_object(&mut buf, &event, &config).expect("encode");
        let (decoded, used) =
            logbus_sof::decode_object_as::<DefaultLogEvent>(&buf, &config).expect("decode");
        assert_eq!(used, buf.len());
        assert_eq!(decoded, event);
    }

    #[test]
    fn missing_fields_decode_as_defaults() {
        let config = registry::sof_configuration().expect("config");
        let mut buf = BytesMut::new();
        {
            let mut writer = SofWriter::new(&mut buf, &config);
            writer.write(2, Level::INFO.value()).expect("level");
            writer.write_string(3, Some("only a message")).expect("message");
        }
        let mut reader = SofReader::new(&buf, &config);
        let event = DefaultLogEvent::read_fields(&mut reader).expect("read");
        assert_eq!(event.level(), Level::INFO);
        assert_eq!(event.message, "only a message");
        assert_eq!(event.sequence_number, 0);
        assert!(event.channel.is_none());
    }
}
