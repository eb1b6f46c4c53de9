// Aggregated pattern telemetry published by the hub on `updates/patternised`.
use logbus_sof::{Error, SofObject, SofRead, SofReader, SofWriter};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AggregationType {
    #[default]
    Count,
    Sum,
    TotalSum,
    TotalCount,
    LastValue,
    Mean,
    Median,
    Mode,
    StandardDeviation,
    Percentile90,
}

impl AggregationType {
    pub const ALL: [AggregationType; 10] = [
        AggregationType::Count,
        AggregationType::Sum,
        AggregationType::TotalSum,
        AggregationType::TotalCount,
        AggregationType::LastValue,
        AggregationType::Mean,
        AggregationType::Median,
        AggregationType::Mode,
        AggregationType::StandardDeviation,
        AggregationType::Percentile90,
    ];

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationType::Count => "Count",
            AggregationType::Sum => "Sum",
            AggregationType::TotalSum => "TotalSum",
            AggregationType::TotalCount => "TotalCount",
            AggregationType::LastValue => "LastValue",
            AggregationType::Mean => "Mean",
            AggregationType::Median => "Median",
            AggregationType::Mode => "Mode",
            AggregationType::StandardDeviation => "StandardDeviation",
            AggregationType::Percentile90 => "Percentile90",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = Error;

    fn from_str(input: &str) -> logbus_sof::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input)
            .ok_or_else(|| Error::Malformed(format!("unknown aggregation type '{input}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AggregationKey {
    pub pattern_name: String,
    pub label: String,
    pub aggregation_type: AggregationType,
    pub interval: i64,
    pub event_parts: Vec<String>,
}

impl SofObject for AggregationKey {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write_string(1, Some(self.pattern_name.as_str()))?;
        writer.write_string(2, Some(self.label.as_str()))?;
        writer.write_string(3, Some(self.aggregation_type.as_str()))?;
        writer.write(4, self.interval)?;
        writer.write_string_array(5, Some(self.event_parts.as_slice()))
    }
}

impl SofRead for AggregationKey {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        let pattern_name = reader.read_string(1)?.unwrap_or_default();
        let label = reader.read_string(2)?.unwrap_or_default();
        let aggregation_type = match reader.read_string(3)? {
            Some(name) => name.parse()?,
            None => AggregationType::default(),
        };
        Ok(Self {
            pattern_name,
            label,
            aggregation_type,
            interval: reader.read(4)?.unwrap_or_default(),
            event_parts: reader.read_string_array(5)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregatedPatternData {
    pub value: f64,
    pub time: i64,
    pub series: String,
    pub interval: i64,
    pub key: Option<AggregationKey>,
}

impl SofObject for AggregatedPatternData {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.value)?;
        writer.write(2, self.time)?;
        writer.write_string(3, Some(self.series.as_str()))?;
        writer.write(4, self.interval)?;
        writer.write_object(5, self.key.as_ref())
    }
}

impl SofRead for AggregatedPatternData {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            value: reader.read(1)?.unwrap_or_default(),
            time: reader.read(2)?.unwrap_or_default(),
            series: reader.read_string(3)?.unwrap_or_default(),
            interval: reader.read(4)?.unwrap_or_default(),
            key: reader.read_object_as(5)?,
        })
    }
}
