// Historical queries. The client only carries these; answering them is the hub's job.
use logbus_sof::{SofObject, SofRead, SofReader, SofWriter};

use crate::CompressedBlock;

/// Per-interval event counts in the hub's history index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoricalIndexElement {
    pub time: i64,
    pub interval: i64,
    pub info_count: i32,
    pub warning_count: i32,
    pub severe_count: i32,
    pub other_count: i32,
}

impl HistoricalIndexElement {
    pub fn total(&self) -> i64 {
        [
            self.info_count,
            self.warning_count,
            self.severe_count,
            self.other_count,
        ]
        .iter()
        .map(|count| i64::from(*count))
        .sum()
    }
}

impl SofObject for HistoricalIndexElement {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.time)?;
        writer.write(2, self.interval)?;
        writer.write(3, self.info_count)?;
        writer.write(4, self.warning_count)?;
        writer.write(5, self.severe_count)?;
        writer.write(6, self.other_count)
    }
}

impl SofRead for HistoricalIndexElement {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            time: reader.read(1)?.unwrap_or_default(),
            interval: reader.read(2)?.unwrap_or_default(),
            info_count: reader.read(3)?.unwrap_or_default(),
            warning_count: reader.read(4)?.unwrap_or_default(),
            severe_count: reader.read(5)?.unwrap_or_default(),
            other_count: reader.read(6)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoricalIndexRequest {
    pub request_id: i32,
    pub start: i64,
    pub end: i64,
}

impl SofObject for HistoricalIndexRequest {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.request_id)?;
        writer.write(2, self.start)?;
        writer.write(3, self.end)
    }
}

impl SofRead for HistoricalIndexRequest {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            request_id: reader.read(1)?.unwrap_or_default(),
            start: reader.read(2)?.unwrap_or_default(),
            end: reader.read(3)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoricalIndexResponse {
    pub elements: Vec<HistoricalIndexElement>,
    pub request_id: i32,
    pub last_batch: bool,
}

impl SofObject for HistoricalIndexResponse {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write_uniform_array(1, Some(self.elements.as_slice()))?;
        writer.write(2, self.request_id)?;
        writer.write(3, self.last_batch)
    }
}

impl SofRead for HistoricalIndexResponse {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            elements: reader.read_uniform_array(1)?.unwrap_or_default(),
            request_id: reader.read(2)?.unwrap_or_default(),
            last_batch: reader.read(3)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalDataRequest {
    pub request_id: i32,
    pub start: i64,
    pub end: i64,
    pub level_filter: i32,
    pub quick_filter: Option<String>,
    pub most_recent_first: bool,
}

impl Default for HistoricalDataRequest {
    fn default() -> Self {
        Self {
            request_id: 0,
            start: 0,
            end: 0,
            level_filter: 0,
            quick_filter: None,
            most_recent_first: true,
        }
    }
}

impl SofObject for HistoricalDataRequest {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.request_id)?;
        writer.write(2, self.start)?;
        writer.write(3, self.end)?;
        writer.write(4, self.level_filter)?;
        writer.write_string(5, self.quick_filter.as_deref())?;
        writer.write(6, self.most_recent_first)
    }
}

impl SofRead for HistoricalDataRequest {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            request_id: reader.read(1)?.unwrap_or_default(),
            start: reader.read(2)?.unwrap_or_default(),
            end: reader.read(3)?.unwrap_or_default(),
            level_filter: reader.read(4)?.unwrap_or_default(),
            quick_filter: reader.read_string(5)?,
            most_recent_first: reader.read(6)?.unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoricalDataResponse {
    pub request_id: i32,
    pub block: Option<CompressedBlock>,
    pub last_batch: bool,
}

impl SofObject for HistoricalDataResponse {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.request_id)?;
        writer.write_object(2, self.block.as_ref())?;
        writer.write(3, self.last_batch)
    }
}

impl SofRead for HistoricalDataResponse {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            request_id: reader.read(1)?.unwrap_or_default(),
            block: reader.read_object_as(2)?,
            last_batch: reader.read(3)?.unwrap_or_default(),
        })
    }
}
