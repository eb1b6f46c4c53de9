// Compressed batches of log events, as returned by historical data queries.
use bytes::{Bytes, BytesMut};
use logbus_sof::{SofConfiguration, SofObject, SofRead, SofReader, SofWriter};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{DefaultLogEvent, Error, Result};

pub const COMPRESSION_NOOP: i8 = 0;
/// Reserved for an LZ4 strategy registered by the application.
pub const COMPRESSION_LZ4: i8 = 1;
/// Reserved for a Snappy strategy registered by the application.
pub const COMPRESSION_SNAPPY: i8 = 2;

/// A reversible byte transform identified on the wire by a one-byte id.
pub trait CompressionStrategy: fmt::Debug + Send + Sync {
    fn id(&self) -> i8;
    fn compress(&self, input: &[u8]) -> Result<Bytes>;
    fn decompress(&self, input: &[u8]) -> Result<Bytes>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompression;

impl CompressionStrategy for NoopCompression {
    fn id(&self) -> i8 {
        COMPRESSION_NOOP
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(input))
    }

    fn decompress(&self, input: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(input))
    }
}

/// Strategies available for decoding blocks, keyed by id.
#[derive(Debug, Clone)]
pub struct CompressionRegistry {
    strategies: HashMap<i8, Arc<dyn CompressionStrategy>>,
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(NoopCompression));
        registry
    }
}

impl CompressionRegistry {
    /// Add a strategy, replacing any earlier one with the same id.
    pub fn register(
        &mut self,
        strategy: Arc<dyn CompressionStrategy>,
    ) -> Option<Arc<dyn CompressionStrategy>> {
        self.strategies.insert(strategy.id(), strategy)
    }

    pub fn get(&self, id: i8) -> Result<Arc<dyn CompressionStrategy>> {
        self.strategies
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownCompression(id))
    }
}

/// How events are laid out inside a block before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialisationStrategy {
    /// Each event framed with field headers.
    #[default]
    Framed,
    /// Events back to back in micro format, with no framing.
    Micro,
}

impl SerialisationStrategy {
    pub fn id(self) -> i8 {
        match self {
            SerialisationStrategy::Framed => 0,
            SerialisationStrategy::Micro => 1,
        }
    }

    pub fn from_id(id: i8) -> Result<Self> {
        match id {
            0 => Ok(SerialisationStrategy::Framed),
            1 => Ok(SerialisationStrategy::Micro),
            other => Err(Error::UnknownSerialisation(other)),
        }
    }

    // Blocks use their own registry: the event is the only type, at id 0.
    fn configuration(self) -> Result<SofConfiguration> {
        Ok(SofConfiguration::builder()
            .register::<DefaultLogEvent>(0)?
            .micro_format(self == SerialisationStrategy::Micro)
            .build())
    }
}

/// A compressed run of log events with its strategy ids and item count.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompressedBlock {
    pub compression: i8,
    pub serialisation: i8,
    pub items: i32,
    pub data: Bytes,
}

impl CompressedBlock {
    pub fn encode(
        events: &[DefaultLogEvent],
        compression: &dyn CompressionStrategy,
        serialisation: SerialisationStrategy,
    ) -> Result<Self> {
        let config = serialisation.configuration()?;
        let mut buf = BytesMut::new();
        for event in events {
            match serialisation {
                SerialisationStrategy::Framed => {
                    logbus_sof::encode_object(&mut buf, event, &config)?
                }
                SerialisationStrategy::Micro => {
                    event.write_fields(&mut SofWriter::new(&mut buf, &config))?
                }
            }
        }
        let items = i32::try_from(events.len()).map_err(|_| logbus_sof::Error::TooLarge)?;
        Ok(Self {
            compression: compression.id(),
            serialisation: serialisation.id(),
            items,
            data: compression.compress(&buf)?,
        })
    }

    /// Decompress and decode every event, checking the declared item count.
    pub fn decode_all(&self, registry: &CompressionRegistry) -> Result<Vec<DefaultLogEvent>> {
        let serialisation = SerialisationStrategy::from_id(self.serialisation)?;
        let config = serialisation.configuration()?;
        let raw = registry.get(self.compression)?.decompress(&self.data)?;
        let expected = usize::try_from(self.items).map_err(|_| {
            logbus_sof::Error::Malformed(format!("negative item count {}", self.items))
        })?;
        let mut events = Vec::with_capacity(expected);
        match serialisation {
            SerialisationStrategy::Framed => {
                let mut offset = 0;
                while offset < raw.len() {
                    let (event, used) =
                        logbus_sof::decode_object_as::<DefaultLogEvent>(&raw[offset..], &config)?;
                    events.push(event);
                    offset += used;
                }
            }
            SerialisationStrategy::Micro => {
                let mut reader = SofReader::new(&raw, &config);
                while !reader.is_empty() {
                    events.push(DefaultLogEvent::read_fields(&mut reader)?);
                }
            }
        }
        if events.len() != expected {
            return Err(Error::ItemCount {
                expected,
                found: events.len(),
            });
        }
        Ok(events)
    }
}

impl SofObject for CompressedBlock {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
        writer.write(1, self.compression)?;
        writer.write(2, self.serialisation)?;
        writer.write(3, self.items)?;
        writer.write_bytes(4, Some(&self.data[..]))
    }
}

impl SofRead for CompressedBlock {
    fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
        Ok(Self {
            compression: reader.read(1)?.unwrap_or_default(),
            serialisation: reader.read(2)?.unwrap_or_default(),
            items: reader.read(3)?.unwrap_or_default(),
            data: reader.read_bytes(4)?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Level;

    #[derive(Debug)]
    struct Reversing;

    impl CompressionStrategy for Reversing {
        fn id(&self) -> i8 {
            COMPRESSION_SNAPPY
        }

        fn compress(&self, input: &[u8]) -> Result<Bytes> {
            Ok(input.iter().rev().copied().collect::<Vec<_>>().into())
        }

        fn decompress(&self, input: &[u8]) -> Result<Bytes> {
            self.compress(input)
        }
    }

    fn events() -> Vec<DefaultLogEvent> {
        (0..3)
            .map(|index| {
                let mut event = DefaultLogEvent::new(Level::INFO, "batch", format!("event {index}"));
                event.sequence_number = index;
                event.local_creation_time_millis = 1_000 + index;
                event
            })
            .collect()
    }

    #[test]
    fn both_layouts_decode_back() {
        let registry = CompressionRegistry::default();
        for serialisation in [SerialisationStrategy::Framed, SerialisationStrategy::Micro] {
            let block = CompressedBlock::encode(&events(), &NoopCompression, serialisation)
                .expect("encode");
            assert_eq!(block.items, 3);
            assert_eq!(block.serialisation, serialisation.id());
            assert_eq!(block.decode_all(&registry).expect("decode"), events());
        }
    }

    #[test]
    fn micro_layout_is_smaller() {
        let framed =
            CompressedBlock::encode(&events(), &NoopCompression, SerialisationStrategy::Framed)
                .expect("framed");
        let micro =
            CompressedBlock::encode(&events(), &NoopCompression, SerialisationStrategy::Micro)
                .expect("micro");
        assert!(micro.data.len() < framed.data.len());
    }

    #[test]
    fn external_strategy_must_be_registered() {
        let block = CompressedBlock::encode(&events(), &Reversing, SerialisationStrategy::Framed)
            .expect("encode");
        let mut registry = CompressionRegistry::default();
        let err = block.decode_all(&registry).expect_err("unregistered");
        assert!(matches!(err, Error::UnknownCompression(COMPRESSION_SNAPPY)));
        registry.register(Arc::new(Reversing));
        assert_eq!(block.decode_all(&registry).expect("decode"), events());
    }

    #[test]
    fn item_count_mismatch_is_reported() {
        let mut block =
            CompressedBlock::encode(&events(), &NoopCompression, SerialisationStrategy::Framed)
                .expect("encode");
        block.items = 5;
        let err = block
            .decode_all(&CompressionRegistry::default())
            .expect_err("count");
        assert!(matches!(err, Error::ItemCount { expected: 5, found: 3 }));
    }

    #[test]
    fn unknown_serialisation_is_rejected() {
        assert!(matches!(
            SerialisationStrategy::from_id(7),
            Err(Error::UnknownSerialisation(7))
        ));
    }
}
