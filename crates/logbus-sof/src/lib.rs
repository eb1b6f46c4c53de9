// SOF: field-indexed binary object format used for every logbus message body.
//
// An object is a run of `(field index, type tag, value)` triples with strictly
// increasing indices. Nested objects are framed as `(type id, length, body)` so a
// reader that does not know a type can step over it by length alone.
use bytes::{Buf, BufMut, BytesMut};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

mod config;
mod reader;
mod value;
mod writer;

pub use config::{SofConfiguration, SofConfigurationBuilder};
pub use reader::SofReader;
pub use value::Primitive;
pub use writer::SofWriter;

pub const NOT_NULL: u8 = 1;
pub const NULL: u8 = 0;

pub const TYPE_INT: i32 = -1;
pub const TYPE_LONG: i32 = -2;
pub const TYPE_UTF8_ARRAY: i32 = -3;
pub const TYPE_BYTE_ARRAY: i32 = -4;
pub const TYPE_DOUBLE: i32 = -5;
pub const TYPE_UTF8: i32 = -6;
pub const TYPE_BYTE: i32 = -7;
pub const TYPE_SHORT: i32 = -8;
pub const TYPE_FLOAT: i32 = -9;
pub const TYPE_BOOLEAN: i32 = -10;
pub const TYPE_CHAR: i32 = -11;
pub const TYPE_NULL_USER_TYPE: i32 = -12;
pub const TYPE_INT_OBJECT: i32 = -13;
pub const TYPE_LONG_OBJECT: i32 = -14;
pub const TYPE_DOUBLE_OBJECT: i32 = -15;
pub const TYPE_BYTE_OBJECT: i32 = -16;
pub const TYPE_SHORT_OBJECT: i32 = -17;
pub const TYPE_FLOAT_OBJECT: i32 = -18;
pub const TYPE_BOOLEAN_OBJECT: i32 = -19;
pub const TYPE_CHARACTER_OBJECT: i32 = -20;
pub const TYPE_DATE_OBJECT: i32 = -21;
// Reserved: readers skip it, nothing in logbus writes it.
pub const TYPE_BIGDECIMAL_OBJECT: i32 = -22;
pub const TYPE_UNIFORM_OBJECT_ARRAY: i32 = -23;
pub const TYPE_NON_UNIFORM_OBJECT_ARRAY: i32 = -24;

/// Bytes taken by a frame header: type id then body length.
pub const FRAME_HEADER_LEN: usize = 8;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("out of order field index: tried to write {index} but the last index was {last}")]
    OutOfOrderField { index: i32, last: i32 },
    #[error("type {0} has not been registered")]
    UnregisteredType(&'static str),
    #[error("unknown sof type id {type_id} ({length} bytes skipped)")]
    UnknownType { type_id: i32, length: usize },
    #[error("incomplete object")]
    PartialDecode,
    #[error("malformed object: {0}")]
    Malformed(String),
    #[error("field {field} has type tag {found}, expected {expected}")]
    UnexpectedType { field: i32, expected: i32, found: i32 },
    #[error("registration error: {0}")]
    Registration(String),
    #[error("value too large for the wire format")]
    TooLarge,
}

impl Error {
    /// Conditions the caller can recover from without treating the stream as corrupt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::UnknownType { .. } | Error::PartialDecode)
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Malformed(reason.into())
    }
}

/// Lets a `dyn SofObject` be downcast to its concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type that can write itself as a SOF field stream.
pub trait SofObject: AsAny + Debug + Send + Sync {
    fn write_fields(&self, writer: &mut SofWriter<'_>) -> Result<()>;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A type that can rebuild itself from a SOF field stream.
pub trait SofRead: Sized {
    fn read_fields(reader: &mut SofReader<'_>) -> Result<Self>;
}

impl dyn SofObject {
    pub fn downcast_ref<T: SofObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: SofObject>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Header and body of one framed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectFrame<'a> {
    pub type_id: i32,
    pub body: &'a [u8],
}

impl ObjectFrame<'_> {
    /// Total bytes the frame occupies, header included.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len()
    }
}

/// Write `object` as a framed top-level object: type id, length, fields.
///
/// ```
/// use bytes::BytesMut;
/// use logbus_sof::{SofConfiguration, SofObject, SofRead, SofReader, SofWriter};
///
/// #[derive(Debug, PartialEq)]
/// struct Ping {
///     seq: i64,
/// }
///
/// impl SofObject for Ping {
///     fn write_fields(&self, writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
///         writer.write(1, self.seq)
///     }
/// }
///
/// impl SofRead for Ping {
///     fn read_fields(reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
///         Ok(Ping { seq: reader.read(1)?.unwrap_or_default() })
///     }
/// }
///
/// let config = SofConfiguration::builder().register::<Ping>(3).unwrap().build();
/// let mut buf = BytesMut::new();
/// logbus_sof::encode_object(&mut buf, &Ping { seq: 42 }, &config).unwrap();
/// let (ping, used) = logbus_sof::decode_object_as::<Ping>(&buf, &config).unwrap();
/// assert_eq!(ping, Ping { seq: 42 });
/// assert_eq!(used, buf.len());
/// ```
pub fn encode_object<T: SofObject + ?Sized>(
    buf: &mut BytesMut,
    object: &T,
    config: &SofConfiguration,
) -> Result<()> {
    let type_id = config.type_id_of(object.as_any().type_id(), object.type_name())?;
    buf.put_i32(type_id);
    write_length_prefixed(buf, |buf| {
        let mut writer = SofWriter::new(buf, config);
        object.write_fields(&mut writer)
    })
}

/// Peek at the frame at the front of `input` without decoding its fields.
pub fn decode_frame(input: &[u8]) -> Result<ObjectFrame<'_>> {
    if input.len() < FRAME_HEADER_LEN {
        return Err(Error::PartialDecode);
    }
    let mut header = &input[..FRAME_HEADER_LEN];
    let type_id = header.get_i32();
    let length = header.get_i32();
    let length = usize::try_from(length)
        .map_err(|_| Error::malformed(format!("negative object length {length}")))?;
    let end = FRAME_HEADER_LEN
        .checked_add(length)
        .ok_or(Error::TooLarge)?;
    if input.len() < end {
        return Err(Error::PartialDecode);
    }
    Ok(ObjectFrame {
        type_id,
        body: &input[FRAME_HEADER_LEN..end],
    })
}

/// Decode the framed object at the front of `input` through the registry.
///
/// Returns the object and the number of bytes it occupied. Unknown type ids
/// surface as [`Error::UnknownType`] carrying the length the caller can skip.
pub fn decode_object(
    input: &[u8],
    config: &SofConfiguration,
) -> Result<(Arc<dyn SofObject>, usize)> {
    let frame = decode_frame(input)?;
    let used = frame.encoded_len();
    let mut reader = SofReader::new(frame.body, config);
    let object = config.decode(frame.type_id, frame.body.len(), &mut reader)?;
    Ok((object, used))
}

/// Decode the framed object at the front of `input` as a known type.
pub fn decode_object_as<T: SofObject + SofRead>(
    input: &[u8],
    config: &SofConfiguration,
) -> Result<(T, usize)> {
    let frame = decode_frame(input)?;
    let expected = config.type_id::<T>()?;
    if frame.type_id != expected {
        return Err(Error::UnexpectedType {
            field: 0,
            expected,
            found: frame.type_id,
        });
    }
    let mut reader = SofReader::new(frame.body, config);
    let object = T::read_fields(&mut reader)?;
    Ok((object, frame.encoded_len()))
}

// Reserve an i32 length slot, run `body`, then patch in the byte count.
pub(crate) fn write_length_prefixed(
    buf: &mut BytesMut,
    body: impl FnOnce(&mut BytesMut) -> Result<()>,
) -> Result<()> {
    let slot = buf.len();
    buf.put_i32(0);
    let start = buf.len();
    body(buf)?;
    let length = i32::try_from(buf.len() - start).map_err(|_| Error::TooLarge)?;
    buf[slot..start].copy_from_slice(&length.to_be_bytes());
    Ok(())
}
