use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

/// Fixed-width scalars with a plain and a nullable ("boxed") type tag.
///
/// Shorts travel as four bytes and chars as their 32-bit scalar value, so
/// every fixed-width field is one of 1, 4 or 8 bytes.
pub trait Primitive: Copy + Sized {
    const TAG: i32;
    const NULLABLE_TAG: i32;
    const WIDTH: usize;

    fn put(self, buf: &mut BytesMut);

    /// Read the value from the front of `input`, which must hold at least `WIDTH` bytes.
    fn take(input: &mut &[u8]) -> Result<Self>;
}

macro_rules! primitive {
    ($ty:ty, $tag:expr, $nullable:expr, $width:expr, $put:ident, $get:ident) => {
        impl Primitive for $ty {
            const TAG: i32 = $tag;
            const NULLABLE_TAG: i32 = $nullable;
            const WIDTH: usize = $width;

            fn put(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn take(input: &mut &[u8]) -> Result<Self> {
                ensure(input, $width)?;
                Ok(input.$get())
            }
        }
    };
}

primitive!(i8, crate::TYPE_BYTE, crate::TYPE_BYTE_OBJECT, 1, put_i8, get_i8);
primitive!(i32, crate::TYPE_INT, crate::TYPE_INT_OBJECT, 4, put_i32, get_i32);
primitive!(i64, crate::TYPE_LONG, crate::TYPE_LONG_OBJECT, 8, put_i64, get_i64);
primitive!(f32, crate::TYPE_FLOAT, crate::TYPE_FLOAT_OBJECT, 4, put_f32, get_f32);
primitive!(f64, crate::TYPE_DOUBLE, crate::TYPE_DOUBLE_OBJECT, 8, put_f64, get_f64);

impl Primitive for bool {
    const TAG: i32 = crate::TYPE_BOOLEAN;
    const NULLABLE_TAG: i32 = crate::TYPE_BOOLEAN_OBJECT;
    const WIDTH: usize = 1;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self));
    }

    fn take(input: &mut &[u8]) -> Result<Self> {
        ensure(input, 1)?;
        Ok(input.get_u8() != 0)
    }
}

impl Primitive for i16 {
    const TAG: i32 = crate::TYPE_SHORT;
    const NULLABLE_TAG: i32 = crate::TYPE_SHORT_OBJECT;
    const WIDTH: usize = 4;

    fn put(self, buf: &mut BytesMut) {
        buf.put_i32(i32::from(self));
    }

    fn take(input: &mut &[u8]) -> Result<Self> {
        ensure(input, 4)?;
        let value = input.get_i32();
        i16::try_from(value).map_err(|_| Error::malformed(format!("short out of range: {value}")))
    }
}

impl Primitive for char {
    const TAG: i32 = crate::TYPE_CHAR;
    const NULLABLE_TAG: i32 = crate::TYPE_CHARACTER_OBJECT;
    const WIDTH: usize = 4;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u32(u32::from(self));
    }

    fn take(input: &mut &[u8]) -> Result<Self> {
        ensure(input, 4)?;
        let value = input.get_u32();
        char::from_u32(value).ok_or_else(|| Error::malformed(format!("invalid char {value:#x}")))
    }
}

pub(crate) fn ensure(input: &[u8], needed: usize) -> Result<()> {
    if input.len() < needed {
        return Err(Error::malformed(format!(
            "needed {needed} bytes, {} left",
            input.len()
        )));
    }
    Ok(())
}
