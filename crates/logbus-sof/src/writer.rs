use bytes::{BufMut, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    Error, NOT_NULL, NULL, Primitive, Result, SofConfiguration, SofObject, TYPE_BYTE_ARRAY,
    TYPE_DATE_OBJECT, TYPE_NON_UNIFORM_OBJECT_ARRAY, TYPE_NULL_USER_TYPE,
    TYPE_UNIFORM_OBJECT_ARRAY, TYPE_UTF8, TYPE_UTF8_ARRAY, write_length_prefixed,
};

/// Appends one object's fields to a buffer.
///
/// Field indices must be strictly increasing; the writer rejects anything else
/// with [`Error::OutOfOrderField`] before touching the buffer.
pub struct SofWriter<'a> {
    buf: &'a mut BytesMut,
    config: &'a SofConfiguration,
    last_index: Option<i32>,
    field_count: usize,
}

impl<'a> SofWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, config: &'a SofConfiguration) -> Self {
        Self {
            buf,
            config,
            last_index: None,
            field_count: 0,
        }
    }

    pub fn configuration(&self) -> &SofConfiguration {
        self.config
    }

    /// Headers written so far. Micro format skips headers on plain fields.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn write<T: Primitive>(&mut self, field: i32, value: T) -> Result<()> {
        self.begin_field(field, T::TAG)?;
        value.put(self.buf);
        Ok(())
    }

    pub fn write_nullable<T: Primitive>(&mut self, field: i32, value: Option<T>) -> Result<()> {
        self.begin_field(field, T::NULLABLE_TAG)?;
        match value {
            Some(value) => {
                self.buf.put_u8(NOT_NULL);
                value.put(self.buf);
            }
            None => self.buf.put_u8(NULL),
        }
        Ok(())
    }

    pub fn write_string(&mut self, field: i32, value: Option<&str>) -> Result<()> {
        self.begin_field(field, TYPE_UTF8)?;
        put_string(self.buf, value)
    }

    pub fn write_string_array<S: AsRef<str>>(
        &mut self,
        field: i32,
        values: Option<&[S]>,
    ) -> Result<()> {
        self.begin_field(field, TYPE_UTF8_ARRAY)?;
        let Some(values) = values else {
            self.buf.put_i32(-1);
            return Ok(());
        };
        self.buf.put_i32(count(values.len())?);
        for value in values {
            put_string(self.buf, Some(value.as_ref()))?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, field: i32, value: Option<&[u8]>) -> Result<()> {
        self.begin_field(field, TYPE_BYTE_ARRAY)?;
        match value {
            Some(bytes) => {
                self.buf.put_i32(count(bytes.len())?);
                self.buf.put_slice(bytes);
            }
            None => self.buf.put_i32(-1),
        }
        Ok(())
    }

    /// Dates travel as a null flag plus milliseconds since the Unix epoch.
    pub fn write_date(&mut self, field: i32, value: Option<SystemTime>) -> Result<()> {
        self.begin_field(field, TYPE_DATE_OBJECT)?;
        match value {
            Some(time) => {
                self.buf.put_u8(NOT_NULL);
                self.buf.put_i64(epoch_millis(time)?);
            }
            None => self.buf.put_u8(NULL),
        }
        Ok(())
    }

    pub fn write_object<T: SofObject + ?Sized>(
        &mut self,
        field: i32,
        object: Option<&T>,
    ) -> Result<()> {
        let Some(object) = object else {
            return self.begin_object_field(field, TYPE_NULL_USER_TYPE);
        };
        let type_id = self
            .config
            .type_id_of(object.as_any().type_id(), object.type_name())?;
        self.begin_object_field(field, type_id)?;
        self.put_body(object)
    }

    /// Array whose elements all share the registered type `T`.
    pub fn write_uniform_array<T: SofObject>(
        &mut self,
        field: i32,
        objects: Option<&[T]>,
    ) -> Result<()> {
        let Some(objects) = objects else {
            return self.begin_object_field(field, TYPE_NULL_USER_TYPE);
        };
        let type_id = self.config.type_id::<T>()?;
        let len = count(objects.len())?;
        self.begin_object_field(field, TYPE_UNIFORM_OBJECT_ARRAY)?;
        self.buf.put_i32(type_id);
        self.buf.put_i32(len);
        for object in objects {
            self.put_body(object)?;
        }
        Ok(())
    }

    /// Array of mixed registered types; `None` elements are written as null.
    pub fn write_object_array(
        &mut self,
        field: i32,
        objects: Option<&[Option<&dyn SofObject>]>,
    ) -> Result<()> {
        let Some(objects) = objects else {
            return self.begin_object_field(field, TYPE_NULL_USER_TYPE);
        };
        let len = count(objects.len())?;
        let type_ids = objects
            .iter()
            .map(|object| match *object {
                Some(object) => self
                    .config
                    .type_id_of(object.as_any().type_id(), object.type_name()),
                None => Ok(TYPE_NULL_USER_TYPE),
            })
            .collect::<Result<Vec<_>>>()?;
        self.begin_object_field(field, TYPE_NON_UNIFORM_OBJECT_ARRAY)?;
        self.buf.put_i32(len);
        for (object, type_id) in objects.iter().zip(type_ids) {
            self.buf.put_i32(type_id);
            if let Some(object) = *object {
                self.put_body(object)?;
            }
        }
        Ok(())
    }

    fn put_body<T: SofObject + ?Sized>(&mut self, object: &T) -> Result<()> {
        let config = self.config;
        write_length_prefixed(self.buf, |buf| {
            let mut nested = SofWriter::new(buf, config);
            object.write_fields(&mut nested)
        })
    }

    fn check_order(&mut self, field: i32) -> Result<()> {
        if let Some(last) = self.last_index
            && field <= last
        {
            return Err(Error::OutOfOrderField { index: field, last });
        }
        self.last_index = Some(field);
        Ok(())
    }

    fn begin_field(&mut self, field: i32, tag: i32) -> Result<()> {
        self.check_order(field)?;
        if !self.config.is_micro_format() {
            self.put_header(field, tag);
        }
        Ok(())
    }

    fn begin_object_field(&mut self, field: i32, tag: i32) -> Result<()> {
        self.check_order(field)?;
        self.put_header(field, tag);
        Ok(())
    }

    fn put_header(&mut self, field: i32, tag: i32) {
        self.buf.put_i32(field);
        self.buf.put_i32(tag);
        self.field_count += 1;
    }
}

fn count(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::TooLarge)
}

fn put_string(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            buf.put_i32(count(value.len())?);
            buf.put_slice(value.as_bytes());
        }
        None => buf.put_i32(-1),
    }
    Ok(())
}

fn epoch_millis(time: SystemTime) -> Result<i64> {
    let millis = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()),
        Err(before) => i64::try_from(before.duration().as_millis()).map(|millis| -millis),
    };
    millis.map_err(|_| Error::TooLarge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TYPE_INT, TYPE_INT_OBJECT, TYPE_LONG};

    #[derive(Debug)]
    struct Empty;

    impl SofObject for Empty {
        fn write_fields(&self, _writer: &mut SofWriter<'_>) -> Result<()> {
            Ok(())
        }
    }

    impl crate::SofRead for Empty {
        fn read_fields(_reader: &mut crate::SofReader<'_>) -> Result<Self> {
            Ok(Empty)
        }
    }

    fn headers() -> SofConfiguration {
        SofConfiguration::builder()
            .register::<Empty>(5)
            .expect("register")
            .build()
    }

    fn micro() -> SofConfiguration {
        SofConfiguration::builder()
            .register::<Empty>(5)
            .expect("register")
            .micro_format(true)
            .build()
    }

    #[test]
    fn increasing_indices_are_accepted() {
        let config = headers();
        let mut buf = BytesMut::new();
        let mut writer = SofWriter::new(&mut buf, &config);
        writer.write(1, 1i32).expect("1");
        writer.write(5, 2i32).expect("5");
        writer.write(10, 3i32).expect("10");
        assert_eq!(writer.field_count(), 3);
    }

    #[test]
    fn out_of_order_index_is_rejected_without_writing() {
        let config = headers();
        let mut buf = BytesMut::new();
        let mut writer = SofWriter::new(&mut buf, &config);
        writer.write(3, 7i64).expect("3");
        let err = writer.write(2, 8i64).expect_err("2 after 3");
        assert!(matches!(err, Error::OutOfOrderField { index: 2, last: 3 }));
        let err = writer.write_string(3, Some("again")).expect_err("repeat");
        assert!(matches!(err, Error::OutOfOrderField { index: 3, last: 3 }));
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn header_carries_index_then_tag() {
        let config = headers();
        let mut buf = BytesMut::new();
        SofWriter::new(&mut buf, &config)
            .write(4, 9i64)
            .expect("write");
        let mut expected = BytesMut::new();
        expected.put_i32(4);
        expected.put_i32(TYPE_LONG);
        expected.put_i64(9);
        assert_eq!(buf, expected);
    }

    #[test]
    fn nullable_writes_flag_byte() {
        let config = headers();
        let mut buf = BytesMut::new();
        let mut writer = SofWriter::new(&mut buf, &config);
        writer.write_nullable::<i32>(1, None).expect("null");
        writer.write_nullable(2, Some(6i32)).expect("value");
        let mut expected = BytesMut::new();
        expected.put_i32(1);
        expected.put_i32(TYPE_INT_OBJECT);
        expected.put_u8(NULL);
        expected.put_i32(2);
        expected.put_i32(TYPE_INT_OBJECT);
        expected.put_u8(NOT_NULL);
        expected.put_i32(6);
        assert_eq!(buf, expected);
    }

    #[test]
    fn micro_format_drops_plain_headers_but_keeps_object_headers() {
        let config = micro();
        let mut buf = BytesMut::new();
        let mut writer = SofWriter::new(&mut buf, &config);
        writer.write(1, 3i32).expect("int");
        writer.write_string(2, Some("ab")).expect("string");
        writer.write_object(3, Some(&Empty)).expect("object");
        writer.write_object::<Empty>(4, None).expect("null object");
        assert_eq!(writer.field_count(), 2);
        let mut expected = BytesMut::new();
        expected.put_i32(3);
        expected.put_i32(2);
        expected.put_slice(b"ab");
        expected.put_i32(3);
        expected.put_i32(5);
        expected.put_i32(0);
        expected.put_i32(4);
        expected.put_i32(TYPE_NULL_USER_TYPE);
        assert_eq!(buf, expected);
    }

    #[test]
    fn nested_object_length_is_backpatched() {
        #[derive(Debug)]
        struct Holder;

        impl SofObject for Holder {
            fn write_fields(&self, writer: &mut SofWriter<'_>) -> Result<()> {
                writer.write(1, 11i32)?;
                writer.write(2, 12i32)
            }
        }

        impl crate::SofRead for Holder {
            fn read_fields(_reader: &mut crate::SofReader<'_>) -> Result<Self> {
                Ok(Holder)
            }
        }

        let config = SofConfiguration::builder()
            .register::<Holder>(6)
            .expect("register")
            .build();
        let mut buf = BytesMut::new();
        SofWriter::new(&mut buf, &config)
            .write_object(1, Some(&Holder))
            .expect("write");
        let mut expected = BytesMut::new();
        expected.put_i32(1);
        expected.put_i32(6);
        expected.put_i32(24);
        for (index, value) in [(1, 11), (2, 12)] {
            expected.put_i32(index);
            expected.put_i32(TYPE_INT);
            expected.put_i32(value);
        }
        assert_eq!(buf, expected);
    }

    #[test]
    fn mixed_array_marks_missing_elements() {
        let config = headers();
        let mut buf = BytesMut::new();
        let items: [Option<&dyn SofObject>; 2] = [None, Some(&Empty)];
        SofWriter::new(&mut buf, &config)
            .write_object_array(1, Some(&items[..]))
            .expect("write");
        let mut expected = BytesMut::new();
        expected.put_i32(1);
        expected.put_i32(TYPE_NON_UNIFORM_OBJECT_ARRAY);
        expected.put_i32(2);
        expected.put_i32(TYPE_NULL_USER_TYPE);
        expected.put_i32(5);
        expected.put_i32(0);
        assert_eq!(buf, expected);
    }

    #[test]
    fn unregistered_nested_type_fails() {
        #[derive(Debug)]
        struct Stranger;

        impl SofObject for Stranger {
            fn write_fields(&self, _writer: &mut SofWriter<'_>) -> Result<()> {
                Ok(())
            }
        }

        let config = headers();
        let mut buf = BytesMut::new();
        let err = SofWriter::new(&mut buf, &config)
            .write_object(1, Some(&Stranger))
            .expect_err("unregistered");
        assert!(matches!(err, Error::UnregisteredType(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn dates_before_epoch_are_negative() {
        let time = UNIX_EPOCH - std::time::Duration::from_millis(1500);
        assert_eq!(epoch_millis(time).expect("millis"), -1500);
    }
}
