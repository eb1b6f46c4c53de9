use bytes::{Buf, Bytes};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::value::ensure;
use crate::{
    Error, NOT_NULL, NULL, Primitive, Result, SofConfiguration, SofObject, SofRead,
    TYPE_BIGDECIMAL_OBJECT, TYPE_BOOLEAN, TYPE_BOOLEAN_OBJECT, TYPE_BYTE, TYPE_BYTE_ARRAY,
    TYPE_BYTE_OBJECT, TYPE_CHAR, TYPE_CHARACTER_OBJECT, TYPE_DATE_OBJECT, TYPE_DOUBLE,
    TYPE_DOUBLE_OBJECT, TYPE_FLOAT, TYPE_FLOAT_OBJECT, TYPE_INT, TYPE_INT_OBJECT, TYPE_LONG,
    TYPE_LONG_OBJECT, TYPE_NON_UNIFORM_OBJECT_ARRAY, TYPE_NULL_USER_TYPE, TYPE_SHORT,
    TYPE_SHORT_OBJECT, TYPE_UNIFORM_OBJECT_ARRAY, TYPE_UTF8, TYPE_UTF8_ARRAY,
};

#[derive(Debug, Clone, Copy)]
struct Header {
    index: i32,
    tag: i32,
}

/// Reads fields back out of one object body.
///
/// Fields are requested by index in ascending order. Lower indices nobody asked
/// for are skipped by their type tag, and a field that was never written reads
/// as `None`. In micro format plain fields carry no header and are read in
/// order; object and array fields still carry one.
pub struct SofReader<'a> {
    input: &'a [u8],
    config: &'a SofConfiguration,
    pending: Option<Header>,
}

impl<'a> SofReader<'a> {
    pub fn new(input: &'a [u8], config: &'a SofConfiguration) -> Self {
        Self {
            input,
            config,
            pending: None,
        }
    }

    pub fn configuration(&self) -> &SofConfiguration {
        self.config
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.pending.is_none()
    }

    /// Unread bytes, not counting a header that has been peeked.
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn read<T: Primitive>(&mut self, field: i32) -> Result<Option<T>> {
        match self.seek_plain(field, T::TAG)? {
            None => Ok(None),
            Some(tag) if tag == T::TAG => T::take(&mut self.input).map(Some),
            Some(tag) if tag == T::NULLABLE_TAG => self.take_nullable(),
            Some(found) => Err(unexpected(field, T::TAG, found)),
        }
    }

    pub fn read_nullable<T: Primitive>(&mut self, field: i32) -> Result<Option<T>> {
        match self.seek_plain(field, T::NULLABLE_TAG)? {
            None => Ok(None),
            Some(tag) if tag == T::NULLABLE_TAG => self.take_nullable(),
            Some(tag) if tag == T::TAG => T::take(&mut self.input).map(Some),
            Some(found) => Err(unexpected(field, T::NULLABLE_TAG, found)),
        }
    }

    pub fn read_string(&mut self, field: i32) -> Result<Option<String>> {
        match self.seek_plain(field, TYPE_UTF8)? {
            None => Ok(None),
            Some(TYPE_UTF8) => self.take_string(),
            Some(found) => Err(unexpected(field, TYPE_UTF8, found)),
        }
    }

    /// Null elements inside a non-null array read back as empty strings.
    pub fn read_string_array(&mut self, field: i32) -> Result<Option<Vec<String>>> {
        match self.seek_plain(field, TYPE_UTF8_ARRAY)? {
            None => Ok(None),
            Some(TYPE_UTF8_ARRAY) => {
                let Some(count) = self.take_len()? else {
                    return Ok(None);
                };
                let mut values = Vec::with_capacity(count.min(self.input.len() / 4));
                for _ in 0..count {
                    values.push(self.take_string()?.unwrap_or_default());
                }
                Ok(Some(values))
            }
            Some(found) => Err(unexpected(field, TYPE_UTF8_ARRAY, found)),
        }
    }

    pub fn read_bytes(&mut self, field: i32) -> Result<Option<Bytes>> {
        match self.seek_plain(field, TYPE_BYTE_ARRAY)? {
            None => Ok(None),
            Some(TYPE_BYTE_ARRAY) => match self.take_len()? {
                Some(len) => Ok(Some(Bytes::copy_from_slice(self.take_slice(len)?))),
                None => Ok(None),
            },
            Some(found) => Err(unexpected(field, TYPE_BYTE_ARRAY, found)),
        }
    }

    pub fn read_date(&mut self, field: i32) -> Result<Option<SystemTime>> {
        match self.seek_plain(field, TYPE_DATE_OBJECT)? {
            None => Ok(None),
            Some(TYPE_DATE_OBJECT) => match self.take_nullable::<i64>()? {
                Some(millis) => from_epoch_millis(millis).map(Some),
                None => Ok(None),
            },
            Some(found) => Err(unexpected(field, TYPE_DATE_OBJECT, found)),
        }
    }

    /// Decode a nested object through the registry.
    ///
    /// An unregistered type id is stepped over and reported as
    /// [`Error::UnknownType`]; the reader stays positioned after it.
    pub fn read_object(&mut self, field: i32) -> Result<Option<Arc<dyn SofObject>>> {
        let Some(tag) = self.seek_object(field)? else {
            return Ok(None);
        };
        match tag {
            TYPE_NULL_USER_TYPE => Ok(None),
            type_id if type_id > 0 => self.take_object(type_id).map(Some),
            found => Err(unexpected(field, 0, found)),
        }
    }

    pub fn read_object_as<T: SofObject + SofRead>(&mut self, field: i32) -> Result<Option<T>> {
        let expected = self.config.type_id::<T>()?;
        let Some(tag) = self.seek_object(field)? else {
            return Ok(None);
        };
        match tag {
            TYPE_NULL_USER_TYPE => Ok(None),
            found if found == expected => {
                let body = self.take_body()?;
                T::read_fields(&mut SofReader::new(body, self.config)).map(Some)
            }
            found => Err(unexpected(field, expected, found)),
        }
    }

    /// Null elements are dropped; the result holds only the present values.
    pub fn read_uniform_array<T: SofObject + SofRead>(
        &mut self,
        field: i32,
    ) -> Result<Option<Vec<T>>> {
        let expected = self.config.type_id::<T>()?;
        let Some(tag) = self.seek_object(field)? else {
            return Ok(None);
        };
        match tag {
            TYPE_NULL_USER_TYPE => Ok(None),
            TYPE_UNIFORM_OBJECT_ARRAY => {
                let type_id = self.take::<i32>()?;
                if type_id != expected {
                    return Err(unexpected(field, expected, type_id));
                }
                let count = self.take_count()?;
                let mut values = Vec::with_capacity(count.min(self.input.len() / 4));
                for _ in 0..count {
                    if let Some(len) = self.take_len()? {
                        let body = self.take_slice(len)?;
                        values.push(T::read_fields(&mut SofReader::new(body, self.config))?);
                    }
                }
                Ok(Some(values))
            }
            found => Err(unexpected(field, TYPE_UNIFORM_OBJECT_ARRAY, found)),
        }
    }

    pub fn read_object_array(
        &mut self,
        field: i32,
    ) -> Result<Option<Vec<Option<Arc<dyn SofObject>>>>> {
        let Some(tag) = self.seek_object(field)? else {
            return Ok(None);
        };
        match tag {
            TYPE_NULL_USER_TYPE => Ok(None),
            TYPE_NON_UNIFORM_OBJECT_ARRAY => {
                let count = self.take_count()?;
                let mut values = Vec::with_capacity(count.min(self.input.len() / 4));
                for _ in 0..count {
                    match self.take::<i32>()? {
                        TYPE_NULL_USER_TYPE => values.push(None),
                        type_id => values.push(Some(self.take_object(type_id)?)),
                    }
                }
                Ok(Some(values))
            }
            found => Err(unexpected(field, TYPE_NON_UNIFORM_OBJECT_ARRAY, found)),
        }
    }

    // Position the reader on `field` and return its tag, or None if it is absent.
    fn seek(&mut self, field: i32) -> Result<Option<i32>> {
        loop {
            let header = match self.pending.take() {
                Some(header) => header,
                None if self.input.is_empty() => return Ok(None),
                None => self.take_header()?,
            };
            if header.index == field {
                return Ok(Some(header.tag));
            }
            if header.index > field {
                self.pending = Some(header);
                return Ok(None);
            }
            self.skip_value(header.tag)?;
        }
    }

    fn seek_plain(&mut self, field: i32, micro_tag: i32) -> Result<Option<i32>> {
        if !self.config.is_micro_format() {
            return self.seek(field);
        }
        if self.pending.is_some() {
            return Err(Error::malformed(format!(
                "plain field {field} requested after a header in micro format"
            )));
        }
        if self.input.is_empty() {
            return Ok(None);
        }
        Ok(Some(micro_tag))
    }

    fn seek_object(&mut self, field: i32) -> Result<Option<i32>> {
        if !self.config.is_micro_format() {
            return self.seek(field);
        }
        let header = match self.pending.take() {
            Some(header) => header,
            None if self.input.is_empty() => return Ok(None),
            None => self.take_header()?,
        };
        if header.index == field {
            return Ok(Some(header.tag));
        }
        if header.index > field {
            self.pending = Some(header);
            return Ok(None);
        }
        Err(Error::malformed(format!(
            "field {} cannot be skipped in micro format",
            header.index
        )))
    }

    fn skip_value(&mut self, tag: i32) -> Result<()> {
        match tag {
            TYPE_BYTE | TYPE_BOOLEAN => self.skip(1),
            TYPE_INT | TYPE_SHORT | TYPE_FLOAT | TYPE_CHAR => self.skip(4),
            TYPE_LONG | TYPE_DOUBLE => self.skip(8),
            TYPE_UTF8 | TYPE_BYTE_ARRAY => {
                let len = self.take_len()?.unwrap_or(0);
                self.skip(len)
            }
            TYPE_UTF8_ARRAY => {
                if let Some(count) = self.take_len()? {
                    for _ in 0..count {
                        let len = self.take_len()?.unwrap_or(0);
                        self.skip(len)?;
                    }
                }
                Ok(())
            }
            TYPE_NULL_USER_TYPE => Ok(()),
            TYPE_BYTE_OBJECT | TYPE_BOOLEAN_OBJECT => self.skip_nullable(1),
            TYPE_INT_OBJECT | TYPE_SHORT_OBJECT | TYPE_FLOAT_OBJECT | TYPE_CHARACTER_OBJECT => {
                self.skip_nullable(4)
            }
            TYPE_LONG_OBJECT | TYPE_DOUBLE_OBJECT | TYPE_DATE_OBJECT => self.skip_nullable(8),
            // unscaled value plus scale
            TYPE_BIGDECIMAL_OBJECT => self.skip_nullable(12),
            TYPE_UNIFORM_OBJECT_ARRAY => {
                self.skip(4)?;
                for _ in 0..self.take_count()? {
                    if let Some(len) = self.take_len()? {
                        self.skip(len)?;
                    }
                }
                Ok(())
            }
            TYPE_NON_UNIFORM_OBJECT_ARRAY => {
                for _ in 0..self.take_count()? {
                    if self.take::<i32>()? != TYPE_NULL_USER_TYPE {
                        self.take_body()?;
                    }
                }
                Ok(())
            }
            user_type if user_type > 0 => self.take_body().map(|_| ()),
            unknown => Err(Error::malformed(format!("unknown type tag {unknown}"))),
        }
    }

    fn take_object(&mut self, type_id: i32) -> Result<Arc<dyn SofObject>> {
        let body = self.take_body()?;
        let mut nested = SofReader::new(body, self.config);
        self.config.decode(type_id, body.len(), &mut nested)
    }

    fn take_header(&mut self) -> Result<Header> {
        ensure(self.input, 8)?;
        Ok(Header {
            index: self.input.get_i32(),
            tag: self.input.get_i32(),
        })
    }

    fn take<T: Primitive>(&mut self) -> Result<T> {
        T::take(&mut self.input)
    }

    fn take_nullable<T: Primitive>(&mut self) -> Result<Option<T>> {
        match self.take::<i8>()? as u8 {
            NOT_NULL => self.take().map(Some),
            NULL => Ok(None),
            flag => Err(Error::malformed(format!("bad null flag {flag}"))),
        }
    }

    fn skip_nullable(&mut self, width: usize) -> Result<()> {
        match self.take::<i8>()? as u8 {
            NOT_NULL => self.skip(width),
            NULL => Ok(()),
            flag => Err(Error::malformed(format!("bad null flag {flag}"))),
        }
    }

    fn take_string(&mut self) -> Result<Option<String>> {
        let Some(len) = self.take_len()? else {
            return Ok(None);
        };
        let raw = self.take_slice(len)?;
        let value = std::str::from_utf8(raw)
            .map_err(|err| Error::malformed(format!("invalid utf-8: {err}")))?;
        Ok(Some(value.to_string()))
    }

    // Length prefix where -1 means null.
    fn take_len(&mut self) -> Result<Option<usize>> {
        match self.take::<i32>()? {
            -1 => Ok(None),
            len => usize::try_from(len)
                .map(Some)
                .map_err(|_| Error::malformed(format!("negative length {len}"))),
        }
    }

    fn take_count(&mut self) -> Result<usize> {
        self.take_len()?
            .ok_or_else(|| Error::malformed("null element count"))
    }

    fn take_body(&mut self) -> Result<&'a [u8]> {
        let len = self.take_count()?;
        self.take_slice(len)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure(self.input, len)?;
        let input = self.input;
        let (head, tail) = input.split_at(len);
        self.input = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.take_slice(len).map(|_| ())
    }
}

fn unexpected(field: i32, expected: i32, found: i32) -> Error {
    Error::UnexpectedType {
        field,
        expected,
        found,
    }
}

fn from_epoch_millis(millis: i64) -> Result<SystemTime> {
    let offset = Duration::from_millis(millis.unsigned_abs());
    let time = if millis >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    time.ok_or_else(|| Error::malformed(format!("date out of range: {millis}")))
}
