//! Positional decoding over a frame payload.

use bytes::Buf;

use crate::error::{ProtocolError, Result};
use crate::types::{timestamp_to_datetime, Meter, SoftwareVersion};

use chrono::{DateTime, Utc};

/// Reader over a payload slice. Every read checks the remaining length first
/// and fails the frame as malformed rather than reading past the end.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::Malformed(format!(
                "need {n} bytes at offset {}, {} remaining",
                self.offset,
                self.remaining()
            )));
        }
        let chunk = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(chunk)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?.get_u8())
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?.get_i8())
    }

    /// Any non-zero byte is `true`.
    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(self.take(2)?.get_u16())
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.take(2)?.get_i16())
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.take(4)?.get_i32())
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(self.take(8)?.get_i64())
    }

    pub fn timestamp(&mut self) -> Result<DateTime<Utc>> {
        self.u32().map(timestamp_to_datetime)
    }

    /// A meter in the shape of the negotiated version: a bare id under
    /// version 1, connection type and id otherwise.
    pub fn meter(&mut self, version: u32) -> Result<Meter> {
        if version == 1 {
            Ok(Meter::legacy(self.i64()?))
        } else {
            self.meter_with_type()
        }
    }

    /// A meter with its connection type, regardless of version.
    pub fn meter_with_type(&mut self) -> Result<Meter> {
        let connection_type = self.i8()?;
        let id = self.i64()?;
        Ok(Meter::new(connection_type, id))
    }

    /// A fixed-width Latin-1 string, cut at the first NUL.
    pub fn fixed_str(&mut self, width: usize) -> Result<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(raw[..end].iter().map(|&b| char::from(b)).collect())
    }

    pub fn software_version(&mut self) -> Result<SoftwareVersion> {
        Ok(SoftwareVersion {
            major: self.u8()?,
            minor: self.u8()?,
            revision: self.u8()?,
            extra: self.fixed_str(SoftwareVersion::EXTRA_LEN)?,
        })
    }

    /// Read `count` items of at least `item_size` bytes each.
    ///
    /// The minimum total size is checked before anything is allocated, so a
    /// hostile count cannot force a large allocation.
    pub fn read_list<T>(
        &mut self,
        count: usize,
        item_size: usize,
        mut read_item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let needed = count.checked_mul(item_size).ok_or_else(|| {
            ProtocolError::Malformed(format!("list of {count} items overflows"))
        })?;
        if needed > self.remaining() {
            return Err(ProtocolError::Malformed(format!(
                "list of {count} items needs at least {needed} bytes at offset {}, {} remaining",
                self.offset,
                self.remaining()
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read_item(self)?);
        }
        Ok(items)
    }

    /// Raw bytes: `len` of them, or everything left when `len` is `None`.
    pub fn raw(&mut self, len: Option<usize>) -> Result<&'a [u8]> {
        let n = len.unwrap_or_else(|| self.remaining());
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_offset() {
        let data = [0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFE, 0x07];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.u16().unwrap(), 1);
        assert_eq!(reader.i32().unwrap(), -2);
        assert_eq!(reader.offset(), 6);
        assert_eq!(reader.u8().unwrap(), 7);
        assert!(reader.is_empty());
    }

    #[test]
    fn reading_past_end_is_malformed() {
        let data = [0x00, 0x01];
        let mut reader = BufferReader::new(&data);
        assert!(matches!(reader.u32(), Err(ProtocolError::Malformed(_))));
        // failed read does not consume
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn meters_branch_on_version() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44];
        let meter = BufferReader::new(&data).meter(1).unwrap();
        assert_eq!(meter, Meter::legacy(0xAABB_CCDD_1122_3344_u64 as i64));

        let data = [0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44];
        let meter = BufferReader::new(&data).meter(2).unwrap();
        assert_eq!(meter, Meter::new(1, 0xAABB_CCDD_1122_3344_u64 as i64));
    }

    #[test]
    fn fixed_str_stops_at_nul() {
        let mut data = [0u8; 12];
        data[..3].copy_from_slice(b"rc1");
        data[5] = b'x';
        assert_eq!(BufferReader::new(&data).fixed_str(12).unwrap(), "rc1");
    }

    #[test]
    fn list_count_checked_before_allocation() {
        let data = [0u8; 16];
        let mut reader = BufferReader::new(&data);
        let err = reader
            .read_list(usize::MAX / 2, 9, |r| r.u8())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(reader.offset(), 0);

        let items = reader.read_list(4, 4, |r| r.u32()).unwrap();
        assert_eq!(items, vec![0, 0, 0, 0]);
    }

    #[test]
    fn raw_to_end_or_by_length() {
        let data = [1, 2, 3, 4, 5];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.raw(Some(2)).unwrap(), &[1, 2]);
        assert_eq!(reader.raw(None).unwrap(), &[3, 4, 5]);
        assert!(reader.raw(Some(1)).is_err());
        assert_eq!(reader.raw(None).unwrap(), &[] as &[u8]);
    }
}
