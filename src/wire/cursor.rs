//! Decoding side of the wire codec: a bounds-checked cursor plus the
//! entry/value accessors that walk a packed buffer from caller-held offsets.
//!
//! Every multi-byte read and every skip goes through [`Cursor`], which
//! refuses to move past the end of its slice. A declared length is only
//! honored after checking that `header + length` still fits; anything else
//! is a malformed buffer, reported as an error and never read past.

use crate::wire::{BUFFER_TAG, WireError, WireResult};

/// Bounds-checked reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor over `buf` starting at `pos`; fails if `pos` is already out.
    pub fn at(buf: &'a [u8], pos: usize) -> WireResult<Self> {
        if pos > buf.len() {
            return Err(WireError::Malformed);
        }
        Ok(Self { buf, pos })
    }

    /// Restrict the readable range to `pos + len`; used once a block
    /// declares its own length so later fields cannot escape the block.
    pub fn limit(&self, len: usize) -> WireResult<Cursor<'a>> {
        let end = self.pos.checked_add(len).ok_or(WireError::Malformed)?;
        if end > self.buf.len() {
            return Err(WireError::Malformed);
        }
        Ok(Cursor {
            buf: &self.buf[..end],
            pos: self.pos,
        })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u16(&mut self) -> WireResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_ne_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        self.take(len)
    }

    pub fn skip(&mut self, len: usize) -> WireResult<()> {
        self.take(len).map(|_| ())
    }

    fn take(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(WireError::Malformed)?;
        if end > self.buf.len() {
            return Err(WireError::Malformed);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

/// Header view over a packed result buffer.
#[derive(Debug)]
pub struct ResultReader<'a> {
    buf: &'a [u8],
    count: u32,
}

impl<'a> ResultReader<'a> {
    pub fn new(buf: &'a [u8]) -> WireResult<Self> {
        let mut cur = Cursor::new(buf);
        if cur.read_u32()? != BUFFER_TAG {
            return Err(WireError::Malformed);
        }
        let count = cur.read_u32()?;
        // Offset table + end tag must fit the buffer.
        cur.skip((count as usize).checked_mul(4).ok_or(WireError::Malformed)? + 4)?;
        Ok(Self { buf, count })
    }

    pub fn block_count(&self) -> u32 {
        self.count
    }

    /// Byte offset of block `index` (1-based, matching entry indices on the
    /// client API). The offset points at the block's u32 length prefix.
    pub fn block_offset(&self, index: u32) -> WireResult<usize> {
        if index == 0 || index > self.count {
            return Err(WireError::IndexOutOfRange);
        }
        let mut cur = Cursor::at(self.buf, 8 + 4 * (index as usize - 1))?;
        let off = cur.read_u32()? as usize;
        // The prefix itself must be readable at the declared position.
        if off + 4 > self.buf.len() {
            return Err(WireError::Malformed);
        }
        Ok(off)
    }
}

/// Decoded fixed fields of one packed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntryInfo {
    pub rec_type: String,
    pub name: String,
    pub attr_count: u16,
    /// Offset of the record's attribute count field; hand this to
    /// [`attribute_entry`] as the attribute-list cursor.
    pub attr_list_offset: usize,
}

/// Decoded fixed fields of one packed attribute block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntryInfo {
    pub attr_type: String,
    pub value_count: u16,
    /// Total bytes across all values of this attribute.
    pub total_value_size: usize,
    /// Offset of this attribute block's u32 length prefix; hand this to
    /// [`attribute_value`] as the value-list cursor.
    pub value_list_offset: usize,
}

/// Decode record `index` (1-based) from a packed buffer.
pub fn record_entry(buf: &[u8], index: u32) -> WireResult<RecordEntryInfo> {
    let reader = ResultReader::new(buf)?;
    let offset = reader.block_offset(index)?;

    let mut cur = Cursor::at(buf, offset)?;
    let block_len = cur.read_u32()? as usize;
    let mut cur = cur.limit(block_len)?;

    let type_len = cur.read_u16()? as usize;
    let rec_type = String::from_utf8_lossy(cur.read_bytes(type_len)?).into_owned();
    let name_len = cur.read_u16()? as usize;
    let name = String::from_utf8_lossy(cur.read_bytes(name_len)?).into_owned();
    let attr_list_offset = cur.position();
    let attr_count = cur.read_u16()?;

    Ok(RecordEntryInfo {
        rec_type,
        name,
        attr_count,
        attr_list_offset,
    })
}

/// Decode attribute `index` (1-based) of the attribute list starting at
/// `offset` (a [`RecordEntryInfo::attr_list_offset`]).
pub fn attribute_entry(buf: &[u8], offset: usize, index: u32) -> WireResult<AttributeEntryInfo> {
    let mut cur = Cursor::at(buf, offset)?;
    let attr_count = cur.read_u16()?;
    if index == 0 || index > u32::from(attr_count) {
        return Err(WireError::IndexOutOfRange);
    }

    // Skip preceding attribute blocks without decoding them.
    for _ in 1..index {
        let len = cur.read_u32()? as usize;
        cur.skip(len)?;
    }

    let value_list_offset = cur.position();
    let block_len = cur.read_u32()? as usize;
    let mut cur = cur.limit(block_len)?;

    let type_len = cur.read_u16()? as usize;
    let attr_type = String::from_utf8_lossy(cur.read_bytes(type_len)?).into_owned();
    let value_count = cur.read_u16()?;

    let mut total_value_size = 0usize;
    for _ in 0..value_count {
        let len = cur.read_u32()? as usize;
        cur.skip(len)?;
        total_value_size += len;
    }

    Ok(AttributeEntryInfo {
        attr_type,
        value_count,
        total_value_size,
        value_list_offset,
    })
}

/// Decode value `index` (1-based) of the attribute block starting at
/// `offset` (an [`AttributeEntryInfo::value_list_offset`]).
pub fn attribute_value(buf: &[u8], offset: usize, index: u32) -> WireResult<Vec<u8>> {
    let mut cur = Cursor::at(buf, offset)?;
    let block_len = cur.read_u32()? as usize;
    let mut cur = cur.limit(block_len)?;

    let type_len = cur.read_u16()? as usize;
    cur.skip(type_len)?;
    let value_count = cur.read_u16()?;
    if index == 0 || index > u32::from(value_count) {
        return Err(WireError::IndexOutOfRange);
    }

    for _ in 1..index {
        let len = cur.read_u32()? as usize;
        cur.skip(len)?;
    }

    let len = cur.read_u32()? as usize;
    Ok(cur.read_bytes(len)?.to_vec())
}
