//! Packing side of the wire codec.

use crate::model::types::Record;
use crate::wire::{BUFFER_TAG, END_TAG, WireError, WireResult};

/// Append-only byte builder for one record block.
///
/// Nothing here checks capacity; blocks are built in full and then offered
/// to a [`ResultBuffer`], which is where the caller's buffer size is
/// enforced.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode one record into a block payload (without the leading block_len).
///
/// With `attrs_only` set, attribute types are packed but value counts are
/// written as zero and values are omitted.
pub fn encode_record(record: &Record, attrs_only: bool) -> Vec<u8> {
    let mut rec = BlockBuilder::new();
    let mut attrs = BlockBuilder::new();
    let mut tmp = BlockBuilder::new();

    rec.append_u16(record.rec_type.len() as u16);
    rec.append_str(&record.rec_type);
    rec.append_u16(record.name.len() as u16);
    rec.append_str(&record.name);
    rec.append_u16(record.attributes.len() as u16);

    for attr in &record.attributes {
        tmp.clear();
        tmp.append_u16(attr.attr_type.len() as u16);
        tmp.append_str(&attr.attr_type);
        if attrs_only {
            tmp.append_u16(0);
        } else {
            tmp.append_u16(attr.values.len() as u16);
            for value in &attr.values {
                tmp.append_u32(value.len() as u32);
                tmp.append_bytes(value);
            }
        }
        attrs.append_u32(tmp.len() as u32);
        attrs.append_bytes(tmp.as_bytes());
    }

    rec.append_bytes(attrs.as_bytes());
    rec.into_bytes()
}

/// A caller-sized output buffer being filled with record blocks.
///
/// The header (tag, count, offset table, end tag) lives at the front and
/// grows by one offset per block; block data is stacked from the end of the
/// buffer, so previously written offsets stay valid as blocks are added.
#[derive(Debug)]
pub struct ResultBuffer {
    data: Vec<u8>,
    offsets: Vec<u32>,
    /// First byte of the data region (blocks occupy `tail..capacity`).
    tail: usize,
}

impl ResultBuffer {
    /// A buffer must at least hold the fixed header.
    pub const MIN_CAPACITY: usize = 12;

    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(Self::MIN_CAPACITY)],
            offsets: Vec::new(),
            tail: capacity.max(Self::MIN_CAPACITY),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn block_count(&self) -> u32 {
        self.offsets.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Bytes the header will occupy if one more block is added.
    fn header_size_with(&self, extra_blocks: usize) -> usize {
        // tag + count + offsets + end tag
        8 + 4 * (self.offsets.len() + extra_blocks) + 4
    }

    /// Room left for one more block payload (excluding its length prefix).
    pub fn remaining(&self) -> usize {
        self.tail
            .saturating_sub(self.header_size_with(1))
            .saturating_sub(4)
    }

    /// Append one encoded record block. Fails with [`WireError::BufferFull`]
    /// when the block plus its offset-table slot no longer fits; the buffer
    /// is left unchanged in that case.
    pub fn add_block(&mut self, payload: &[u8]) -> WireResult<()> {
        let needed = 4 + payload.len();
        if self.header_size_with(1) + needed > self.tail {
            return Err(WireError::BufferFull);
        }
        let start = self.tail - needed;
        self.data[start..start + 4].copy_from_slice(&(payload.len() as u32).to_ne_bytes());
        self.data[start + 4..start + 4 + payload.len()].copy_from_slice(payload);
        self.tail = start;
        self.offsets.push(start as u32);
        Ok(())
    }

    /// Append several blocks all-or-nothing: either every payload fits
    /// (with its offset slot) or the buffer is left untouched. Used where
    /// a half-committed group would be re-emitted on resumption.
    pub fn try_add_blocks(&mut self, payloads: &[Vec<u8>]) -> WireResult<()> {
        let needed: usize = payloads.iter().map(|p| 4 + p.len()).sum();
        if self.header_size_with(payloads.len()) + needed > self.tail {
            return Err(WireError::BufferFull);
        }
        for payload in payloads {
            self.add_block(payload)
                .expect("capacity verified for the whole group");
        }
        Ok(())
    }

    /// Finalize the header and return the packed buffer (full capacity;
    /// the gap between header and data region is zeroed).
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data[0..4].copy_from_slice(&BUFFER_TAG.to_ne_bytes());
        self.data[4..8].copy_from_slice(&(self.offsets.len() as u32).to_ne_bytes());
        let mut pos = 8;
        for off in &self.offsets {
            self.data[pos..pos + 4].copy_from_slice(&off.to_ne_bytes());
            pos += 4;
        }
        self.data[pos..pos + 4].copy_from_slice(&END_TAG.to_ne_bytes());
        self.data
    }
}
