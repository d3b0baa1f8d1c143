//! Packed record buffer codec.
//!
//! Replies to record queries travel as a single packed byte buffer:
//!
//! ```text
//! header:  tag u32 · block_count u32 · offset u32 × count · end tag u32
//! block:   block_len u32 · record payload    (stacked from the buffer END)
//! record:  type_len u16 · type · name_len u16 · name · attr_count u16 · attr*
//! attr:    block_len u32 · attrtype_len u16 · attrtype · value_count u16
//!          · (value_len u32 · value)*
//! ```
//!
//! All integers are fixed-width in the host's native byte order; the format
//! is same-process only, never an interchange format. Blocks grow from the
//! end of the buffer while the offset table grows from the front, so a
//! buffer is full when the two would meet.
//!
//! [`writer`] packs, [`cursor`] provides offset-indexed random access with
//! mandatory bounds checks: no length field is trusted before verifying it
//! fits the remaining buffer.

pub mod cursor;
pub mod writer;

pub use cursor::{AttributeEntryInfo, RecordEntryInfo, ResultReader};
pub use writer::{ResultBuffer, encode_record};

use thiserror::Error;

/// Buffer tag identifying a packed record-stream buffer.
pub const BUFFER_TAG: u32 = u32::from_ne_bytes(*b"RecA");
/// Trailer written after the offset table.
pub const END_TAG: u32 = u32::from_ne_bytes(*b"EndR");

/// Codec-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The destination buffer cannot take another block.
    #[error("output buffer full")]
    BufferFull,

    /// A declared length points past the end of the buffer.
    #[error("malformed packed buffer")]
    Malformed,

    /// Record/attribute/value index outside the packed counts.
    #[error("entry index out of range")]
    IndexOutOfRange,
}

pub type WireResult<T> = std::result::Result<T, WireError>;
