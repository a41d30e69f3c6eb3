//! Log pointers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of one record in the log.
///
/// A pointer is the triple `(segment_index, file_offset, length)`. The
/// segment index is absolute and never reused; the offset is byte-exact
/// within the segment. Pointers order lexicographically by
/// `(segment_index, file_offset)`, which equals append order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WalPointer {
    segment_index: u64,
    file_offset: u32,
    length: u32,
}

impl WalPointer {
    pub fn new(segment_index: u64, file_offset: u32, length: u32) -> Self {
        Self {
            segment_index,
            file_offset,
            length,
        }
    }

    /// Absolute index of the segment containing the record.
    pub fn segment_index(&self) -> u64 {
        self.segment_index
    }

    /// Byte offset of the record within its segment.
    pub fn file_offset(&self) -> u32 {
        self.file_offset
    }

    /// Encoded length of the record in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Offset of the first byte past the record.
    pub fn end_offset(&self) -> u32 {
        self.file_offset + self.length
    }
}

impl fmt::Display for WalPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.segment_index, self.file_offset, self.length
        )
    }
}
