//! Splitting of byte ranges into the 512-byte blocks the card transfers.

use crate::consts::{BLOCK_BITS, BLOCK_OFFSET_MASK, BLOCK_SIZE};

/// Count of blocks touched by `len` bytes starting at `address`, zero for an empty range.
pub fn block_count(address: u64, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }

    let last = (u128::from(address) + u128::from(len) - 1) >> BLOCK_BITS;
    (last - u128::from(address >> BLOCK_BITS) + 1) as u64
}

/// Part of a request that falls into one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Block number on the card.
    pub block: u64,
    /// First byte of the block covered by the request.
    pub offset: usize,
    /// Bytes of the block covered by the request.
    pub len: usize,
    /// Position of the segment inside the caller's buffer.
    pub data_offset: usize,
}

impl Segment {
    /// Whether the request covers the whole block.
    pub fn is_full(&self) -> bool {
        self.offset == 0 && self.len == BLOCK_SIZE
    }

    /// Range of the caller's buffer that maps onto this segment.
    pub fn data_range(&self) -> core::ops::Range<usize> {
        self.data_offset..self.data_offset + self.len
    }

    /// Range of the block that maps onto this segment.
    pub fn block_range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Iterator over the [`Segment`]s of a request, in address order.
#[derive(Debug, Clone)]
pub struct Segments {
    address: u64,
    len: u64,
    index: u64,
    count: u64,
    data_offset: usize,
}

impl Segments {
    /// Segments of `len` bytes starting at `address`, none for an empty range.
    pub fn new(address: u64, len: u64) -> Self {
        Segments {
            address,
            len,
            index: 0,
            count: block_count(address, len),
            data_offset: 0,
        }
    }

    /// Count of blocks in the request.
    pub fn blocks(&self) -> u64 {
        self.count
    }

    /// First block, `Some` only if the request covers it partially.
    pub fn partial_first(&self) -> Option<Segment> {
        Segments::new(self.address, self.len)
            .next()
            .filter(|s| !s.is_full())
    }

    /// Last block, `Some` only if it is partially covered and differs from the first one.
    pub fn partial_last(&self) -> Option<Segment> {
        if self.count < 2 {
            return None;
        }

        Segments::new(self.address, self.len)
            .last()
            .filter(|s| !s.is_full())
    }
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index == self.count {
            return None;
        }

        let offset = if self.index == 0 {
            (self.address & BLOCK_OFFSET_MASK) as usize
        } else {
            0
        };
        let len = if self.index == self.count - 1 {
            ((self.address + self.len - 1) & BLOCK_OFFSET_MASK) as usize - offset + 1
        } else {
            BLOCK_SIZE - offset
        };

        let segment = Segment {
            block: (self.address >> BLOCK_BITS) + self.index,
            offset,
            len,
            data_offset: self.data_offset,
        };

        self.index += 1;
        self.data_offset += len;

        Some(segment)
    }
}
