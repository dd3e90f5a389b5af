//! Bit buffer with a read cursor
//!
//! A `BitBuffer` holds one fetched batch: an ordered sequence of 0/1 values
//! that is immutable once filled, plus a cursor marking how far consumers
//! have read. The cache keeps two of these slots (active and standby) and
//! swaps them when the active one runs dry.

/// One batch of bits plus a read cursor
#[derive(Debug, Default)]
pub struct BitBuffer {
    bits: Vec<u8>,
    cursor: usize,
}

impl BitBuffer {
    /// Create an empty buffer with nothing to serve
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a buffer over a freshly fetched batch
    pub fn filled(bits: Vec<u8>) -> Self {
        Self { bits, cursor: 0 }
    }

    /// Number of bits not yet served
    pub fn remaining(&self) -> usize {
        self.bits.len() - self.cursor
    }

    /// True once every bit has been served
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.bits.len()
    }

    /// Serve the next bit and advance the cursor
    pub fn next_bit(&mut self) -> Option<u8> {
        let bit = self.bits.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(bit)
    }

    /// Total batch length
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Current cursor position
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
