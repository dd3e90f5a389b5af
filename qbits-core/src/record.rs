//! Data records exchanged through the persistence pipeline
//!
//! The proxy appends [`BitRecord`]s to JSON spool files; the uploader reads
//! them back and ships either the raw records or [`WordRecord`]s with 32
//! bits packed per entry. Both programs must agree on these shapes, so they
//! live here rather than in either binary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of bits packed into one [`WordRecord`]
pub const WORD_BITS: usize = 32;

/// One captured bit with its delivery timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitRecord {
    pub timestamp: DateTime<Utc>,
    pub bit: u8,
}

impl BitRecord {
    pub fn new(timestamp: DateTime<Utc>, bit: u8) -> Self {
        Self { timestamp, bit }
    }
}

/// 32 bits packed MSB-first, stamped with the first bit's unix time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordRecord {
    pub timestamp: i64,
    pub word: u32,
}

/// Pack bit records into words, MSB first
///
/// Returns the complete words plus the sub-word remainder, which the caller
/// must keep pending rather than drop.
pub fn pack_words(records: Vec<BitRecord>) -> (Vec<WordRecord>, Vec<BitRecord>) {
    let chunks = records.chunks_exact(WORD_BITS);
    let remainder = chunks.remainder().to_vec();

    let words = chunks
        .map(|chunk| WordRecord {
            timestamp: chunk[0].timestamp.timestamp(),
            word: bits_to_word(chunk),
        })
        .collect();

    (words, remainder)
}

fn bits_to_word(chunk: &[BitRecord]) -> u32 {
    chunk.iter().enumerate().fold(0u32, |word, (i, record)| {
        if record.bit == 1 {
            word | (1 << (WORD_BITS - 1 - i))
        } else {
            word
        }
    })
}
