// Inverted fingerprint index
//
// Maps audio sub-hashes and 16-bit visual hash chunks back to the items and
// positions they occur at. Matching only ever talks to the trait, so the
// backing store can change without touching the matcher.

pub mod sqlite;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use sqlite::SqliteFingerprintIndex;

/// An audio sub-hash occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioHit {
    pub item_id: i64,
    pub offset: i64,
}

/// A visual hash whose chunk matched the lookup value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualHit {
    pub item_id: i64,
    pub frame_offset: i64,
    pub full_hash: u64,
}

pub trait FingerprintIndex: Send + Sync {
    /// One row per (sub_hash, item, position). Replaces earlier audio rows of the item.
    fn insert_audio_fingerprints(&self, item_id: i64, sub_hashes: &[i32]) -> Result<()>;

    /// Four rows per hash, one per chunk. Replaces earlier visual rows of the item.
    fn insert_visual_fingerprints(&self, item_id: i64, hashes: &[u64]) -> Result<()>;

    /// Hits for each requested hash that occurs anywhere. Hashes with no hits are absent.
    fn lookup_audio_hashes(&self, hashes: &[i32]) -> Result<HashMap<i32, Vec<AudioHit>>>;

    /// Hits whose chunk at `chunk_index` equals any of `chunk_values`.
    fn lookup_visual_chunks(&self, chunk_values: &[u16], chunk_index: usize) -> Result<Vec<VisualHit>>;

    fn delete_item_fingerprints(&self, item_id: i64) -> Result<()>;

    fn health(&self) -> Result<()>;
}
