// Fingerprint primitives
//
// Extraction strategy, the 64-bit difference hash, Hamming distance, the
// 16-bit chunk split used for bit-partition lookups, and the little-endian
// blob encoding fingerprints are stored with.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{DHASH_HEIGHT, DHASH_WIDTH, FINGERPRINT_MODE_AUDIO_ONLY, FINGERPRINT_MODE_DUAL, VISUAL_CHUNK_COUNT};
use crate::error::{Result, SiftError};

/// Whether visual fingerprints are taken for items that have audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    AudioOnly,
    Dual,
}

impl FingerprintMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintMode::AudioOnly => FINGERPRINT_MODE_AUDIO_ONLY,
            FingerprintMode::Dual => FINGERPRINT_MODE_DUAL,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            FINGERPRINT_MODE_AUDIO_ONLY => Ok(FingerprintMode::AudioOnly),
            FINGERPRINT_MODE_DUAL => Ok(FingerprintMode::Dual),
            other => Err(SiftError::Invalid(format!("unknown fingerprint mode '{}'", other))),
        }
    }
}

/// Which fingerprints an item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintType {
    Audio,
    Visual,
    Dual,
}

impl FingerprintType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintType::Audio => "audio",
            FingerprintType::Visual => "visual",
            FingerprintType::Dual => "dual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(FingerprintType::Audio),
            "visual" => Ok(FingerprintType::Visual),
            "dual" => Ok(FingerprintType::Dual),
            other => Err(SiftError::Invalid(format!("unknown fingerprint type '{}'", other))),
        }
    }

    /// Label for what was actually extracted. None if nothing was.
    pub fn from_presence(audio: bool, visual: bool) -> Option<Self> {
        match (audio, visual) {
            (true, true) => Some(FingerprintType::Dual),
            (true, false) => Some(FingerprintType::Audio),
            (false, true) => Some(FingerprintType::Visual),
            (false, false) => None,
        }
    }
}

impl fmt::Display for FingerprintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which extractors to run for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionPlan {
    pub audio: bool,
    pub visual: bool,
}

/// Audio runs whenever there is an audio track. Visual runs when there is no
/// audio track or the mode is dual. Never neither.
pub fn extraction_plan(has_audio_track: bool, mode: FingerprintMode) -> ExtractionPlan {
    ExtractionPlan {
        audio: has_audio_track,
        visual: !has_audio_track || mode == FingerprintMode::Dual,
    }
}

/// Bytes in one raw grayscale frame fed to `dhash`.
pub const DHASH_FRAME_BYTES: usize = DHASH_WIDTH * DHASH_HEIGHT;

/// 64-bit difference hash of a 9x8 grayscale frame (row-major).
///
/// Bit order is row-major, most significant bit first: bit 63 is row 0
/// column 0. A bit is set when the left pixel is brighter than its right
/// neighbour.
pub fn dhash(frame: &[u8]) -> Result<u64> {
    if frame.len() != DHASH_FRAME_BYTES {
        return Err(SiftError::Extraction(format!(
            "dhash frame must be {} bytes, got {}",
            DHASH_FRAME_BYTES,
            frame.len()
        )));
    }
    let mut hash = 0u64;
    for row in 0..DHASH_HEIGHT {
        let base = row * DHASH_WIDTH;
        for col in 0..DHASH_WIDTH - 1 {
            hash <<= 1;
            if frame[base + col] > frame[base + col + 1] {
                hash |= 1;
            }
        }
    }
    Ok(hash)
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// The `index`-th 16-bit chunk of a hash, index 0 being the low bits.
pub fn chunk(hash: u64, index: usize) -> u16 {
    ((hash >> (16 * index)) & 0xFFFF) as u16
}

pub fn chunks(hash: u64) -> [u16; VISUAL_CHUNK_COUNT] {
    let mut out = [0u16; VISUAL_CHUNK_COUNT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = chunk(hash, i);
    }
    out
}

// ----- Blob codecs -----

pub fn encode_audio(fp: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fp.len() * 4);
    for v in fp {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_audio(blob: &[u8]) -> Result<Vec<i32>> {
    if blob.len() % 4 != 0 {
        return Err(SiftError::Invalid(format!("audio fingerprint blob has {} bytes", blob.len())));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_visual(fp: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fp.len() * 8);
    for v in fp {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_visual(blob: &[u8]) -> Result<Vec<u64>> {
    if blob.len() % 8 != 0 {
        return Err(SiftError::Invalid(format!("visual fingerprint blob has {} bytes", blob.len())));
    }
    Ok(blob
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_strategy_table() {
        let audio_only = FingerprintMode::AudioOnly;
        let dual = FingerprintMode::Dual;
        assert_eq!(extraction_plan(true, audio_only), ExtractionPlan { audio: true, visual: false });
        assert_eq!(extraction_plan(true, dual), ExtractionPlan { audio: true, visual: true });
        // Silent video is visual-only in both modes
        assert_eq!(extraction_plan(false, audio_only), ExtractionPlan { audio: false, visual: true });
        assert_eq!(extraction_plan(false, dual), ExtractionPlan { audio: false, visual: true });
    }

    #[test]
    fn test_plan_never_empty() {
        for has_audio in [true, false] {
            for mode in [FingerprintMode::AudioOnly, FingerprintMode::Dual] {
                let plan = extraction_plan(has_audio, mode);
                assert!(plan.audio || plan.visual);
            }
        }
    }

    #[test]
    fn test_dhash_gradient() {
        // Every row decreasing left to right: all 64 bits set
        let mut frame = Vec::with_capacity(DHASH_FRAME_BYTES);
        for _ in 0..DHASH_HEIGHT {
            for col in 0..DHASH_WIDTH {
                frame.push((200 - col * 10) as u8);
            }
        }
        assert_eq!(dhash(&frame).unwrap(), u64::MAX);

        // Flat frame: no bit set
        assert_eq!(dhash(&[128u8; DHASH_FRAME_BYTES]).unwrap(), 0);
    }

    #[test]
    fn test_dhash_bit_order() {
        let mut frame = [0u8; DHASH_FRAME_BYTES];
        frame[0] = 255; // row 0, col 0 brighter than col 1
        assert_eq!(dhash(&frame).unwrap(), 1u64 << 63);
    }

    #[test]
    fn test_dhash_wrong_size() {
        assert!(dhash(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_hamming_symmetry() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..1_000 {
            let a: u64 = rng.gen();
            let b: u64 = rng.gen();
            assert_eq!(hamming_distance(a, b), hamming_distance(b, a));
            assert_eq!(hamming_distance(a, a), 0);
        }
        assert_eq!(hamming_distance(0, u64::MAX), 64);
    }

    #[test]
    fn test_chunks_reassemble() {
        let hash = 0x1122_3344_5566_7788u64;
        let c = chunks(hash);
        assert_eq!(c, [0x7788, 0x5566, 0x3344, 0x1122]);
        let rebuilt = c
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, v)| acc | ((*v as u64) << (16 * i)));
        assert_eq!(rebuilt, hash);
    }

    #[test]
    fn test_small_distance_shares_a_chunk() {
        // With at most 3 differing bits, at least one of four chunks is intact
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let a: u64 = rng.gen();
            let mut b = a;
            for _ in 0..3 {
                b ^= 1u64 << rng.gen_range(0..64);
            }
            let shared = (0..VISUAL_CHUNK_COUNT).any(|i| chunk(a, i) == chunk(b, i));
            assert!(shared);
        }
    }

    #[test]
    fn test_blob_codecs() {
        let audio = vec![i32::MIN, -1, 0, 1, i32::MAX];
        assert_eq!(decode_audio(&encode_audio(&audio)).unwrap(), audio);
        let visual = vec![0, u64::MAX, 0xdead_beef];
        assert_eq!(decode_visual(&encode_visual(&visual)).unwrap(), visual);
        assert!(decode_audio(&[1, 2, 3]).is_err());
        assert!(decode_visual(&[0; 12]).is_err());
    }

    #[test]
    fn test_type_labels() {
        assert_eq!(FingerprintType::from_presence(true, true), Some(FingerprintType::Dual));
        assert_eq!(FingerprintType::from_presence(false, true), Some(FingerprintType::Visual));
        assert_eq!(FingerprintType::from_presence(false, false), None);
        assert_eq!(FingerprintType::parse("audio").unwrap(), FingerprintType::Audio);
        assert_eq!(FingerprintMode::parse("dual").unwrap(), FingerprintMode::Dual);
    }
}
