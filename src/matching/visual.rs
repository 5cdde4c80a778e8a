// Visual matching over 64-bit difference hashes
//
// Candidate hits come from exact 16-bit chunk lookups (one per chunk
// index) and are verified with the full Hamming distance before voting.

use std::collections::{BTreeSet, HashMap};

use crate::constants::VISUAL_CHUNK_COUNT;
use crate::db::schema::DuplicationConfig;
use crate::error::Result;
use crate::fingerprint::{chunk, hamming_distance};
use crate::index::{FingerprintIndex, VisualHit};

use super::{AlignmentGates, AlignmentVotes, MatchResult, MatchType};

pub fn find_visual_matches(
    index: &dyn FingerprintIndex,
    item_id: i64,
    fingerprint: &[u64],
    config: &DuplicationConfig,
) -> Result<Vec<MatchResult>> {
    if fingerprint.is_empty() {
        return Ok(Vec::new());
    }
    let mut hits_by_chunk: Vec<Vec<VisualHit>> = Vec::with_capacity(VISUAL_CHUNK_COUNT);
    for chunk_index in 0..VISUAL_CHUNK_COUNT {
        let values: Vec<u16> = fingerprint
            .iter()
            .map(|h| chunk(*h, chunk_index))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        hits_by_chunk.push(index.lookup_visual_chunks(&values, chunk_index)?);
    }

    let matches = align_visual(
        item_id,
        fingerprint,
        &hits_by_chunk,
        &config.visual_gates(),
        config.visual_hamming_max,
    );
    log::debug!(
        "Item {}: {} visual hashes, {} chunk hits, {} matches",
        item_id,
        fingerprint.len(),
        hits_by_chunk.iter().map(Vec::len).sum::<usize>(),
        matches.len()
    );
    Ok(matches)
}

/// `hits_by_chunk[k]` holds the lookup results for chunk index `k`.
pub fn align_visual(
    query_item: i64,
    fingerprint: &[u64],
    hits_by_chunk: &[Vec<VisualHit>],
    gates: &AlignmentGates,
    hamming_max: u32,
) -> Vec<MatchResult> {
    let mut votes = AlignmentVotes::new(gates.delta_tolerance);

    for (chunk_index, hits) in hits_by_chunk.iter().enumerate() {
        // chunk value -> query frame positions carrying it
        let mut positions: HashMap<u16, Vec<usize>> = HashMap::new();
        for (i, hash) in fingerprint.iter().enumerate() {
            positions.entry(chunk(*hash, chunk_index)).or_default().push(i);
        }

        for hit in hits {
            if hit.item_id == query_item {
                continue;
            }
            let Some(query_positions) = positions.get(&chunk(hit.full_hash, chunk_index)) else {
                continue;
            };
            for &i in query_positions {
                if hamming_distance(fingerprint[i], hit.full_hash) <= hamming_max {
                    votes.vote(hit.item_id, i as i64, hit.frame_offset);
                }
            }
        }
    }
    votes.into_matches(gates, MatchType::Visual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteFingerprintIndex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn flip_bits(rng: &mut StdRng, hash: u64, n: usize) -> u64 {
        let mut out = hash;
        let mut flipped = Vec::new();
        while flipped.len() < n {
            let bit = rng.gen_range(0..64);
            if !flipped.contains(&bit) {
                flipped.push(bit);
                out ^= 1u64 << bit;
            }
        }
        out
    }

    #[test]
    fn test_reencoded_copy_matches() {
        let mut rng = StdRng::seed_from_u64(11);
        let original: Vec<u64> = (0..120).map(|_| rng.gen()).collect();
        // Trimmed by 10 frames at the start, a couple of bits of noise per frame
        let copy: Vec<u64> = original[10..].iter().map(|h| flip_bits(&mut rng, *h, 2)).collect();

        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        index.insert_visual_fingerprints(2, &original).unwrap();

        let config = DuplicationConfig::default();
        let matches = find_visual_matches(&index, 1, &copy, &config).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate, 2);
        assert_eq!(matches[0].match_type, MatchType::Visual);
        assert!(matches[0].confidence > 0.95);
    }

    #[test]
    fn test_hamming_verification_rejects_chunk_collisions() {
        let mut rng = StdRng::seed_from_u64(12);
        let query: Vec<u64> = (0..60).map(|_| rng.gen()).collect();
        // Same low chunk, everything else scrambled
        let other: Vec<u64> = query.iter().map(|h| (h & 0xFFFF) | (rng.gen::<u64>() << 16)).collect();

        let hits: Vec<VisualHit> = other
            .iter()
            .enumerate()
            .map(|(i, h)| VisualHit { item_id: 2, frame_offset: i as i64, full_hash: *h })
            .collect();
        let config = DuplicationConfig::default();
        let matches = align_visual(1, &query, &[hits, vec![], vec![], vec![]], &config.visual_gates(), 5);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_unrelated_items_do_not_match() {
        let mut rng = StdRng::seed_from_u64(13);
        let a: Vec<u64> = (0..100).map(|_| rng.gen()).collect();
        let b: Vec<u64> = (0..100).map(|_| rng.gen()).collect();
        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        index.insert_visual_fingerprints(2, &b).unwrap();
        let matches = find_visual_matches(&index, 1, &a, &DuplicationConfig::default()).unwrap();
        assert!(matches.is_empty());
    }
}
