// Audio matching over chromaprint sub-hashes

use std::collections::{HashMap, HashSet};

use crate::db::schema::DuplicationConfig;
use crate::error::Result;
use crate::index::{AudioHit, FingerprintIndex};

use super::{AlignmentGates, AlignmentVotes, MatchResult, MatchType};

/// Look the query fingerprint up in the index and align the hits.
pub fn find_audio_matches(
    index: &dyn FingerprintIndex,
    item_id: i64,
    fingerprint: &[i32],
    config: &DuplicationConfig,
) -> Result<Vec<MatchResult>> {
    if fingerprint.is_empty() {
        return Ok(Vec::new());
    }
    let mut distinct: Vec<i32> = fingerprint.iter().copied().collect::<HashSet<_>>().into_iter().collect();
    distinct.sort_unstable();

    let hits = index.lookup_audio_hashes(&distinct)?;
    let matches = align_audio(item_id, fingerprint, &hits, &config.audio_gates(), config.audio_max_scene_freq);
    log::debug!(
        "Item {}: {} audio sub-hashes, {} with hits, {} matches",
        item_id,
        fingerprint.len(),
        hits.len(),
        matches.len()
    );
    Ok(matches)
}

/// Hashes present in more than `max_scene_freq` distinct items other than
/// the query. A cutoff of 0 disables the filter.
pub fn popular_hashes(
    query_item: i64,
    hits: &HashMap<i32, Vec<AudioHit>>,
    max_scene_freq: i64,
) -> HashSet<i32> {
    if max_scene_freq <= 0 {
        return HashSet::new();
    }
    hits.iter()
        .filter(|(_, occurrences)| {
            let items: HashSet<i64> = occurrences
                .iter()
                .map(|h| h.item_id)
                .filter(|id| *id != query_item)
                .collect();
            items.len() as i64 > max_scene_freq
        })
        .map(|(hash, _)| *hash)
        .collect()
}

/// Vote every (query position, hit) pair into offset bins and gate the
/// best bin per candidate.
pub fn align_audio(
    query_item: i64,
    fingerprint: &[i32],
    hits: &HashMap<i32, Vec<AudioHit>>,
    gates: &AlignmentGates,
    max_scene_freq: i64,
) -> Vec<MatchResult> {
    let popular = popular_hashes(query_item, hits, max_scene_freq);
    if !popular.is_empty() {
        log::debug!("Item {}: ignoring {} popular sub-hashes", query_item, popular.len());
    }

    let mut votes = AlignmentVotes::new(gates.delta_tolerance);
    for (i, hash) in fingerprint.iter().enumerate() {
        if popular.contains(hash) {
            continue;
        }
        let Some(occurrences) = hits.get(hash) else {
            continue;
        };
        for hit in occurrences {
            if hit.item_id == query_item {
                continue;
            }
            votes.vote(hit.item_id, i as i64, hit.offset);
        }
    }
    votes.into_matches(gates, MatchType::Audio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteFingerprintIndex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_fp(rng: &mut StdRng, len: usize) -> Vec<i32> {
        (0..len).map(|_| rng.gen()).collect()
    }

    fn hits_for(items: &[(i64, &[i32])]) -> HashMap<i32, Vec<AudioHit>> {
        let mut hits: HashMap<i32, Vec<AudioHit>> = HashMap::new();
        for (item_id, fp) in items {
            for (pos, hash) in fp.iter().enumerate() {
                hits.entry(*hash).or_default().push(AudioHit { item_id: *item_id, offset: pos as i64 });
            }
        }
        hits
    }

    #[test]
    fn test_cross_resolution_duplicate() {
        // 30 seconds at ~8 sub-hashes per second shared, rest unrelated
        let mut rng = StdRng::seed_from_u64(2024);
        let a = random_fp(&mut rng, 600);
        let mut b = random_fp(&mut rng, 700);
        b[100..340].copy_from_slice(&a[50..290]);

        let config = DuplicationConfig::default();
        assert_eq!((config.audio_min_hashes, config.audio_min_span), (80, 160));
        assert_eq!(config.audio_density_threshold, 0.50);

        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        index.insert_audio_fingerprints(2, &b).unwrap();
        let a_to_b = find_audio_matches(&index, 1, &a, &config).unwrap();
        assert_eq!(a_to_b.len(), 1);
        assert_eq!(a_to_b[0].candidate, 2);
        assert_eq!(a_to_b[0].match_type, MatchType::Audio);

        index.insert_audio_fingerprints(1, &a).unwrap();
        let b_to_a = find_audio_matches(&index, 2, &b, &config).unwrap();
        assert_eq!(b_to_a.len(), 1);
        assert_eq!(b_to_a[0].candidate, 1);
        assert_eq!(b_to_a[0].match_type, MatchType::Audio);
    }

    #[test]
    fn test_short_overlap_rejected() {
        let mut rng = StdRng::seed_from_u64(5);
        let a = random_fp(&mut rng, 600);
        let mut b = random_fp(&mut rng, 600);
        // 100 aligned hashes: passes the count gate, fails the span gate
        b[200..300].copy_from_slice(&a[0..100]);

        let config = DuplicationConfig::default();
        let hits = hits_for(&[(2, &b)]);
        assert!(align_audio(1, &a, &hits, &config.audio_gates(), 10).is_empty());
    }

    #[test]
    fn test_self_hits_ignored() {
        let mut rng = StdRng::seed_from_u64(8);
        let a = random_fp(&mut rng, 400);
        let hits = hits_for(&[(1, &a)]);
        let config = DuplicationConfig::default();
        assert!(align_audio(1, &a, &hits, &config.audio_gates(), 10).is_empty());
    }

    #[test]
    fn test_popular_hash_suppression() {
        let mut rng = StdRng::seed_from_u64(77);
        let popular: i32 = 0x0BAD_F00D;
        let gates = AlignmentGates {
            min_count: 80,
            min_span: 0,
            density_threshold: 0.5,
            delta_tolerance: 4,
        };

        // Candidate 2 shares 79 aligned positions plus the popular hash at
        // an aligned position: borderline on the count gate.
        let mut query = random_fp(&mut rng, 200);
        let mut candidate = random_fp(&mut rng, 200);
        candidate[10..89].copy_from_slice(&query[0..79]);
        query[79] = popular;
        candidate[89] = popular;

        let mut items: Vec<(i64, Vec<i32>)> = vec![(2, candidate)];
        for id in 10..24 {
            items.push((id, vec![popular]));
        }
        let refs: Vec<(i64, &[i32])> = items.iter().map(|(id, fp)| (*id, fp.as_slice())).collect();
        let hits = hits_for(&refs);
        assert_eq!(hits[&popular].len(), 15);
        assert!(popular_hashes(1, &hits, 10).contains(&popular));

        let with_popular = align_audio(1, &query, &hits, &gates, 10);

        let mut without = query.clone();
        without[79] = rng.gen();
        let without_popular = align_audio(1, &without, &hits, &gates, 10);

        assert_eq!(with_popular.is_empty(), without_popular.is_empty());
        assert!(with_popular.is_empty(), "popular hash must not lift the count to 80");

        // With the filter off the same hash tips the candidate over the gate
        let unfiltered = align_audio(1, &query, &hits, &gates, 0);
        assert_eq!(unfiltered.len(), 1);
        assert_eq!(unfiltered[0].candidate, 2);
    }

    #[test]
    fn test_offset_tolerance_absorbs_jitter() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_fp(&mut rng, 300);
        let mut b = random_fp(&mut rng, 400);
        // Shared region whose offset drifts by one position halfway through
        b[40..140].copy_from_slice(&a[0..100]);
        b[141..241].copy_from_slice(&a[100..200]);

        let hits = hits_for(&[(2, &b)]);
        let gates = AlignmentGates {
            min_count: 80,
            min_span: 160,
            density_threshold: 0.5,
            delta_tolerance: 4,
        };
        let matches = align_audio(1, &a, &hits, &gates, 10);
        assert_eq!(matches.len(), 1);
        assert!(matches[0].confidence > 0.99);
    }
}
