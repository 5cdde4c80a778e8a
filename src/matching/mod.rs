// Diagonal alignment matching
//
// Every hit (query position i, candidate position j) votes for the offset
// delta = j - i. Deltas are quantized into bins of `delta_tolerance` width
// with floor division so bins have uniform width across zero. A candidate
// matches when its best bin holds enough distinct query positions, spread
// over a long enough span, densely enough.

pub mod audio;
pub mod visual;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::schema::DuplicationConfig;
use crate::error::{Result, SiftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Audio,
    Visual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Audio => "audio",
            MatchType::Visual => "visual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MatchType::Audio),
            "visual" => Ok(MatchType::Visual),
            other => Err(SiftError::Invalid(format!("unknown match type '{}'", other))),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub candidate: i64,
    /// Density of the winning alignment, 0.0 to 1.0
    pub confidence: f64,
    pub match_type: MatchType,
}

/// Thresholds applied to a candidate's best alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentGates {
    /// Distinct query positions required
    pub min_count: i64,
    /// Minimum max-min+1 of those positions; 0 disables the gate
    pub min_span: i64,
    pub density_threshold: f64,
    pub delta_tolerance: i64,
}

impl DuplicationConfig {
    pub fn audio_gates(&self) -> AlignmentGates {
        AlignmentGates {
            min_count: self.audio_min_hashes,
            min_span: self.audio_min_span,
            density_threshold: self.audio_density_threshold,
            delta_tolerance: self.audio_delta_tolerance,
        }
    }

    pub fn visual_gates(&self) -> AlignmentGates {
        AlignmentGates {
            min_count: self.visual_min_frames,
            min_span: self.visual_min_span,
            density_threshold: self.visual_density_threshold,
            delta_tolerance: self.visual_delta_tolerance,
        }
    }
}

/// Offset bin for a delta. Floor division, so -1 and 0 land in different bins.
pub fn delta_bin(delta: i64, tolerance: i64) -> i64 {
    delta.div_euclid(tolerance.max(1))
}

#[derive(Debug)]
struct BinStats {
    positions: HashSet<i64>,
    min_pos: i64,
    max_pos: i64,
}

impl BinStats {
    fn new(pos: i64) -> Self {
        let mut positions = HashSet::new();
        positions.insert(pos);
        Self {
            positions,
            min_pos: pos,
            max_pos: pos,
        }
    }

    fn add(&mut self, pos: i64) {
        if self.positions.insert(pos) {
            self.min_pos = self.min_pos.min(pos);
            self.max_pos = self.max_pos.max(pos);
        }
    }

    fn span(&self) -> i64 {
        self.max_pos - self.min_pos + 1
    }
}

/// The winning offset bin for one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub candidate: i64,
    pub bin: i64,
    pub unique_positions: i64,
    pub span: i64,
}

impl Alignment {
    pub fn density(&self) -> f64 {
        if self.span <= 0 {
            return 0.0;
        }
        self.unique_positions as f64 / self.span as f64
    }

    pub fn passes(&self, gates: &AlignmentGates) -> bool {
        if self.unique_positions < gates.min_count {
            return false;
        }
        if gates.min_span > 0 && self.span < gates.min_span {
            return false;
        }
        self.density() >= gates.density_threshold
    }
}

/// Offset votes grouped by (candidate, bin).
#[derive(Debug)]
pub struct AlignmentVotes {
    tolerance: i64,
    bins: HashMap<(i64, i64), BinStats>,
}

impl AlignmentVotes {
    pub fn new(tolerance: i64) -> Self {
        Self {
            tolerance: tolerance.max(1),
            bins: HashMap::new(),
        }
    }

    pub fn vote(&mut self, candidate: i64, query_pos: i64, candidate_pos: i64) {
        let bin = delta_bin(candidate_pos - query_pos, self.tolerance);
        self.bins
            .entry((candidate, bin))
            .and_modify(|s| s.add(query_pos))
            .or_insert_with(|| BinStats::new(query_pos));
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Best bin per candidate: most distinct positions, lower bin on ties.
    /// Ordered by candidate id.
    pub fn best_alignments(&self) -> Vec<Alignment> {
        let mut best: BTreeMap<i64, Alignment> = BTreeMap::new();
        for (&(candidate, bin), stats) in &self.bins {
            let alignment = Alignment {
                candidate,
                bin,
                unique_positions: stats.positions.len() as i64,
                span: stats.span(),
            };
            match best.get(&candidate) {
                Some(current)
                    if current.unique_positions > alignment.unique_positions
                        || (current.unique_positions == alignment.unique_positions && current.bin < alignment.bin) => {}
                _ => {
                    best.insert(candidate, alignment);
                }
            }
        }
        best.into_values().collect()
    }

    /// Candidates whose best alignment passes every gate.
    pub fn into_matches(self, gates: &AlignmentGates, match_type: MatchType) -> Vec<MatchResult> {
        self.best_alignments()
            .into_iter()
            .filter(|a| a.passes(gates))
            .map(|a| MatchResult {
                candidate: a.candidate,
                confidence: a.density(),
                match_type,
            })
            .collect()
    }
}

/// One entry per candidate, keeping the higher confidence when a candidate
/// matched through both modalities. Ordered by candidate id.
pub fn merge_matches(matches: impl IntoIterator<Item = MatchResult>) -> Vec<MatchResult> {
    let mut best: BTreeMap<i64, MatchResult> = BTreeMap::new();
    for m in matches {
        match best.get(&m.candidate) {
            Some(current) if current.confidence >= m.confidence => {}
            _ => {
                best.insert(m.candidate, m);
            }
        }
    }
    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gates(min_count: i64, min_span: i64, density: f64) -> AlignmentGates {
        AlignmentGates {
            min_count,
            min_span,
            density_threshold: density,
            delta_tolerance: 4,
        }
    }

    #[test]
    fn test_floor_bins_straddle_zero() {
        let t = 4;
        assert_eq!(delta_bin(-1, t), -1);
        assert_eq!(delta_bin(0, t), 0);
        assert_eq!(delta_bin(t - 1, t), 0);
        assert_ne!(delta_bin(-1, t), delta_bin(t - 1, t));
    }

    #[test]
    fn test_bins_have_uniform_width() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10_000 {
            let t: i64 = rng.gen_range(1..50);
            let d: i64 = rng.gen_range(-100_000..100_000);
            assert_eq!(delta_bin(d, t), delta_bin(d + t, t) - 1);
        }
    }

    #[test]
    fn test_positions_counted_once() {
        let mut votes = AlignmentVotes::new(4);
        votes.vote(9, 10, 110);
        votes.vote(9, 10, 111);
        votes.vote(9, 11, 111);
        let best = votes.best_alignments();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].unique_positions, 2);
        assert_eq!(best[0].span, 2);
    }

    #[test]
    fn test_mode_bin_wins() {
        let mut votes = AlignmentVotes::new(1);
        for i in 0..5 {
            votes.vote(1, i, i + 100);
        }
        for i in 0..3 {
            votes.vote(1, i, i + 7);
        }
        let best = votes.best_alignments();
        assert_eq!(best[0].bin, 100);
        assert_eq!(best[0].unique_positions, 5);
    }

    #[test]
    fn test_gates() {
        let a = Alignment { candidate: 1, bin: 0, unique_positions: 100, span: 150 };
        assert!(a.passes(&gates(80, 100, 0.5)));
        assert!(!a.passes(&gates(101, 0, 0.5)), "count gate");
        assert!(!a.passes(&gates(80, 160, 0.5)), "span gate");
        assert!(!a.passes(&gates(80, 0, 0.7)), "density gate");
        assert!(a.passes(&gates(80, 0, 0.6)), "span gate disabled at 0");
    }

    #[test]
    fn test_gate_monotonicity() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut votes = AlignmentVotes::new(4);
        for candidate in 0..40 {
            let offset: i64 = rng.gen_range(-500..500);
            let hits: i64 = rng.gen_range(0..300);
            for _ in 0..hits {
                let i: i64 = rng.gen_range(0..400);
                votes.vote(candidate, i, i + offset + rng.gen_range(0..3));
            }
        }
        let alignments = votes.best_alignments();
        let count = |g: &AlignmentGates| alignments.iter().filter(|a| a.passes(g)).count();

        let mut last = usize::MAX;
        for min_count in (0..300).step_by(10) {
            let n = count(&gates(min_count, 0, 0.3));
            assert!(n <= last);
            last = n;
        }
        let mut last = usize::MAX;
        for step in 0..=20 {
            let n = count(&gates(10, 0, step as f64 / 20.0));
            assert!(n <= last);
            last = n;
        }
    }

    #[test]
    fn test_merge_keeps_higher_confidence() {
        let merged = merge_matches(vec![
            MatchResult { candidate: 2, confidence: 0.6, match_type: MatchType::Audio },
            MatchResult { candidate: 2, confidence: 0.9, match_type: MatchType::Visual },
            MatchResult { candidate: 1, confidence: 0.7, match_type: MatchType::Audio },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].candidate, 1);
        assert_eq!(merged[1].match_type, MatchType::Visual);
        assert_eq!(merged[1].confidence, 0.9);
    }
}
