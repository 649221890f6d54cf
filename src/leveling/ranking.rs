use super::config::SafetyFloor;
use super::metrics::{WORD_READING_ATTEMPTED, WORD_READING_CORRECT};
use super::ScoreRecord;
use std::cmp::Ordering;

/// Rank-normalizes composites across the cohort: stable ascending sort, then
/// `rank / max(N-1, 1)`. Output is in input order. Ties keep input order.
pub fn percentiles(composites: &[f64]) -> Vec<f64> {
    let n = composites.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| {
        composites[*a]
            .partial_cmp(&composites[*b])
            .unwrap_or(Ordering::Equal)
    });
    let denom = n.saturating_sub(1).max(1) as f64;
    let mut out = vec![0.0; n];
    for (rank, idx) in order.into_iter().enumerate() {
        out[idx] = rank as f64 / denom;
    }
    out
}

/// Word-reading decoding check. Evaluated before banding.
pub fn safety_floor_triggered(scores: Option<&ScoreRecord>, floor: &SafetyFloor) -> bool {
    let Some(scores) = scores else {
        return false;
    };
    let Some(correct) = scores.metric(WORD_READING_CORRECT) else {
        return false;
    };
    if correct < floor.min_correct {
        return true;
    }
    match scores.metric(WORD_READING_ATTEMPTED) {
        Some(attempted) if attempted > 0.0 => correct / attempted < floor.min_accuracy,
        _ => false,
    }
}

/// `floor(percentile / (1/K))` clamped to `0..K`.
pub fn bin_index(percentile: f64, section_count: usize) -> usize {
    if section_count == 0 {
        return 0;
    }
    let raw = (percentile * section_count as f64).floor();
    if raw.is_nan() || raw <= 0.0 {
        return 0;
    }
    (raw as usize).min(section_count - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinAssignment {
    pub index: usize,
    pub safety_floor: bool,
}

pub fn assign_bin(
    percentile: f64,
    section_count: usize,
    scores: Option<&ScoreRecord>,
    floor: &SafetyFloor,
) -> BinAssignment {
    if safety_floor_triggered(scores, floor) {
        return BinAssignment {
            index: 0,
            safety_floor: true,
        };
    }
    BinAssignment {
        index: bin_index(percentile, section_count),
        safety_floor: false,
    }
}
