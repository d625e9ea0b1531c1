//! Feature-overlap similarity between a live group and a historical review.
//!
//! Weighted blend: pattern-type Jaccard 0.5, timeframe Jaccard 0.3, cycle
//! proximity 0.2. Embeddings, when enabled, only refine this score; the
//! feature-overlap path must stand on its own.

use std::collections::BTreeSet;

use crate::models::{PatternGroup, ReviewContent};

pub const WEIGHT_PATTERN_TYPES: f64 = 0.5;
pub const WEIGHT_TIMEFRAMES: f64 = 0.3;
pub const WEIGHT_CYCLES: f64 = 0.2;

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Proximity of two cycle counts in (0, 1].
pub fn cycle_proximity(a: u32, b: u32) -> f64 {
    let (a, b) = (a.max(1) as f64, b.max(1) as f64);
    1.0 - (a - b).abs() / a.max(b)
}

/// Score one historical review against the live group.
pub fn score(group: &PatternGroup, review: &ReviewContent) -> f64 {
    let group_types: BTreeSet<&str> = group.pattern_types.iter().map(|s| s.as_str()).collect();
    let review_types: BTreeSet<&str> = review.pattern_types.iter().map(|s| s.as_str()).collect();

    let group_tfs: BTreeSet<_> = group.timeframes.iter().copied().collect();
    let review_tfs: BTreeSet<_> = review.timeframes.iter().copied().collect();

    WEIGHT_PATTERN_TYPES * jaccard(&group_types, &review_types)
        + WEIGHT_TIMEFRAMES * jaccard(&group_tfs, &review_tfs)
        + WEIGHT_CYCLES * cycle_proximity(group.cycle_count, review.cycle_count)
}

/// Human-readable structural differences, for the similar-context payload.
pub fn differences(group: &PatternGroup, review: &ReviewContent) -> Vec<String> {
    let mut out = Vec::new();

    let group_types: BTreeSet<&str> = group.pattern_types.iter().map(|s| s.as_str()).collect();
    let review_types: BTreeSet<&str> = review.pattern_types.iter().map(|s| s.as_str()).collect();
    for t in group_types.difference(&review_types) {
        out.push(format!("pattern_type {t} only in group"));
    }
    for t in review_types.difference(&group_types) {
        out.push(format!("pattern_type {t} only in history"));
    }

    let group_tfs: BTreeSet<_> = group.timeframes.iter().copied().collect();
    let review_tfs: BTreeSet<_> = review.timeframes.iter().copied().collect();
    for tf in group_tfs.symmetric_difference(&review_tfs) {
        out.push(format!("timeframe {tf} differs"));
    }

    if group.cycle_count != review.cycle_count {
        out.push(format!(
            "cycle count {} vs {}",
            group.cycle_count, review.cycle_count
        ));
    }
    if group.shape != review.group_type {
        out.push(format!(
            "group shape {} vs {}",
            group.shape.as_str(),
            review.group_type.as_str()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupShape, Outcome, PlanVsReality, Timeframe};

    fn group(types: &[&str], tfs: &[Timeframe], cycles: u32) -> PatternGroup {
        PatternGroup {
            shape: GroupShape::MultiSingle,
            symbol: "BTC".to_string(),
            pattern_strand_ids: vec![],
            pattern_types: types.iter().map(|s| s.to_string()).collect(),
            timeframes: tfs.to_vec(),
            cycle_count: cycles,
            group_signature: "sig".to_string(),
            anchor_timeframe: tfs[0],
            avg_strength: 0.5,
        }
    }

    fn review(types: &[&str], tfs: &[Timeframe], cycles: u32) -> ReviewContent {
        ReviewContent {
            prediction_id: "p".to_string(),
            outcome: Outcome::default(),
            plan_vs_reality: PlanVsReality::default(),
            method_comparison: None,
            group_signature: "other".to_string(),
            method: "code".to_string(),
            group_type: GroupShape::MultiSingle,
            pattern_types: types.iter().map(|s| s.to_string()).collect(),
            timeframes: tfs.to_vec(),
            cycle_count: cycles,
            original_pattern_strand_ids: vec![],
            braid: None,
        }
    }

    #[test]
    fn identical_structures_score_one() {
        let g = group(&["volume_spike", "divergence"], &[Timeframe::H1], 1);
        let r = review(&["volume_spike", "divergence"], &[Timeframe::H1], 1);
        assert!((score(&g, &r) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_types_lose_half_the_score() {
        let g = group(&["volume_spike"], &[Timeframe::H1], 1);
        let r = review(&["divergence"], &[Timeframe::H1], 1);
        let s = score(&g, &r);
        assert!((s - (WEIGHT_TIMEFRAMES + WEIGHT_CYCLES)).abs() < 1e-9);
    }

    #[test]
    fn cycle_proximity_saturates_at_equal_counts() {
        assert!((cycle_proximity(3, 3) - 1.0).abs() < 1e-9);
        assert!(cycle_proximity(1, 4) < 0.3);
    }

    #[test]
    fn differences_name_the_gaps() {
        let g = group(&["volume_spike"], &[Timeframe::H1], 1);
        let r = review(&["divergence"], &[Timeframe::H4], 2);
        let diffs = differences(&g, &r);
        assert!(diffs.iter().any(|d| d.contains("volume_spike")));
        assert!(diffs.iter().any(|d| d.contains("divergence")));
        assert!(diffs.iter().any(|d| d.contains("cycle count")));
    }
}
