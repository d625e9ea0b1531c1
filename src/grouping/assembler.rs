//! Pattern group assembler.
//!
//! From a batch of leaf pattern strands (one detection cycle's overview),
//! produces up to six groupings per asset:
//!
//! | shape               | key (per asset)                      | keep when            |
//! |---------------------|--------------------------------------|----------------------|
//! | single_single       | (pattern_type, timeframe, cycle)     | always               |
//! | multi_single        | (timeframe, cycle)                   | >=2 pattern types    |
//! | single_multi        | (pattern_type, cycle)                | >=2 timeframes       |
//! | multi_multi         | (cycle)                              | >=2 types, >=2 tfs   |
//! | single_multi_cycle  | (pattern_type, timeframe)            | >=2 cycles           |
//! | multi_multi_cycle   | (asset)                              | >=2 types, >=2 cycles|

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{CilError, CilResult};
use crate::grouping::signature::group_signature;
use crate::models::{Config, GroupShape, PatternContent, PatternGroup, Strand, StrandKind, Timeframe};

/// Flattened view of one leaf pattern strand.
#[derive(Debug, Clone)]
pub struct PatternRef {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub pattern_type: String,
    pub cycle_time: i64,
    pub strength: f64,
}

impl PatternRef {
    pub fn from_strand(strand: &Strand) -> CilResult<Self> {
        if strand.kind != StrandKind::Pattern {
            return Err(CilError::ValidationFailure(format!(
                "expected pattern strand, got {}",
                strand.kind.as_str()
            )));
        }
        let content: PatternContent = strand.content_as()?;
        Ok(Self {
            id: strand.id.clone(),
            symbol: strand
                .symbol
                .clone()
                .ok_or_else(|| CilError::ValidationFailure("pattern without symbol".to_string()))?,
            timeframe: strand.timeframe.ok_or_else(|| {
                CilError::ValidationFailure("pattern without timeframe".to_string())
            })?,
            pattern_type: content.pattern_type,
            cycle_time: content.cycle_time,
            strength: content.strength,
        })
    }
}

pub struct PatternGroupAssembler {
    config: Config,
}

impl PatternGroupAssembler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Form all retained groups across all assets in the batch.
    pub fn assemble(&self, patterns: &[PatternRef]) -> Vec<PatternGroup> {
        let mut by_symbol: BTreeMap<&str, Vec<&PatternRef>> = BTreeMap::new();
        for p in patterns {
            by_symbol.entry(p.symbol.as_str()).or_default().push(p);
        }

        let mut groups = Vec::new();
        for (_, members) in by_symbol {
            self.assemble_for_asset(&members, &mut groups);
        }
        groups
    }

    fn assemble_for_asset(&self, members: &[&PatternRef], out: &mut Vec<PatternGroup>) {
        // A: (pattern_type, timeframe, cycle) — always retained.
        for bucket in bucket_by(members, |p| {
            (p.pattern_type.clone(), p.timeframe, p.cycle_time)
        }) {
            out.push(self.build(GroupShape::SingleSingle, &bucket));
        }

        // B: (timeframe, cycle) — needs >=2 distinct pattern types.
        for bucket in bucket_by(members, |p| (p.timeframe, p.cycle_time)) {
            if distinct_types(&bucket) >= 2 {
                out.push(self.build(GroupShape::MultiSingle, &bucket));
            }
        }

        // C: (pattern_type, cycle) — needs >=2 distinct timeframes.
        for bucket in bucket_by(members, |p| (p.pattern_type.clone(), p.cycle_time)) {
            if distinct_timeframes(&bucket) >= 2 {
                out.push(self.build(GroupShape::SingleMulti, &bucket));
            }
        }

        // D: (cycle) — needs >=2 types and >=2 timeframes.
        for bucket in bucket_by(members, |p| p.cycle_time) {
            if distinct_types(&bucket) >= 2 && distinct_timeframes(&bucket) >= 2 {
                out.push(self.build(GroupShape::MultiMulti, &bucket));
            }
        }

        // E: (pattern_type, timeframe) across cycles — needs >=2 cycles.
        for bucket in bucket_by(members, |p| (p.pattern_type.clone(), p.timeframe)) {
            if distinct_cycles(&bucket) >= 2 {
                out.push(self.build(GroupShape::SingleMultiCycle, &bucket));
            }
        }

        // F: whole asset across cycles — needs >=2 types and >=2 cycles.
        if distinct_types(members) >= 2 && distinct_cycles(members) >= 2 {
            out.push(self.build(GroupShape::MultiMultiCycle, members));
        }
    }

    fn build(&self, shape: GroupShape, members: &[&PatternRef]) -> PatternGroup {
        let symbol = members[0].symbol.clone();

        let mut ids: Vec<String> = members.iter().map(|p| p.id.clone()).collect();
        ids.sort_unstable();

        let mut pattern_types: Vec<String> =
            members.iter().map(|p| p.pattern_type.clone()).collect();
        pattern_types.sort_unstable();
        pattern_types.dedup();

        let mut timeframes: Vec<Timeframe> = members.iter().map(|p| p.timeframe).collect();
        timeframes.sort_unstable();
        timeframes.dedup();

        let cycle_count = distinct_cycles(members) as u32;

        let anchor_timeframe = timeframes
            .iter()
            .copied()
            .max_by(|a, b| {
                self.config
                    .timeframe_weight(*a)
                    .total_cmp(&self.config.timeframe_weight(*b))
            })
            .unwrap_or(Timeframe::H1);

        let avg_strength =
            members.iter().map(|p| p.strength).sum::<f64>() / members.len().max(1) as f64;

        let group_signature =
            group_signature(shape, &symbol, &pattern_types, &timeframes, cycle_count);

        PatternGroup {
            shape,
            symbol,
            pattern_strand_ids: ids,
            pattern_types,
            timeframes,
            cycle_count,
            group_signature,
            anchor_timeframe,
            avg_strength,
        }
    }
}

fn bucket_by<'a, K: Ord>(
    members: &[&'a PatternRef],
    key: impl Fn(&PatternRef) -> K,
) -> Vec<Vec<&'a PatternRef>> {
    let mut buckets: BTreeMap<K, Vec<&PatternRef>> = BTreeMap::new();
    for p in members {
        buckets.entry(key(p)).or_default().push(*p);
    }
    buckets.into_values().collect()
}

fn distinct_types(members: &[&PatternRef]) -> usize {
    members
        .iter()
        .map(|p| p.pattern_type.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

fn distinct_timeframes(members: &[&PatternRef]) -> usize {
    members
        .iter()
        .map(|p| p.timeframe)
        .collect::<BTreeSet<_>>()
        .len()
}

fn distinct_cycles(members: &[&PatternRef]) -> usize {
    members
        .iter()
        .map(|p| p.cycle_time)
        .collect::<BTreeSet<_>>()
        .len()
}
