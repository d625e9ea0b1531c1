//! Per-cluster learning loop.
//!
//! For each `(cluster_type, cluster_key, level)` slot with enough
//! unconsumed reviews, runs a braiding job: synthesize a lesson over the
//! members, append a level+1 review inheriting the cluster, and consume
//! exactly the matching slot on each parent — all exactly once per slot.
//!
//! Per-slot serialization: a slot is claimed in the in-flight set before
//! any work and released after; the same slot is never braided
//! concurrently with itself. Different slots braid freely in parallel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clustering::ClusterAssigner;
use crate::errors::CilResult;
use crate::learning::analyzer::{ClusterAggregates, LearningAnalyzer};
use crate::models::{
    BraidAggregates, ClusterSlot, ClusterType, Config, GroupShape, LearningInsights, Outcome,
    PlanVsReality, ReviewContent, Strand, StrandKind, Timeframe, UncertaintyContent,
    UncertaintyType,
};
use crate::ports::ClockPort;
use crate::store::{SlotSummary, StrandStore};

pub const TAG_BRAID: &str = "cil:braid";
pub const TAG_UNCERTAINTY: &str = "cil:uncertainty";

pub type SlotId = (ClusterType, String, u32);

#[derive(Debug)]
pub enum BraidOutcome {
    /// A braid strand was appended.
    Braided(String),
    /// Slot was busy, shrank below the minimum, or failed a gate.
    Skipped,
    /// The analyzer reported uncertainty above the threshold; an
    /// uncertainty strand was emitted instead and nothing was consumed.
    ParkedUncertain,
}

/// Guard for the per-slot in-flight set.
struct SlotClaim {
    inflight: Arc<Mutex<HashSet<SlotId>>>,
    slot: SlotId,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.slot);
    }
}

#[derive(Clone)]
pub struct ClusterBraider {
    store: StrandStore,
    analyzer: LearningAnalyzer,
    assigner: ClusterAssigner,
    config: Config,
    clock: Arc<dyn ClockPort>,
    inflight: Arc<Mutex<HashSet<SlotId>>>,
    /// Effective minimum braid size; raised temporarily under backpressure.
    effective_min: Arc<AtomicUsize>,
}

impl ClusterBraider {
    pub fn new(
        store: StrandStore,
        analyzer: LearningAnalyzer,
        assigner: ClusterAssigner,
        clock: Arc<dyn ClockPort>,
        config: Config,
    ) -> Self {
        let min = config.min_braid_size;
        Self {
            store,
            analyzer,
            assigner,
            config,
            clock,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            effective_min: Arc::new(AtomicUsize::new(min)),
        }
    }

    pub fn effective_min_braid_size(&self) -> usize {
        self.effective_min.load(Ordering::Relaxed)
    }

    /// Backpressure hook: raise or restore the minimum cluster size.
    pub fn set_effective_min_braid_size(&self, min: usize) {
        self.effective_min.store(min.max(2), Ordering::Relaxed);
    }

    /// Slots currently worth braiding, quality gates applied.
    pub async fn scan(&self) -> CilResult<Vec<SlotId>> {
        let min = self.effective_min_braid_size();
        let now = self.clock.now();
        let mut summaries = self.store.eligible_slots(min).await?;

        summaries.retain(|s| self.passes_gates(s, now));
        // Biggest clusters first; the dispatcher reorders by resonance.
        summaries.sort_by(|a, b| b.unconsumed_count.cmp(&a.unconsumed_count));

        Ok(summaries
            .into_iter()
            .map(|s| (s.cluster_type, s.cluster_key, s.braid_level))
            .collect())
    }

    fn passes_gates(&self, summary: &SlotSummary, now: chrono::DateTime<Utc>) -> bool {
        if summary.avg_selection < self.config.braid_min_selection {
            debug!(
                family = summary.cluster_type.as_str(),
                key = %summary.cluster_key,
                avg_selection = summary.avg_selection,
                "slot below selection gate"
            );
            return false;
        }
        let age = (now - summary.oldest_created_at)
            .to_std()
            .unwrap_or_default();
        if age > self.config.max_staleness {
            debug!(
                family = summary.cluster_type.as_str(),
                key = %summary.cluster_key,
                age_secs = age.as_secs(),
                "slot past staleness gate"
            );
            return false;
        }
        true
    }

    /// Run one braiding job for the slot. Exactly-once: concurrent calls
    /// for the same slot collapse to one braid.
    pub async fn braid_slot(&self, slot: &SlotId) -> CilResult<BraidOutcome> {
        let (cluster_type, cluster_key, level) = slot;

        let claim = {
            let mut inflight = self.inflight.lock();
            if !inflight.insert(slot.clone()) {
                return Ok(BraidOutcome::Skipped);
            }
            SlotClaim {
                inflight: self.inflight.clone(),
                slot: slot.clone(),
            }
        };
        let _claim = claim; // released on every exit path

        let members = self
            .store
            .unconsumed_members(*cluster_type, cluster_key, *level, self.config.max_braid_size)
            .await?;
        if members.len() < self.effective_min_braid_size() {
            return Ok(BraidOutcome::Skipped);
        }

        let (insights, aggregates) = self
            .analyzer
            .analyze(*cluster_type, cluster_key, &members)
            .await?;

        if self.config.uncertainty_enabled
            && (insights.uncertainty.confidence < self.config.uncertainty_min_confidence
                || insights.uncertainty.data_sufficiency < self.config.uncertainty_min_sufficiency)
        {
            self.emit_uncertainty(slot, &insights, aggregates.member_count)
                .await;
            return Ok(BraidOutcome::ParkedUncertain);
        }

        let braid = build_braid_strand(
            cluster_type,
            cluster_key,
            *level,
            &members,
            insights,
            &aggregates,
            self.clock.now(),
        );
        let braid_id = self
            .store
            .append_braid(&braid, *cluster_type, cluster_key, *level)
            .await?;

        // Register the braid with the remaining derivable families so it
        // can itself cluster and braid at the next level.
        let braid = self.store.get(&braid_id).await?;
        if let Err(e) = self.assigner.assign(&braid).await {
            warn!(braid = %braid_id, error = %e, "braid cluster assignment failed");
        }

        info!(
            braid = %braid_id,
            family = cluster_type.as_str(),
            key = %cluster_key,
            level = level + 1,
            members = braid.lineage.parent_ids.len(),
            "braid created"
        );
        metrics::counter!("cil_braids_created", 1);
        Ok(BraidOutcome::Braided(braid_id))
    }

    /// After the retry schedule is exhausted, the job parks and the gap in
    /// knowledge becomes a first-class uncertainty strand.
    pub async fn park_failed_slot(&self, slot: &SlotId, reason: &str) {
        let (cluster_type, cluster_key, level) = slot;
        let content = UncertaintyContent {
            uncertainty_type: UncertaintyType::DataSufficiency,
            resolution_priority: 0.5,
            resolution_actions: vec![
                "retry braiding when the llm recovers".to_string(),
            ],
            source: Some(format!(
                "braid {}/{cluster_key}@{level}",
                cluster_type.as_str()
            )),
        };
        let strand = Strand::new(StrandKind::Uncertainty)
            .with_content(&content)
            .with_tag(TAG_UNCERTAINTY)
            .with_lesson(format!("braiding parked: {reason}"));
        if let Err(e) = self.store.append(&strand).await {
            warn!(error = %e, "failed to record parked-braid uncertainty");
        }
        metrics::counter!("cil_uncertainty_emitted", 1);
    }

    async fn emit_uncertainty(
        &self,
        slot: &SlotId,
        insights: &LearningInsights,
        member_count: usize,
    ) {
        let (cluster_type, cluster_key, level) = slot;
        let content = UncertaintyContent {
            uncertainty_type: if insights.uncertainty.data_sufficiency
                < self.config.uncertainty_min_sufficiency
            {
                UncertaintyType::DataSufficiency
            } else {
                UncertaintyType::PatternClarity
            },
            resolution_priority: 1.0 - insights.uncertainty.confidence,
            resolution_actions: vec![format!(
                "collect more than {member_count} reviews before braiding"
            )],
            source: Some(format!(
                "braid {}/{cluster_key}@{level}",
                cluster_type.as_str()
            )),
        };
        let strand = Strand::new(StrandKind::Uncertainty)
            .with_content(&content)
            .with_tag(TAG_UNCERTAINTY)
            .with_lesson("analyzer reported insufficient signal".to_string());
        if let Err(e) = self.store.append(&strand).await {
            warn!(error = %e, "failed to record analyzer uncertainty");
        }
        metrics::counter!("cil_uncertainty_emitted", 1);
    }
}

/// Assemble the level+1 review strand from the members and the lesson.
#[allow(clippy::too_many_arguments)]
pub fn build_braid_strand(
    cluster_type: &ClusterType,
    cluster_key: &str,
    source_level: u32,
    members: &[Strand],
    insights: LearningInsights,
    aggregates: &ClusterAggregates,
    created_at: chrono::DateTime<Utc>,
) -> Strand {
    let parent_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();

    let mut pattern_types: Vec<String> = Vec::new();
    let mut timeframes: Vec<Timeframe> = Vec::new();
    let mut methods: HashSet<String> = HashSet::new();
    let mut shapes: Vec<GroupShape> = Vec::new();
    let mut original_ids: Vec<String> = Vec::new();
    let mut cycle_count = 1u32;
    let mut mfe: f64 = 0.0;
    let mut mae: f64 = 0.0;
    let mut time_sum = 0u64;

    for member in members {
        if let Ok(content) = member.content_as::<ReviewContent>() {
            pattern_types.extend(content.pattern_types);
            timeframes.extend(content.timeframes);
            methods.insert(content.method);
            shapes.push(content.group_type);
            original_ids.extend(content.original_pattern_strand_ids);
            cycle_count = cycle_count.max(content.cycle_count);
            mfe = mfe.max(content.outcome.max_favorable_pct);
            mae = mae.max(content.outcome.max_adverse_pct);
            time_sum += content.outcome.time_to_outcome_secs;
        }
    }
    pattern_types.sort_unstable();
    pattern_types.dedup();
    timeframes.sort_unstable();
    timeframes.dedup();
    original_ids.sort_unstable();
    original_ids.dedup();

    let group_type = dominant_shape(&shapes);
    let method = if methods.len() == 1 {
        methods.into_iter().next().unwrap_or_default()
    } else {
        String::new()
    };

    let realized = aggregates.avg_return_pct;
    let outcome = Outcome {
        realized_return_pct: realized,
        max_favorable_pct: mfe.max(realized),
        max_adverse_pct: mae.max(-realized),
        time_to_outcome_secs: time_sum / members.len().max(1) as u64,
        hit_target: false,
        hit_stop: false,
        first_hit: None,
        success: aggregates.success_rate >= 0.5,
    };

    let lesson = if insights.lessons_learned.is_empty() {
        "insufficient signal".to_string()
    } else {
        insights.lessons_learned.join("; ")
    };

    let symbol = uniform(members.iter().filter_map(|m| m.symbol.clone()));
    let timeframe = uniform(members.iter().filter_map(|m| m.timeframe));

    let content = ReviewContent {
        prediction_id: String::new(),
        outcome,
        plan_vs_reality: PlanVsReality::default(),
        method_comparison: None,
        // Braids have no single signature; the inherited slot carries the
        // cluster identity instead.
        group_signature: String::new(),
        method,
        group_type,
        pattern_types,
        timeframes,
        cycle_count,
        original_pattern_strand_ids: original_ids,
        braid: Some(BraidAggregates {
            cluster_type: *cluster_type,
            cluster_key: cluster_key.to_string(),
            member_count: aggregates.member_count,
            success_rate: aggregates.success_rate,
            avg_confidence: aggregates.avg_confidence,
            avg_return_pct: aggregates.avg_return_pct,
            insights,
        }),
    };

    let mut braid = Strand::new(StrandKind::PredictionReview)
        .with_created_at(created_at)
        .with_braid_level(source_level + 1)
        .with_content(&content)
        .with_tag(TAG_BRAID)
        .with_tag(TAG_BRAID_LEARNING)
        .with_lesson(lesson)
        .with_lineage(
            parent_ids,
            format!("braided {}/{cluster_key}", cluster_type.as_str()),
        );
    if let Some(symbol) = symbol {
        braid = braid.with_symbol(symbol);
    }
    if let Some(timeframe) = timeframe {
        braid = braid.with_timeframe(timeframe);
    }
    // Invariant: the braid inherits its cluster, unconsumed, at level+1.
    braid.cluster_key = vec![ClusterSlot::new(
        *cluster_type,
        cluster_key,
        source_level + 1,
    )];
    braid
}

pub const TAG_BRAID_LEARNING: &str = "cil:learning";

fn dominant_shape(shapes: &[GroupShape]) -> GroupShape {
    let mut counts: Vec<(GroupShape, usize)> = Vec::new();
    for shape in shapes {
        match counts.iter_mut().find(|(s, _)| s == shape) {
            Some((_, n)) => *n += 1,
            None => counts.push((*shape, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(s, _)| s)
        .unwrap_or(GroupShape::SingleSingle)
}

fn uniform<T: PartialEq>(mut iter: impl Iterator<Item = T>) -> Option<T> {
    let first = iter.next()?;
    for item in iter {
        if item != first {
            return None;
        }
    }
    Some(first)
}
