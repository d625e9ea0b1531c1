//! Cluster assignment.
//!
//! Key derivation per family:
//!
//! | family             | key                                  |
//! |--------------------|--------------------------------------|
//! | pattern_timeframe  | group_signature + asset              |
//! | asset              | symbol                               |
//! | timeframe          | timeframe                            |
//! | outcome            | success / failure                    |
//! | pattern            | dominant pattern type                |
//! | group_type         | group shape                          |
//! | method             | code / llm                           |
//!
//! Assignment is idempotent: the slot table's primary key absorbs reruns.

use std::collections::HashMap;

use tracing::debug;

use crate::errors::CilResult;
use crate::models::{ClusterSlot, ClusterType, ReviewContent, Strand, StrandKind};
use crate::store::StrandStore;

#[derive(Clone)]
pub struct ClusterAssigner {
    store: StrandStore,
}

impl ClusterAssigner {
    pub fn new(store: StrandStore) -> Self {
        Self { store }
    }

    /// Assign the review to every derivable family. Returns how many slots
    /// were new; rerunning yields zero.
    pub async fn assign(&self, review: &Strand) -> CilResult<usize> {
        let slots = derive_slots(review)?;
        let inserted = self.store.assign_slots(&review.id, &slots).await?;
        debug!(
            review = %review.id,
            level = review.braid_level,
            slots = slots.len(),
            new = inserted,
            "cluster assignment"
        );
        Ok(inserted)
    }
}

/// Pure key derivation; one slot per family whose key is derivable.
pub fn derive_slots(review: &Strand) -> CilResult<Vec<ClusterSlot>> {
    debug_assert_eq!(review.kind, StrandKind::PredictionReview);
    let content: ReviewContent = review.content_as()?;
    let level = review.braid_level;
    let mut slots = Vec::with_capacity(7);

    if let Some(symbol) = &review.symbol {
        if !content.group_signature.is_empty() {
            slots.push(ClusterSlot::new(
                ClusterType::PatternTimeframe,
                format!("{}|{symbol}", content.group_signature),
                level,
            ));
        }
        slots.push(ClusterSlot::new(ClusterType::Asset, symbol.clone(), level));
    }

    if let Some(timeframe) = review.timeframe {
        slots.push(ClusterSlot::new(
            ClusterType::Timeframe,
            timeframe.as_str(),
            level,
        ));
    }

    // Braided reviews key outcome on their aggregate success rate.
    let success = match &content.braid {
        Some(braid) => braid.success_rate >= 0.5,
        None => content.outcome.success,
    };
    slots.push(ClusterSlot::new(
        ClusterType::Outcome,
        if success { "success" } else { "failure" },
        level,
    ));

    if let Some(dominant) = dominant_pattern_type(&content) {
        slots.push(ClusterSlot::new(ClusterType::Pattern, dominant, level));
    }

    slots.push(ClusterSlot::new(
        ClusterType::GroupType,
        content.group_type.as_str(),
        level,
    ));

    if !content.method.is_empty() {
        slots.push(ClusterSlot::new(
            ClusterType::Method,
            content.method.clone(),
            level,
        ));
    }

    Ok(slots)
}

/// Most frequent pattern type, ties broken lexicographically.
fn dominant_pattern_type(content: &ReviewContent) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &content.pattern_types {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(t, _)| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    fn review(success: bool) -> Strand {
        let content = ReviewContent {
            prediction_id: "pred".to_string(),
            outcome: Outcome {
                success,
                realized_return_pct: if success { 1.0 } else { -1.0 },
                max_favorable_pct: 2.0,
                max_adverse_pct: 2.0,
                ..Outcome::default()
            },
            plan_vs_reality: PlanVsReality::default(),
            method_comparison: None,
            group_signature: "sig-cl".to_string(),
            method: "code".to_string(),
            group_type: GroupShape::SingleSingle,
            pattern_types: vec!["volume_spike".to_string(), "volume_spike".to_string(), "divergence".to_string()],
            timeframes: vec![Timeframe::H1],
            cycle_count: 1,
            original_pattern_strand_ids: vec![],
            braid: None,
        };
        Strand::new(StrandKind::PredictionReview)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&content)
    }

    #[test]
    fn all_seven_families_derived_for_leaf_review() {
        let slots = derive_slots(&review(true)).unwrap();
        assert_eq!(slots.len(), 7);
        let types: Vec<ClusterType> = slots.iter().map(|s| s.cluster_type).collect();
        for family in ClusterType::ALL {
            assert!(types.contains(&family), "missing {family:?}");
        }
        assert!(slots.iter().all(|s| !s.consumed && s.braid_level == 1));
    }

    #[test]
    fn outcome_key_tracks_success() {
        let success = derive_slots(&review(true)).unwrap();
        assert!(success
            .iter()
            .any(|s| s.cluster_type == ClusterType::Outcome && s.cluster_key == "success"));
        let failure = derive_slots(&review(false)).unwrap();
        assert!(failure
            .iter()
            .any(|s| s.cluster_type == ClusterType::Outcome && s.cluster_key == "failure"));
    }

    #[test]
    fn dominant_pattern_type_wins() {
        let slots = derive_slots(&review(true)).unwrap();
        let pattern = slots
            .iter()
            .find(|s| s.cluster_type == ClusterType::Pattern)
            .unwrap();
        assert_eq!(pattern.cluster_key, "volume_spike");
    }

    #[tokio::test]
    async fn assignment_is_idempotent() {
        let store = crate::store::StrandStore::in_memory().unwrap();

        let prediction = Strand::new(StrandKind::Prediction)
            .with_symbol("BTC")
            .with_content(&serde_json::json!({"group_signature": "sig-cl"}))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();
        store
            .update_tracking(&prediction_id, TrackingStatus::Completed)
            .await
            .unwrap();

        let mut strand = review(true);
        // Point the review at the real prediction so append validates.
        let mut content: ReviewContent = strand.content_as().unwrap();
        content.prediction_id = prediction_id;
        strand = strand.with_content(&content);
        let id = store.append(&strand).await.unwrap();
        let strand = store.get(&id).await.unwrap();

        let assigner = ClusterAssigner::new(store.clone());
        let first = assigner.assign(&strand).await.unwrap();
        assert_eq!(first, 7);
        let second = assigner.assign(&strand).await.unwrap();
        assert_eq!(second, 0, "rerun must not create duplicate slots");
        assert_eq!(store.get(&strand.id).await.unwrap().cluster_key.len(), 7);
    }
}
