//! Braiding behavior tests: per-slot consumption, cross-family
//! preservation, outage handling, uncertainty gating.

use std::sync::Arc;

use crate::clustering::ClusterAssigner;
use crate::errors::CilError;
use crate::learning::analyzer::LearningAnalyzer;
use crate::learning::braider::{BraidOutcome, ClusterBraider};
use crate::models::*;
use crate::ports::{LlmPort, ScriptedLlm, WallClock};
use crate::store::StrandStore;

fn insights_json(member_count: usize, success_rate: f64) -> String {
    format!(
        r#"{{"patterns_observed":["{member_count} reviews share one asset"],
            "mistakes_identified":[],"success_factors":["target hit rate {success_rate}"],
            "lessons_learned":["cluster resolves favorably at rate {success_rate}"],
            "recommendations":["keep collecting"],
            "uncertainty":{{"pattern_clarity":0.8,"data_sufficiency":0.8,"confidence":0.8}},
            "member_count":{member_count},"success_rate":{success_rate}}}"#
    )
}

fn low_confidence_insights(member_count: usize, success_rate: f64) -> String {
    format!(
        r#"{{"patterns_observed":[],"mistakes_identified":[],"success_factors":[],
            "lessons_learned":["insufficient signal"],"recommendations":[],
            "uncertainty":{{"pattern_clarity":0.2,"data_sufficiency":0.1,"confidence":0.1}},
            "member_count":{member_count},"success_rate":{success_rate}}}"#
    )
}

async fn seed_review(store: &StrandStore, success: bool) -> String {
    let prediction = Strand::new(StrandKind::Prediction)
        .with_symbol("BTC")
        .with_timeframe(Timeframe::H1)
        .with_content(&serde_json::json!({"group_signature": "sig-braid"}))
        .with_tracking(TrackingStatus::Active);
    let prediction_id = store.append(&prediction).await.unwrap();
    store
        .update_tracking(&prediction_id, TrackingStatus::Completed)
        .await
        .unwrap();

    let content = ReviewContent {
        prediction_id,
        outcome: Outcome {
            realized_return_pct: if success { 1.5 } else { -1.0 },
            max_favorable_pct: 2.0,
            max_adverse_pct: 1.5,
            time_to_outcome_secs: 3600,
            hit_target: success,
            hit_stop: !success,
            first_hit: None,
            success,
        },
        plan_vs_reality: PlanVsReality::default(),
        method_comparison: None,
        group_signature: "sig-braid".to_string(),
        method: "code".to_string(),
        group_type: GroupShape::SingleSingle,
        pattern_types: vec!["volume_spike".to_string()],
        timeframes: vec![Timeframe::H1],
        cycle_count: 1,
        original_pattern_strand_ids: vec!["p0".to_string()],
        braid: None,
    };
    let mut review = Strand::new(StrandKind::PredictionReview)
        .with_symbol("BTC")
        .with_timeframe(Timeframe::H1)
        .with_content(&content)
        .with_tag("cil:learning");
    review.cluster_key = vec![
        ClusterSlot::new(ClusterType::Asset, "BTC", 1),
        ClusterSlot::new(ClusterType::Outcome, "success", 1),
        ClusterSlot::new(ClusterType::Method, "code", 1),
    ];
    store.append(&review).await.unwrap()
}

fn braider_with(store: &StrandStore, llm: Arc<ScriptedLlm>) -> ClusterBraider {
    let config = Config::default();
    let analyzer = LearningAnalyzer::new(
        llm as Arc<dyn LlmPort>,
        store.clone(),
        config.clone(),
    );
    ClusterBraider::new(
        store.clone(),
        analyzer,
        ClusterAssigner::new(store.clone()),
        Arc::new(WallClock::new()),
        config,
    )
}

#[tokio::test]
async fn braids_five_reviews_into_level_two() {
    let store = StrandStore::in_memory().unwrap();
    let mut parent_ids = Vec::new();
    for _ in 0..5 {
        parent_ids.push(seed_review(&store, true).await);
    }

    let llm = Arc::new(ScriptedLlm::new());
    llm.push_ok(insights_json(5, 1.0));
    let braider = braider_with(&store, llm);

    let slots = braider.scan().await.unwrap();
    assert!(slots.contains(&(ClusterType::Asset, "BTC".to_string(), 1)));

    let outcome = braider
        .braid_slot(&(ClusterType::Asset, "BTC".to_string(), 1))
        .await
        .unwrap();
    let BraidOutcome::Braided(braid_id) = outcome else {
        panic!("expected a braid, got {outcome:?}");
    };

    let braid = store.get(&braid_id).await.unwrap();
    assert_eq!(braid.braid_level, 2);
    assert_eq!(braid.kind, StrandKind::PredictionReview);
    assert_eq!(braid.lineage.parent_ids.len(), 5);
    assert!(braid.lesson.is_some());

    // Fresh unconsumed inherited slot at level 2.
    let inherited = braid.slot(ClusterType::Asset, "BTC", 2).unwrap();
    assert!(!inherited.consumed);

    // Parents: exactly the asset slot consumed, other families untouched.
    for parent_id in &braid.lineage.parent_ids {
        assert!(parent_ids.contains(parent_id));
        let parent = store.get(parent_id).await.unwrap();
        assert!(parent.slot(ClusterType::Asset, "BTC", 1).unwrap().consumed);
        assert!(!parent.slot(ClusterType::Outcome, "success", 1).unwrap().consumed);
        assert!(!parent.slot(ClusterType::Method, "code", 1).unwrap().consumed);
    }

    let content: ReviewContent = braid.content_as().unwrap();
    let aggregates = content.braid.unwrap();
    assert_eq!(aggregates.member_count, 5);
    assert_eq!(aggregates.success_rate, 1.0);
}

#[tokio::test]
async fn same_pool_braids_under_three_families() {
    let store = StrandStore::in_memory().unwrap();
    for _ in 0..5 {
        seed_review(&store, true).await;
    }

    let llm = Arc::new(ScriptedLlm::new());
    llm.set_fallback(insights_json(5, 1.0));
    let braider = braider_with(&store, llm);

    for (family, key) in [
        (ClusterType::Asset, "BTC"),
        (ClusterType::Outcome, "success"),
        (ClusterType::Method, "code"),
    ] {
        let outcome = braider
            .braid_slot(&(family, key.to_string(), 1))
            .await
            .unwrap();
        assert!(matches!(outcome, BraidOutcome::Braided(_)), "{family:?}");
    }

    // Each parent now has all three level-1 slots consumed, once each.
    let reviews = store
        .query(
            &crate::store::StrandFilter::new()
                .kind(StrandKind::PredictionReview)
                .braid_level(1),
        )
        .await
        .unwrap();
    assert_eq!(reviews.len(), 5);
    for review in reviews {
        for (family, key) in [
            (ClusterType::Asset, "BTC"),
            (ClusterType::Outcome, "success"),
            (ClusterType::Method, "code"),
        ] {
            assert!(review.slot(family, key, 1).unwrap().consumed);
        }
    }

    // A fourth attempt under an exhausted family yields no braid.
    let outcome = braider
        .braid_slot(&(ClusterType::Asset, "BTC".to_string(), 1))
        .await
        .unwrap();
    assert!(matches!(outcome, BraidOutcome::Skipped));
}

#[tokio::test]
async fn llm_outage_leaves_slots_unconsumed_then_recovers() {
    let store = StrandStore::in_memory().unwrap();
    for _ in 0..4 {
        seed_review(&store, true).await;
    }

    let llm = Arc::new(ScriptedLlm::new());
    llm.push_err(CilError::LlmUnavailable("outage".to_string()));
    llm.push_ok(insights_json(4, 1.0));
    let braider = braider_with(&store, llm);
    let slot = (ClusterType::Asset, "BTC".to_string(), 1);

    // First attempt fails; nothing written, nothing consumed.
    assert!(braider.braid_slot(&slot).await.is_err());
    let braids = store
        .query(
            &crate::store::StrandFilter::new()
                .kind(StrandKind::PredictionReview)
                .braid_level(2),
        )
        .await
        .unwrap();
    assert!(braids.is_empty());
    let members = store
        .unconsumed_members(ClusterType::Asset, "BTC", 1, 10)
        .await
        .unwrap();
    assert_eq!(members.len(), 4);

    // Recovery: the retried job produces the expected braid.
    let outcome = braider.braid_slot(&slot).await.unwrap();
    assert!(matches!(outcome, BraidOutcome::Braided(_)));
}

#[tokio::test]
async fn high_uncertainty_parks_instead_of_braiding() {
    let store = StrandStore::in_memory().unwrap();
    for _ in 0..3 {
        seed_review(&store, false).await;
    }
    // Failed reviews cluster under outcome=failure.
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_ok(low_confidence_insights(3, 0.0));
    let braider = braider_with(&store, llm);

    let outcome = braider
        .braid_slot(&(ClusterType::Method, "code".to_string(), 1))
        .await
        .unwrap();
    assert!(matches!(outcome, BraidOutcome::ParkedUncertain));

    let uncertainty = store
        .query(&crate::store::StrandFilter::new().kind(StrandKind::Uncertainty))
        .await
        .unwrap();
    assert_eq!(uncertainty.len(), 1);
    let content: UncertaintyContent = uncertainty[0].content_as().unwrap();
    assert_eq!(content.uncertainty_type, UncertaintyType::DataSufficiency);

    // No consumption happened.
    let members = store
        .unconsumed_members(ClusterType::Method, "code", 1, 10)
        .await
        .unwrap();
    assert_eq!(members.len(), 3);
}

#[tokio::test]
async fn scan_respects_min_braid_size() {
    let store = StrandStore::in_memory().unwrap();
    for _ in 0..2 {
        seed_review(&store, true).await;
    }
    let llm = Arc::new(ScriptedLlm::new());
    let braider = braider_with(&store, llm);

    // Default minimum is 3; two members is not enough.
    assert!(braider.scan().await.unwrap().is_empty());

    seed_review(&store, true).await;
    assert!(!braider.scan().await.unwrap().is_empty());

    // Backpressure raises the bar.
    braider.set_effective_min_braid_size(5);
    assert!(braider.scan().await.unwrap().is_empty());
    braider.set_effective_min_braid_size(3);
    assert!(!braider.scan().await.unwrap().is_empty());
}
