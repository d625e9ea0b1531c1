//! End-to-end pipeline scenarios over a temp-file store, a scripted LLM
//! and simulated market data: overview heartbeat -> prediction ->
//! resolution -> cluster assignment -> braiding -> plan promotion, plus
//! outage and method-comparison paths.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use cil_backend::clustering::ClusterAssigner;
use cil_backend::learning::{BraidOutcome, ClusterBraider, LearningAnalyzer};
use cil_backend::models::*;
use cil_backend::plans::{PermissiveDoctrine, PlanComposer};
use cil_backend::ports::{
    Candle, ClockPort, LlmPort, MarketDataPort, ScriptedLlm, SimClock, SimMarketData, WallClock,
};
use cil_backend::store::{StrandFilter, StrandStore};
use cil_backend::Cil;

fn t0() -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn candle(at: chrono::DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        ts: at,
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

fn insights_json(member_count: usize, success_rate: f64) -> String {
    format!(
        r#"{{"patterns_observed":["{member_count} members"],"mistakes_identified":[],
            "success_factors":[],"lessons_learned":["hit rate {success_rate} over {member_count} members"],
            "recommendations":[],
            "uncertainty":{{"pattern_clarity":0.8,"data_sufficiency":0.8,"confidence":0.8}},
            "member_count":{member_count},"success_rate":{success_rate}}}"#
    )
}

struct Harness {
    cil: Cil,
    market: Arc<SimMarketData>,
    llm: Arc<ScriptedLlm>,
    clock: Arc<SimClock>,
    _dir: tempfile::TempDir,
}

fn harness(mut config: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cil.db");
    config.database_path = db_path.to_string_lossy().to_string();

    let store = StrandStore::new(&config.database_path).unwrap();
    let market = SimMarketData::new();
    let llm = Arc::new(ScriptedLlm::new());
    let clock = Arc::new(SimClock::at(t0()));

    let cil = Cil::bootstrap(
        store,
        market.clone() as Arc<dyn MarketDataPort>,
        Some(llm.clone() as Arc<dyn LlmPort>),
        clock.clone() as Arc<dyn ClockPort>,
        Arc::new(PermissiveDoctrine),
        config,
    )
    .unwrap();

    Harness {
        cil,
        market,
        llm,
        clock,
        _dir: dir,
    }
}

async fn ingest_pattern(store: &StrandStore, symbol: &str, cycle: i64) -> String {
    let content = PatternContent {
        pattern_type: "volume_spike".to_string(),
        strength: 0.8,
        features: serde_json::json!({"zscore": 3.0}),
        cycle_time: cycle,
    };
    let pattern = Strand::new(StrandKind::Pattern)
        .with_symbol(symbol)
        .with_timeframe(Timeframe::H1)
        .with_content(&content);
    store.append(&pattern).await.unwrap()
}

async fn ingest_overview(store: &StrandStore, pattern_ids: Vec<String>, cycle: i64) -> Strand {
    let overview = Strand::new(StrandKind::PatternOverview)
        .with_content(&PatternOverviewContent {
            pattern_strand_ids: pattern_ids,
            cycle_time: cycle,
        })
        .with_tag("cil:overview");
    let id = store.append(&overview).await.unwrap();
    store.get(&id).await.unwrap()
}

/// Drive one pattern through prediction and resolution; returns the review
/// id.
async fn run_one_cycle(h: &Harness, winning: bool) -> String {
    let now = h.clock.now();
    h.market.push_candle(
        "BTC",
        Timeframe::H1,
        candle(now - ChronoDuration::minutes(30), 100.0, 100.2, 99.9, 100.0),
    );

    let pattern_id = ingest_pattern(&h.cil.store, "BTC", now.timestamp()).await;
    let overview = ingest_overview(&h.cil.store, vec![pattern_id], now.timestamp()).await;
    h.cil.dispatcher.handle_overview(&overview).await.unwrap();

    // Resolve: one decisive bar one hour later.
    let bar_time = now + ChronoDuration::hours(1);
    if winning {
        h.market.push_candle(
            "BTC",
            Timeframe::H1,
            candle(bar_time, 100.0, 103.0, 100.0, 102.5),
        );
    } else {
        h.market.push_candle(
            "BTC",
            Timeframe::H1,
            candle(bar_time, 100.0, 100.1, 97.0, 97.5),
        );
    }
    h.clock.advance_secs(2 * 3600);

    let reviews = h.cil.dispatcher.tracker().sweep().await.unwrap();
    assert_eq!(reviews.len(), 1, "exactly one review per resolved prediction");
    h.cil.dispatcher.on_new_review(&reviews[0]).await.unwrap();
    reviews[0].clone()
}

// ---------------------------------------------------------------------------
// Scenario A: first-time group, single prediction.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_time_group_yields_prediction_and_clustered_review() {
    let h = harness(Config::default());
    let now = h.clock.now();
    h.market.push_candle(
        "BTC",
        Timeframe::H1,
        candle(now - ChronoDuration::minutes(30), 100.0, 100.2, 99.9, 100.0),
    );

    let pattern_id = ingest_pattern(&h.cil.store, "BTC", now.timestamp()).await;
    let overview = ingest_overview(&h.cil.store, vec![pattern_id], now.timestamp()).await;
    h.cil.dispatcher.handle_overview(&overview).await.unwrap();

    let predictions = h
        .cil
        .store
        .query(&StrandFilter::new().kind(StrandKind::Prediction))
        .await
        .unwrap();
    assert_eq!(predictions.len(), 1);
    let content: PredictionContent = predictions[0].content_as().unwrap();
    assert_eq!(content.match_quality, MatchQuality::FirstTime);
    assert_eq!(content.exact_count, 0);
    assert_eq!(content.similar_count, 0);
    assert_eq!(content.max_hold_secs, 20 * 3600, "20x the 1h timeframe");

    // Resolve with a winning bar.
    h.market.push_candle(
        "BTC",
        Timeframe::H1,
        candle(now + ChronoDuration::hours(1), 100.0, 103.0, 100.0, 102.5),
    );
    h.clock.advance_secs(2 * 3600);
    let reviews = h.cil.dispatcher.tracker().sweep().await.unwrap();
    assert_eq!(reviews.len(), 1);
    h.cil.dispatcher.on_new_review(&reviews[0]).await.unwrap();

    let review = h.cil.store.get(&reviews[0]).await.unwrap();
    assert_eq!(review.braid_level, 1);
    assert!(
        review.cluster_key.len() >= 6,
        "one slot per derivable cluster family, got {}",
        review.cluster_key.len()
    );
    assert!(review.cluster_key.iter().all(|s| !s.consumed));
}

// ---------------------------------------------------------------------------
// Scenarios B + C: braiding at level 2, multi-family preservation.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn braiding_consumes_only_the_braided_family() {
    let mut config = Config::default();
    config.min_braid_size = 5;
    let h = harness(config);
    h.llm.set_fallback(insights_json(5, 1.0));

    let mut review_ids = Vec::new();
    for _ in 0..5 {
        review_ids.push(run_one_cycle(&h, true).await);
    }

    // One learning sweep braids every eligible family.
    h.cil.dispatcher.learning_sweep().await.unwrap();

    let braids = h
        .cil
        .store
        .query(
            &StrandFilter::new()
                .kind(StrandKind::PredictionReview)
                .braid_level(2),
        )
        .await
        .unwrap();
    assert!(!braids.is_empty(), "expected at least one level-2 braid");

    for braid in &braids {
        assert_eq!(braid.lineage.parent_ids.len(), 5);
        let content: ReviewContent = braid.content_as().unwrap();
        let aggregates = content.braid.unwrap();
        // Fresh unconsumed inherited slot at level 2.
        let inherited = braid
            .slot(aggregates.cluster_type, &aggregates.cluster_key, 2)
            .unwrap();
        assert!(!inherited.consumed);
    }

    // Every family with five members braided independently; each parent
    // slot was consumed exactly under its own family.
    for review_id in &review_ids {
        let review = h.cil.store.get(review_id).await.unwrap();
        for slot in &review.cluster_key {
            let family_braided = braids.iter().any(|b| {
                let c: ReviewContent = b.content_as().unwrap();
                let a = c.braid.unwrap();
                a.cluster_type == slot.cluster_type && a.cluster_key == slot.cluster_key
            });
            assert_eq!(
                slot.consumed, family_braided,
                "slot {:?}/{} consumption must match its family's braid",
                slot.cluster_type, slot.cluster_key
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario D: LLM outage parks the job; recovery braids.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn llm_outage_emits_uncertainty_then_recovers() {
    let mut config = Config::default();
    config.min_braid_size = 4;
    config.llm_max_retries = 1;
    let h = harness(config);

    for _ in 0..4 {
        run_one_cycle(&h, true).await;
    }

    // Outage: enough failures for every eligible family in the sweep.
    for _ in 0..16 {
        h.llm
            .push_err(cil_backend::errors::CilError::LlmUnavailable("down".into()));
    }
    h.cil.dispatcher.learning_sweep().await.unwrap();
    h.cil.dispatcher.drain_due_retries().await;

    let braids = h
        .cil
        .store
        .query(
            &StrandFilter::new()
                .kind(StrandKind::PredictionReview)
                .braid_level(2),
        )
        .await
        .unwrap();
    assert!(braids.is_empty(), "no braid during the outage");

    let uncertainty = h
        .cil
        .store
        .query(&StrandFilter::new().kind(StrandKind::Uncertainty))
        .await
        .unwrap();
    assert!(!uncertainty.is_empty(), "outage surfaces as uncertainty");
    let content: UncertaintyContent = uncertainty[0].content_as().unwrap();
    assert_eq!(content.uncertainty_type, UncertaintyType::DataSufficiency);

    let members = h
        .cil
        .store
        .unconsumed_members(ClusterType::Asset, "BTC", 1, 10)
        .await
        .unwrap();
    assert_eq!(members.len(), 4, "parent slots stay unconsumed");

    // Recovery.
    h.llm.clear_queue();
    h.llm.set_fallback(insights_json(4, 1.0));
    h.cil.dispatcher.learning_sweep().await.unwrap();
    h.cil.dispatcher.drain_due_retries().await;
    let braids = h
        .cil
        .store
        .query(
            &StrandFilter::new()
                .kind(StrandKind::PredictionReview)
                .braid_level(2),
        )
        .await
        .unwrap();
    assert!(!braids.is_empty(), "braiding succeeds after recovery");
}

// ---------------------------------------------------------------------------
// Scenario E: method comparison credits the closer method.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn method_comparison_credits_the_closer_method() {
    let h = harness(Config::default());

    // Code predicted +1.0%, LLM predicted +2.5%; price drifts to +1.2% and
    // the horizon elapses without touching target or stop.
    let group = PatternGroup {
        shape: GroupShape::SingleSingle,
        symbol: "BTC".to_string(),
        pattern_strand_ids: vec!["p1".to_string()],
        pattern_types: vec!["volume_spike".to_string()],
        timeframes: vec![Timeframe::H1],
        cycle_count: 1,
        group_signature: "sig-method".to_string(),
        anchor_timeframe: Timeframe::H1,
        avg_strength: 0.7,
    };
    let content = PredictionContent {
        group: group.clone(),
        group_signature: group.group_signature.clone(),
        code_prediction: MethodForecast {
            target_return_pct: 1.0,
            stop_loss_pct: 5.0,
            confidence: 0.6,
            expected_duration_secs: None,
            rationale: None,
        },
        llm_prediction: Some(MethodForecast {
            target_return_pct: 2.5,
            stop_loss_pct: 5.0,
            confidence: 0.7,
            expected_duration_secs: None,
            rationale: None,
        }),
        entry_price: 100.0,
        target_price: 110.0,
        stop_loss: 90.0,
        max_hold_secs: 20 * 3600,
        match_quality: MatchQuality::FirstTime,
        exact_count: 0,
        similar_count: 0,
        confidence_level: 0.0,
    };
    let prediction = Strand::new(StrandKind::Prediction)
        .with_created_at(t0())
        .with_symbol("BTC")
        .with_timeframe(Timeframe::H1)
        .with_content(&content)
        .with_tracking(TrackingStatus::Active);
    let prediction_id = h.cil.store.append(&prediction).await.unwrap();

    h.market.push_candle(
        "BTC",
        Timeframe::H1,
        candle(t0() + ChronoDuration::hours(1), 100.0, 101.3, 99.8, 101.2),
    );
    h.clock.advance_secs(21 * 3600); // horizon elapses

    let reviews = h.cil.dispatcher.tracker().sweep().await.unwrap();
    assert_eq!(reviews.len(), 1);
    h.cil.dispatcher.on_new_review(&reviews[0]).await.unwrap();

    let review = h.cil.store.get(&reviews[0]).await.unwrap();
    let content: ReviewContent = review.content_as().unwrap();
    assert!((content.outcome.realized_return_pct - 1.2).abs() < 1e-9);

    let comparison = content.method_comparison.unwrap();
    assert_eq!(comparison.better_method, "code");
    assert!(comparison.code_error_pct < comparison.llm_error_pct);
    assert_eq!(content.method, "code");

    // Downstream, the method=code cluster gains a member.
    let slot = review.slot(ClusterType::Method, "code", 1);
    assert!(slot.is_some());
    let _ = prediction_id;
}

// ---------------------------------------------------------------------------
// Scenario F: plan promotion from a level-3 braid.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn qualifying_level_three_braid_promotes_to_plan() {
    let mut config = Config::default();
    config.min_braid_size = 3;
    config.max_braid_size = 4;
    config.plan_min_members = 10;
    config.plan_min_selection = 0.5;

    let store = StrandStore::in_memory().unwrap();
    let llm = Arc::new(ScriptedLlm::new());
    let analyzer = LearningAnalyzer::new(
        llm.clone() as Arc<dyn LlmPort>,
        store.clone(),
        config.clone(),
    );
    let assigner = ClusterAssigner::new(store.clone());
    let braider = ClusterBraider::new(
        store.clone(),
        analyzer,
        assigner,
        Arc::new(WallClock::new()),
        config.clone(),
    );
    let composer = PlanComposer::new(store.clone(), Arc::new(PermissiveDoctrine), config.clone());

    // Twelve successful leaf reviews in the asset/BTC cluster.
    for _ in 0..12 {
        let prediction = Strand::new(StrandKind::Prediction)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&serde_json::json!({"group_signature": "sig-plan"}))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();
        store
            .update_tracking(&prediction_id, TrackingStatus::Completed)
            .await
            .unwrap();

        let content = ReviewContent {
            prediction_id,
            outcome: Outcome {
                realized_return_pct: 1.4,
                max_favorable_pct: 2.0,
                max_adverse_pct: 0.6,
                time_to_outcome_secs: 5400,
                hit_target: true,
                hit_stop: false,
                first_hit: Some("target".to_string()),
                success: true,
            },
            plan_vs_reality: PlanVsReality::default(),
            method_comparison: None,
            group_signature: "sig-plan".to_string(),
            method: "code".to_string(),
            group_type: GroupShape::SingleSingle,
            pattern_types: vec!["volume_spike".to_string()],
            timeframes: vec![Timeframe::H1],
            cycle_count: 1,
            original_pattern_strand_ids: vec![],
            braid: None,
        };
        let mut review = Strand::new(StrandKind::PredictionReview)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&content);
        review.cluster_key = vec![ClusterSlot::new(ClusterType::Asset, "BTC", 1)];
        let id = store.append(&review).await.unwrap();
        let mut scores = Scores::default();
        scores.selection = 0.55;
        store.update_scores(&id, &scores).await.unwrap();
    }

    // Three level-2 braids of four members each.
    for _ in 0..3 {
        llm.push_ok(insights_json(4, 1.0));
        let outcome = braider
            .braid_slot(&(ClusterType::Asset, "BTC".to_string(), 1))
            .await
            .unwrap();
        assert!(matches!(outcome, BraidOutcome::Braided(_)));
    }

    // One level-3 braid over the three level-2 braids.
    llm.push_ok(insights_json(3, 1.0));
    let outcome = braider
        .braid_slot(&(ClusterType::Asset, "BTC".to_string(), 2))
        .await
        .unwrap();
    let BraidOutcome::Braided(level3_id) = outcome else {
        panic!("expected level-3 braid, got {outcome:?}");
    };
    let level3 = store.get(&level3_id).await.unwrap();
    assert_eq!(level3.braid_level, 3);

    let plan_id = composer
        .try_promote(&level3_id)
        .await
        .unwrap()
        .expect("gates pass, plan expected");
    let plan = store.get(&plan_id).await.unwrap();
    assert_eq!(plan.kind, StrandKind::ConditionalPlan);

    let content: ConditionalPlanContent = plan.content_as().unwrap();
    assert!(!content.entry_criteria.is_empty());
    assert!(!content.exit_criteria.is_empty());
    assert!(content.risk.sizing_pct > 0.0);
    assert!(!content.scope.assets.is_empty());
    assert!(content.provenance.braid_ids.contains(&level3_id));
    assert_eq!(content.provenance.review_ids.len(), 12);

    // Promotion is once per braid.
    assert!(composer.try_promote(&level3_id).await.unwrap().is_none());
}
