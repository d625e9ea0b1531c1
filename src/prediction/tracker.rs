//! Prediction resolution tracker.
//!
//! The sweep is the single writer of prediction terminal states: the
//! status transition and the review append commit in one store
//! transaction, so downstream readers never observe one without the other.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use crate::errors::CilResult;
use crate::models::{PredictionContent, StrandKind, TrackingStatus};
use crate::ports::ClockPort;
use crate::prediction::OutcomeAnalyzer;
use crate::store::{StrandFilter, StrandStore};

#[derive(Clone)]
pub struct PredictionTracker {
    store: StrandStore,
    analyzer: OutcomeAnalyzer,
    clock: Arc<dyn ClockPort>,
}

impl PredictionTracker {
    pub fn new(store: StrandStore, analyzer: OutcomeAnalyzer, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            store,
            analyzer,
            clock,
        }
    }

    /// Scan active predictions for completion conditions. Returns the ids
    /// of the reviews written this pass.
    pub async fn sweep(&self) -> CilResult<Vec<String>> {
        let active = self
            .store
            .query(
                &StrandFilter::new()
                    .kind(StrandKind::Prediction)
                    .tracking_status(TrackingStatus::Active),
            )
            .await?;

        let now = self.clock.now();
        let mut review_ids = Vec::new();

        for prediction in active {
            match self.analyzer.try_resolve(&prediction, now).await {
                Ok(Some(review)) => {
                    match self
                        .store
                        .resolve_prediction(&prediction.id, TrackingStatus::Completed, Some(&review))
                        .await
                    {
                        Ok(Some(review_id)) => review_ids.push(review_id),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(prediction = %prediction.id, error = %e, "resolution commit failed");
                        }
                    }
                }
                Ok(None) => {
                    // Past-horizon predictions with no resolvable data expire
                    // without a review.
                    if let Ok(content) = prediction.content_as::<PredictionContent>() {
                        let horizon = prediction.created_at
                            + ChronoDuration::seconds(content.max_hold_secs as i64);
                        if now >= horizon {
                            if let Err(e) = self
                                .store
                                .resolve_prediction(&prediction.id, TrackingStatus::Expired, None)
                                .await
                            {
                                warn!(prediction = %prediction.id, error = %e, "expiry failed");
                            } else {
                                info!(prediction = %prediction.id, "prediction expired without data");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(prediction = %prediction.id, error = %e, "resolution check failed");
                }
            }
        }

        if !review_ids.is_empty() {
            metrics::counter!("cil_predictions_resolved", review_ids.len() as u64);
        }
        Ok(review_ids)
    }

    /// Cancel a still-active prediction (invalidation of its source group).
    /// Idempotent: cancelling a terminal prediction is a no-op. A cancelled
    /// prediction never produces a review.
    pub async fn cancel(&self, prediction_id: &str) -> CilResult<()> {
        let prediction = self.store.get(prediction_id).await?;
        match prediction.tracking_status {
            Some(TrackingStatus::Active) => {
                self.store
                    .resolve_prediction(prediction_id, TrackingStatus::Cancelled, None)
                    .await?;
                info!(prediction = %prediction_id, "prediction cancelled");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use crate::ports::{Candle, SimClock, SimMarketData};
    use chrono::{TimeZone, Utc};

    fn prediction_content(entry: f64, target: f64, stop: f64) -> PredictionContent {
        PredictionContent {
            group: PatternGroup {
                shape: GroupShape::SingleSingle,
                symbol: "BTC".to_string(),
                pattern_strand_ids: vec!["p1".to_string()],
                pattern_types: vec!["volume_spike".to_string()],
                timeframes: vec![Timeframe::H1],
                cycle_count: 1,
                group_signature: "sig-track".to_string(),
                anchor_timeframe: Timeframe::H1,
                avg_strength: 0.5,
            },
            group_signature: "sig-track".to_string(),
            code_prediction: MethodForecast {
                target_return_pct: 2.0,
                stop_loss_pct: 1.0,
                confidence: 0.5,
                expected_duration_secs: None,
                rationale: None,
            },
            llm_prediction: None,
            entry_price: entry,
            target_price: target,
            stop_loss: stop,
            max_hold_secs: 20 * 3600,
            match_quality: MatchQuality::FirstTime,
            exact_count: 0,
            similar_count: 0,
            confidence_level: 0.0,
        }
    }

    #[tokio::test]
    async fn sweep_resolves_and_reviews_atomically() {
        let store = StrandStore::in_memory().unwrap();
        let market = SimMarketData::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(SimClock::at(t0));

        let prediction = Strand::new(StrandKind::Prediction)
            .with_created_at(t0)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&prediction_content(100.0, 102.0, 99.0))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();

        market.push_candle(
            "BTC",
            Timeframe::H1,
            Candle {
                ts: t0 + ChronoDuration::hours(1),
                open: 100.0,
                high: 102.5,
                low: 99.5,
                close: 102.0,
                volume: 5.0,
            },
        );
        clock.advance_secs(2 * 3600);

        let analyzer = OutcomeAnalyzer::new(market, 0.0);
        let tracker = PredictionTracker::new(store.clone(), analyzer, clock);
        let reviews = tracker.sweep().await.unwrap();
        assert_eq!(reviews.len(), 1);

        let prediction = store.get(&prediction_id).await.unwrap();
        assert_eq!(prediction.tracking_status, Some(TrackingStatus::Completed));

        let review = store.get(&reviews[0]).await.unwrap();
        assert_eq!(review.kind, StrandKind::PredictionReview);
        assert_eq!(review.braid_level, 1);
        let content: ReviewContent = review.content_as().unwrap();
        assert_eq!(content.prediction_id, prediction_id);
        assert!(content.outcome.hit_target);

        // Second sweep finds nothing active; no duplicate review.
        assert!(tracker.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dataless_horizon_expires_without_review() {
        let store = StrandStore::in_memory().unwrap();
        // No series configured at all: every fetch fails, no bar ever
        // becomes observable.
        let market = SimMarketData::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(SimClock::at(t0));

        let prediction = Strand::new(StrandKind::Prediction)
            .with_created_at(t0)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&prediction_content(100.0, 102.0, 99.0))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();

        let analyzer = OutcomeAnalyzer::new(market, 0.0);
        let tracker = PredictionTracker::new(store.clone(), analyzer, clock.clone());

        // Inside the hold window: still tracking.
        clock.advance_secs(2 * 3600);
        assert!(tracker.sweep().await.unwrap().is_empty());
        let prediction = store.get(&prediction_id).await.unwrap();
        assert_eq!(prediction.tracking_status, Some(TrackingStatus::Active));

        // Past the horizon with nothing observed: expired, no review.
        clock.advance_secs(19 * 3600);
        assert!(tracker.sweep().await.unwrap().is_empty());
        let prediction = store.get(&prediction_id).await.unwrap();
        assert_eq!(prediction.tracking_status, Some(TrackingStatus::Expired));
        let reviews = store
            .query(&StrandFilter::new().kind(StrandKind::PredictionReview))
            .await
            .unwrap();
        assert!(reviews.is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_blocks_review() {
        let store = StrandStore::in_memory().unwrap();
        let market = SimMarketData::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(SimClock::at(t0));

        let prediction = Strand::new(StrandKind::Prediction)
            .with_created_at(t0)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&prediction_content(100.0, 102.0, 99.0))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();

        let analyzer = OutcomeAnalyzer::new(market.clone(), 0.0);
        let tracker = PredictionTracker::new(store.clone(), analyzer, clock.clone());

        tracker.cancel(&prediction_id).await.unwrap();
        tracker.cancel(&prediction_id).await.unwrap(); // idempotent

        // Even with a winning bar later, a cancelled prediction stays silent.
        market.push_candle(
            "BTC",
            Timeframe::H1,
            Candle {
                ts: t0 + ChronoDuration::hours(1),
                open: 100.0,
                high: 103.0,
                low: 99.9,
                close: 102.5,
                volume: 5.0,
            },
        );
        clock.advance_secs(2 * 3600);
        assert!(tracker.sweep().await.unwrap().is_empty());
        let prediction = store.get(&prediction_id).await.unwrap();
        assert_eq!(prediction.tracking_status, Some(TrackingStatus::Cancelled));
    }
}
