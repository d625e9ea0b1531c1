//! Telemetry worker.
//!
//! Recomputes a strand's running estimates over the configured window from
//! its review cohort: success, confirmation (target hits), contradiction
//! (stop hits), and surprise (own outcome's distance from the cohort mean,
//! in cohort standard deviations, squashed to [0, 1]). Uses Welford's
//! online algorithm for numerically stable variance.

use std::sync::Arc;

use tracing::debug;

use crate::errors::CilResult;
use crate::models::{Config, ReviewContent, Strand, StrandKind, Telemetry};
use crate::ports::ClockPort;
use crate::store::{StrandFilter, StrandStore};

#[derive(Clone)]
pub struct TelemetryWorker {
    store: StrandStore,
    clock: Arc<dyn ClockPort>,
    config: Config,
}

#[derive(Default)]
struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    #[inline]
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    #[inline]
    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

impl TelemetryWorker {
    pub fn new(store: StrandStore, clock: Arc<dyn ClockPort>, config: Config) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Recompute and persist telemetry for one strand. Returns the new
    /// estimates.
    pub async fn recompute(&self, strand_id: &str) -> CilResult<Telemetry> {
        let strand = self.store.get(strand_id).await?;
        let telemetry = self.compute(&strand).await?;
        self.store.update_telemetry(strand_id, &telemetry).await?;
        debug!(
            strand = %strand_id,
            success = telemetry.success_rate,
            surprise = telemetry.surprise,
            "telemetry updated"
        );
        Ok(telemetry)
    }

    async fn compute(&self, strand: &Strand) -> CilResult<Telemetry> {
        let since = self.clock.now()
            - chrono::Duration::from_std(self.config.telemetry_window).unwrap_or_default();

        let mut filter = StrandFilter::new()
            .kind(StrandKind::PredictionReview)
            .braid_level(1)
            .since(since);
        if let Some(symbol) = &strand.symbol {
            filter = filter.symbol(symbol.as_str());
        }
        let cohort = self.store.query(&filter).await?;

        let mut successes = 0usize;
        let mut confirmations = 0usize;
        let mut contradictions = 0usize;
        let mut total = 0usize;
        let mut stats = RollingStats::default();

        for member in &cohort {
            if let Ok(content) = member.content_as::<ReviewContent>() {
                total += 1;
                if content.outcome.success {
                    successes += 1;
                }
                if content.outcome.hit_target {
                    confirmations += 1;
                }
                if content.outcome.hit_stop {
                    contradictions += 1;
                }
                stats.update(content.outcome.realized_return_pct);
            }
        }

        if total == 0 {
            return Ok(Telemetry {
                success_rate: 0.0,
                confirmation_rate: 0.0,
                contradiction_rate: 0.0,
                surprise: 0.5, // no history: everything is surprising
            });
        }

        let own_return = strand
            .content_as::<ReviewContent>()
            .ok()
            .map(|c| c.outcome.realized_return_pct);
        let surprise = match own_return {
            Some(own) => {
                let std = stats.std_dev();
                if std > 0.0 {
                    let z = (own - stats.mean).abs() / std;
                    (z / (1.0 + z)).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            None => 0.5,
        };

        Ok(Telemetry {
            success_rate: successes as f64 / total as f64,
            confirmation_rate: confirmations as f64 / total as f64,
            contradiction_rate: contradictions as f64 / total as f64,
            surprise,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use crate::ports::WallClock;

    async fn seed_review(store: &StrandStore, ret: f64) -> String {
        let prediction = Strand::new(StrandKind::Prediction)
            .with_symbol("BTC")
            .with_content(&serde_json::json!({"group_signature": "sig-tel"}))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();
        store
            .update_tracking(&prediction_id, TrackingStatus::Completed)
            .await
            .unwrap();
        let content = ReviewContent {
            prediction_id,
            outcome: Outcome {
                realized_return_pct: ret,
                max_favorable_pct: ret.abs() + 1.0,
                max_adverse_pct: ret.abs() + 1.0,
                hit_target: ret > 0.0,
                hit_stop: ret < 0.0,
                success: ret > 0.0,
                ..Outcome::default()
            },
            plan_vs_reality: PlanVsReality::default(),
            method_comparison: None,
            group_signature: "sig-tel".to_string(),
            method: "code".to_string(),
            group_type: GroupShape::SingleSingle,
            pattern_types: vec!["volume_spike".to_string()],
            timeframes: vec![Timeframe::H1],
            cycle_count: 1,
            original_pattern_strand_ids: vec![],
            braid: None,
        };
        let review = Strand::new(StrandKind::PredictionReview)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&content);
        store.append(&review).await.unwrap()
    }

    #[tokio::test]
    async fn rates_reflect_cohort() {
        let store = StrandStore::in_memory().unwrap();
        let id = seed_review(&store, 1.0).await;
        seed_review(&store, 2.0).await;
        seed_review(&store, -1.0).await;

        let worker =
            TelemetryWorker::new(store.clone(), Arc::new(WallClock::new()), Config::default());
        let telemetry = worker.recompute(&id).await.unwrap();
        assert!((telemetry.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((telemetry.confirmation_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((telemetry.contradiction_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(telemetry.surprise >= 0.0 && telemetry.surprise <= 1.0);

        // Persisted on the strand.
        let strand = store.get(&id).await.unwrap();
        assert_eq!(strand.telemetry, telemetry);
    }

    #[tokio::test]
    async fn outlier_is_more_surprising_than_typical() {
        let store = StrandStore::in_memory().unwrap();
        let typical = seed_review(&store, 1.0).await;
        seed_review(&store, 1.1).await;
        seed_review(&store, 0.9).await;
        let outlier = seed_review(&store, 8.0).await;

        let worker =
            TelemetryWorker::new(store.clone(), Arc::new(WallClock::new()), Config::default());
        let typical_t = worker.recompute(&typical).await.unwrap();
        let outlier_t = worker.recompute(&outlier).await.unwrap();
        assert!(outlier_t.surprise > typical_t.surprise);
    }
}
