//! Outcome analyzer.
//!
//! Resolves a completed prediction against the observed OHLCV window and
//! produces the numeric review payload: realized return, excursions,
//! first-hit ordering, plan-vs-reality deltas and the code-vs-LLM method
//! comparison. No narrative attribution is ever stored.
//!
//! Same-bar ambiguity rule: when one bar crosses both the target and the
//! stop, the stop is deemed hit first (adverse-first) and the ambiguity is
//! recorded in `plan_vs_reality`.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::errors::CilResult;
use crate::models::{
    MethodComparison, Outcome, PlanVsReality, PredictionContent, ReviewContent, Strand, StrandKind,
    TrackingStatus,
};
use crate::ports::{Candle, MarketDataPort};

pub const TAG_LEARNING: &str = "cil:learning";

/// Result of walking the price window for one prediction.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: Outcome,
    pub plan_vs_reality: PlanVsReality,
    pub exit_time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OutcomeAnalyzer {
    market: Arc<dyn MarketDataPort>,
    success_threshold_pct: f64,
}

impl OutcomeAnalyzer {
    pub fn new(market: Arc<dyn MarketDataPort>, success_threshold_pct: f64) -> Self {
        Self {
            market,
            success_threshold_pct,
        }
    }

    /// Inspect an active prediction. Returns `Some(review strand)` when a
    /// completion condition has been met, `None` while still in flight.
    pub async fn try_resolve(
        &self,
        prediction: &Strand,
        now: DateTime<Utc>,
    ) -> CilResult<Option<Strand>> {
        debug_assert_eq!(prediction.kind, StrandKind::Prediction);
        let content: PredictionContent = prediction.content_as()?;

        let horizon =
            prediction.created_at + ChronoDuration::seconds(content.max_hold_secs as i64);
        let window_end = now.min(horizon);

        let bars = self
            .market
            .fetch_ohlcv(
                &content.group.symbol,
                content.group.anchor_timeframe,
                prediction.created_at,
                window_end,
            )
            .await
            .unwrap_or_default();

        let Some(resolution) =
            resolve(&content, prediction.created_at, &bars, now, horizon, self.success_threshold_pct)
        else {
            return Ok(None);
        };

        let method_comparison = content.llm_prediction.as_ref().map(|llm| {
            let realized = resolution.outcome.realized_return_pct;
            let code_error = (content.code_prediction.target_return_pct - realized).abs();
            let llm_error = (llm.target_return_pct - realized).abs();
            MethodComparison {
                better_method: if code_error <= llm_error { "code" } else { "llm" }.to_string(),
                code_error_pct: code_error,
                llm_error_pct: llm_error,
            }
        });
        let method = method_comparison
            .as_ref()
            .map(|c| c.better_method.clone())
            .unwrap_or_else(|| "code".to_string());

        let review_content = ReviewContent {
            prediction_id: prediction.id.clone(),
            outcome: resolution.outcome,
            plan_vs_reality: resolution.plan_vs_reality,
            method_comparison,
            group_signature: content.group_signature.clone(),
            method,
            group_type: content.group.shape,
            pattern_types: content.group.pattern_types.clone(),
            timeframes: content.group.timeframes.clone(),
            cycle_count: content.group.cycle_count,
            original_pattern_strand_ids: content.group.pattern_strand_ids.clone(),
            braid: None,
        };

        let review = Strand::new(StrandKind::PredictionReview)
            .with_created_at(now.max(resolution.exit_time))
            .with_symbol(content.group.symbol.clone())
            .with_timeframe(content.group.anchor_timeframe)
            .with_content(&review_content)
            .with_tag(TAG_LEARNING)
            .with_lineage(vec![prediction.id.clone()], "review of resolved prediction");

        debug!(
            prediction = %prediction.id,
            realized = review_content.outcome.realized_return_pct,
            hit_target = review_content.outcome.hit_target,
            hit_stop = review_content.outcome.hit_stop,
            "prediction resolved"
        );
        Ok(Some(review))
    }
}

/// Pure window walk; split out for direct testing.
pub fn resolve(
    content: &PredictionContent,
    entry_time: DateTime<Utc>,
    bars: &[Candle],
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
    success_threshold_pct: f64,
) -> Option<Resolution> {
    let entry = content.entry_price;
    if entry <= 0.0 {
        return None;
    }

    let mut max_high = entry;
    let mut min_low = entry;
    let mut last_close: Option<f64> = None;
    let mut hit: Option<(&'static str, Candle, bool)> = None;

    for bar in bars {
        if bar.ts < entry_time {
            continue;
        }
        let crosses_target = bar.high >= content.target_price;
        let crosses_stop = bar.low <= content.stop_loss;
        // Excursions up to and including the resolving bar.
        max_high = max_high.max(bar.high);
        min_low = min_low.min(bar.low);
        last_close = Some(bar.close);

        if crosses_stop {
            hit = Some(("stop", *bar, crosses_target));
            break;
        }
        if crosses_target {
            hit = Some(("target", *bar, false));
            break;
        }
    }

    let horizon_elapsed = now >= horizon;
    if hit.is_none() && !horizon_elapsed {
        return None;
    }

    let (realized_return_pct, hit_target, hit_stop, first_hit, same_bar, exit_time) = match hit {
        Some(("stop", bar, ambiguous)) => (
            (content.stop_loss - entry) / entry * 100.0,
            ambiguous,
            true,
            Some("stop".to_string()),
            ambiguous,
            bar.ts,
        ),
        Some((_, bar, _)) => (
            (content.target_price - entry) / entry * 100.0,
            true,
            false,
            Some("target".to_string()),
            false,
            bar.ts,
        ),
        None => {
            // Horizon elapsed: mark to the last observed close. With no
            // bars in the window there is nothing to mark against; the
            // tracker expires the prediction instead of fabricating a
            // flat outcome.
            let Some(close) = last_close else {
                return None;
            };
            (
                (close - entry) / entry * 100.0,
                false,
                false,
                None,
                false,
                horizon,
            )
        }
    };

    let mut max_favorable_pct = (max_high - entry) / entry * 100.0;
    let mut max_adverse_pct = (entry - min_low) / entry * 100.0;
    // Excursion bounds must bracket the realized return.
    max_favorable_pct = max_favorable_pct.max(realized_return_pct);
    max_adverse_pct = max_adverse_pct.max(-realized_return_pct);

    let better_entry_available_pct = ((entry - min_low) / entry * 100.0).max(0.0);
    let time_to_outcome_secs = (exit_time - entry_time).num_seconds().max(0) as u64;

    let outcome = Outcome {
        realized_return_pct,
        max_favorable_pct,
        max_adverse_pct,
        time_to_outcome_secs,
        hit_target,
        hit_stop,
        first_hit,
        success: realized_return_pct > success_threshold_pct,
    };

    let plan_vs_reality = PlanVsReality {
        target_delta_pct: content.code_prediction.target_return_pct - realized_return_pct,
        stop_delta_pct: content.code_prediction.stop_loss_pct - max_adverse_pct,
        duration_delta_secs: content
            .code_prediction
            .expected_duration_secs
            .map(|d| d as i64 - time_to_outcome_secs as i64)
            .unwrap_or(0),
        better_entry_available_pct,
        same_bar_ambiguity: same_bar,
    };

    Some(Resolution {
        outcome,
        plan_vs_reality,
        exit_time,
    })
}
