//! Selection scoring.
//!
//! `S = (accuracy · precision · stability · orthogonality) / cost`, with
//! the enhanced variant `S* = S · (1 + w_res · clip(φ·ρ·surprise, 0, 1))`
//! used by the dispatcher to decide which clusters get LLM time first.
//! Scoring is a function of numeric fields only.

use std::sync::Arc;

use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::errors::CilResult;
use crate::models::{Config, ReviewContent, Scores, Strand, StrandKind};
use crate::ports::ClockPort;
use crate::store::{StrandFilter, StrandStore};

/// Baseline cost model; turnover is expressed in round-trips per day.
pub const BASE_FEES: f64 = 0.001;
pub const SLIPPAGE_PER_TURN: f64 = 0.0005;
pub const TURNOVER_KAPPA: f64 = 0.0001;
/// Floor keeps the ratio finite for dormant strands.
pub const MIN_COST: f64 = 0.001;

#[inline]
pub fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Confidence-weighted directional hit rate.
pub fn accuracy(outcomes: &[(f64, f64)]) -> f64 {
    let weight_sum: f64 = outcomes.iter().map(|(_, c)| c.max(0.0)).sum();
    if weight_sum <= 0.0 {
        return 0.0;
    }
    let hits: f64 = outcomes
        .iter()
        .filter(|(ret, _)| *ret > 0.0)
        .map(|(_, c)| c.max(0.0))
        .sum();
    hits / weight_sum
}

/// t-statistic of the OLS slope of cumulative return against time index.
pub fn slope_t_stat(returns: &[f64]) -> f64 {
    let n = returns.len();
    if n < 3 {
        return 0.0;
    }
    let mut cumulative = Vec::with_capacity(n);
    let mut sum = 0.0;
    for r in returns {
        sum += r;
        cumulative.push(sum);
    }

    let nf = n as f64;
    let x_mean = (nf - 1.0) / 2.0;
    let y_mean = cumulative.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (i, y) in cumulative.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxx += dx * dx;
        sxy += dx * (y - y_mean);
    }
    if sxx == 0.0 {
        return 0.0;
    }
    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;

    let mut sse = 0.0;
    for (i, y) in cumulative.iter().enumerate() {
        let fitted = intercept + slope * i as f64;
        sse += (y - fitted).powi(2);
    }
    let dof = nf - 2.0;
    let se = (sse / dof / sxx).sqrt();
    if se == 0.0 {
        // A perfect line: sign carries all the information.
        return slope.signum() * 10.0;
    }
    slope / se
}

/// Logistic of the regression-slope t-statistic.
pub fn precision(returns: &[f64]) -> f64 {
    logistic(slope_t_stat(returns))
}

/// 1 − normalized standard deviation of the rolling information ratio.
pub fn stability(returns: &[f64]) -> f64 {
    const WINDOW: usize = 5;
    if returns.len() < WINDOW + 1 {
        return 0.5; // not enough history to call it either way
    }
    let mut ratios = Vec::new();
    for chunk in returns.windows(WINDOW) {
        let mean = chunk.iter().sum::<f64>() / WINDOW as f64;
        let var = chunk.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (WINDOW - 1) as f64;
        let std = var.sqrt();
        if std > 0.0 {
            ratios.push(mean / std);
        }
    }
    if ratios.len() < 2 {
        return 0.5;
    }
    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    let var = ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (ratios.len() - 1) as f64;
    let normalized = var.sqrt() / (mean.abs() + 1.0);
    (1.0 - normalized).clamp(0.0, 1.0)
}

/// Pearson correlation; `None` when either side is degenerate.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// 1 − max |corr| against the active cohort; fully orthogonal when alone.
pub fn orthogonality(series: &[f64], cohort: &[Vec<f64>]) -> f64 {
    let max_corr = cohort
        .iter()
        .filter_map(|other| pearson(series, other))
        .map(f64::abs)
        .fold(0.0f64, f64::max);
    (1.0 - max_corr).clamp(0.0, 1.0)
}

pub fn cost(turnover_per_day: f64) -> f64 {
    (BASE_FEES + SLIPPAGE_PER_TURN * turnover_per_day + TURNOVER_KAPPA * turnover_per_day.powi(2))
        .max(MIN_COST)
}

pub fn selection_score(
    accuracy: f64,
    precision: f64,
    stability: f64,
    orthogonality: f64,
    cost: f64,
) -> f64 {
    (accuracy * precision * stability * orthogonality) / cost.max(MIN_COST)
}

/// Dispatcher priority: resonance only ever boosts, never gates.
pub fn enhanced_score(selection: f64, phi: f64, rho: f64, surprise: f64, w_res: f64) -> f64 {
    selection * (1.0 + w_res * (phi * rho * surprise).clamp(0.0, 1.0))
}

#[derive(Clone)]
pub struct SelectionScorer {
    store: StrandStore,
    clock: Arc<dyn ClockPort>,
    config: Config,
}

impl SelectionScorer {
    pub fn new(store: StrandStore, clock: Arc<dyn ClockPort>, config: Config) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Score a review strand from its asset cohort and persist the result.
    pub async fn score_strand(&self, strand_id: &str) -> CilResult<Scores> {
        let strand = self.store.get(strand_id).await?;
        let scores = self.compute(&strand).await?;
        self.store.update_scores(strand_id, &scores).await?;
        debug!(strand = %strand_id, selection = scores.selection, "selection scored");
        Ok(scores)
    }

    async fn compute(&self, strand: &Strand) -> CilResult<Scores> {
        let window_days =
            (self.config.telemetry_window.as_secs() as f64 / 86_400.0).max(1.0 / 24.0);
        let since = self.clock.now()
            - chrono::Duration::from_std(self.config.telemetry_window).unwrap_or_default();

        // Own series: this asset's leaf reviews, oldest first.
        let mut filter = StrandFilter::new()
            .kind(StrandKind::PredictionReview)
            .braid_level(1)
            .since(since)
            .oldest_first();
        if let Some(symbol) = &strand.symbol {
            filter = filter.symbol(symbol.as_str());
        }
        let own_cohort = self.store.query(&filter).await?;

        let mut outcomes: Vec<(f64, f64)> = Vec::with_capacity(own_cohort.len());
        let mut returns: Vec<f64> = Vec::with_capacity(own_cohort.len());
        for member in &own_cohort {
            if let Ok(content) = member.content_as::<ReviewContent>() {
                let confidence = if member.scores.sig_confidence > 0.0 {
                    member.scores.sig_confidence
                } else {
                    0.5
                };
                outcomes.push((content.outcome.realized_return_pct, confidence));
                returns.push(content.outcome.realized_return_pct);
            }
        }

        // Active cohort for orthogonality: other assets' series.
        let all_recent = self
            .store
            .query(
                &StrandFilter::new()
                    .kind(StrandKind::PredictionReview)
                    .braid_level(1)
                    .since(since)
                    .oldest_first(),
            )
            .await?;
        let mut by_symbol: std::collections::BTreeMap<String, Vec<f64>> = Default::default();
        for member in &all_recent {
            let Some(symbol) = member.symbol.clone() else {
                continue;
            };
            if Some(&symbol) == strand.symbol.as_ref() {
                continue;
            }
            if let Ok(content) = member.content_as::<ReviewContent>() {
                by_symbol
                    .entry(symbol)
                    .or_default()
                    .push(content.outcome.realized_return_pct);
            }
        }
        let cohort: Vec<Vec<f64>> = by_symbol.into_values().collect();

        let accuracy_v = accuracy(&outcomes);
        let precision_v = precision(&returns);
        let stability_v = stability(&returns);
        let orthogonality_v = orthogonality(&returns, &cohort);
        let turnover = returns.len() as f64 / window_days;
        let cost_v = cost(turnover);

        // Signal significance: z of the mean return, mapped through the
        // normal CDF.
        let (sig_sigma, sig_confidence) = if returns.len() >= 3 {
            let n = returns.len() as f64;
            let mean = returns.iter().sum::<f64>() / n;
            let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let se = (var / n).sqrt();
            if se > 0.0 {
                let z = mean / se;
                let confidence = Normal::new(0.0, 1.0)
                    .map(|d| d.cdf(z))
                    .unwrap_or(0.5);
                (z, confidence)
            } else {
                (0.0, 0.5)
            }
        } else {
            (0.0, 0.5)
        };

        Ok(Scores {
            sig_sigma,
            sig_confidence,
            accuracy: accuracy_v,
            precision: precision_v,
            stability: stability_v,
            orthogonality: orthogonality_v,
            cost: cost_v,
            selection: selection_score(accuracy_v, precision_v, stability_v, orthogonality_v, cost_v),
        })
    }
}
