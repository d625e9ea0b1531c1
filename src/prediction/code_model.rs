//! Deterministic code prediction.
//!
//! Median-of-neighbors on realized return for the target, 75th-percentile
//! historical drawdown for the stop, each neighbor weighted by similarity
//! times the timeframe weight of its highest-weight timeframe.

use crate::context::HistoricalContext;
use crate::models::{Config, MethodForecast, PatternGroup, ReviewContent};

/// Conservative first-time defaults when no history exists at all.
const FIRST_TIME_TARGET_PCT: f64 = 1.0;
const FIRST_TIME_STOP_PCT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub realized_return_pct: f64,
    pub max_adverse_pct: f64,
    pub weight: f64,
}

/// Flatten exact and similar context into weighted neighbors. Exact
/// matches carry similarity 1.0.
pub fn neighbors_from_context(context: &HistoricalContext, config: &Config) -> Vec<Neighbor> {
    let mut neighbors = Vec::with_capacity(context.exact.len() + context.similar.len());

    let mut push = |content: &ReviewContent, similarity: f64| {
        let tf_weight = content
            .timeframes
            .iter()
            .map(|tf| config.timeframe_weight(*tf))
            .fold(1.0f64, f64::max);
        neighbors.push(Neighbor {
            realized_return_pct: content.outcome.realized_return_pct,
            max_adverse_pct: content.outcome.max_adverse_pct,
            weight: similarity * tf_weight,
        });
    };

    for strand in &context.exact {
        if let Ok(content) = strand.content_as::<ReviewContent>() {
            push(&content, 1.0);
        }
    }
    for m in &context.similar {
        if let Ok(content) = m.review.content_as::<ReviewContent>() {
            push(&content, m.similarity);
        }
    }
    neighbors
}

pub fn code_forecast(
    group: &PatternGroup,
    context: &HistoricalContext,
    config: &Config,
) -> MethodForecast {
    let neighbors = neighbors_from_context(context, config);

    if neighbors.is_empty() {
        return MethodForecast {
            target_return_pct: FIRST_TIME_TARGET_PCT,
            stop_loss_pct: FIRST_TIME_STOP_PCT,
            confidence: (0.2 * group.avg_strength).clamp(0.05, 0.3),
            expected_duration_secs: None,
            rationale: None,
        };
    }

    let returns: Vec<(f64, f64)> = neighbors
        .iter()
        .map(|n| (n.realized_return_pct, n.weight))
        .collect();
    let drawdowns: Vec<(f64, f64)> = neighbors
        .iter()
        .map(|n| (n.max_adverse_pct, n.weight))
        .collect();

    let target = weighted_quantile(&returns, 0.5);
    let stop = weighted_quantile(&drawdowns, 0.75).max(0.05);

    MethodForecast {
        target_return_pct: target,
        stop_loss_pct: stop,
        confidence: context.confidence_level.clamp(0.0, 1.0),
        expected_duration_secs: None,
        rationale: None,
    }
}

/// Weighted quantile over (value, weight) pairs. `q` in [0, 1].
pub fn weighted_quantile(samples: &[(f64, f64)], q: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&q));
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<(f64, f64)> = samples
        .iter()
        .filter(|(v, w)| v.is_finite() && *w > 0.0)
        .copied()
        .collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    let threshold = q * total;
    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= threshold {
            return *value;
        }
    }
    sorted.last().map(|(v, _)| *v).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_of_uniform_weights_is_plain_quantile() {
        let samples: Vec<(f64, f64)> = [1.0, 2.0, 3.0, 4.0, 5.0]
            .iter()
            .map(|v| (*v, 1.0))
            .collect();
        assert_eq!(weighted_quantile(&samples, 0.5), 3.0);
        assert_eq!(weighted_quantile(&samples, 1.0), 5.0);
    }

    #[test]
    fn heavier_weights_pull_the_median() {
        let samples = vec![(1.0, 1.0), (2.0, 1.0), (10.0, 10.0)];
        assert_eq!(weighted_quantile(&samples, 0.5), 10.0);
    }

    #[test]
    fn empty_samples_yield_zero() {
        assert_eq!(weighted_quantile(&[], 0.5), 0.0);
    }
}
