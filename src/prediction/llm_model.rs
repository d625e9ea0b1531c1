//! LLM prediction path.
//!
//! The model is constrained to a line-oriented KEY=VALUE DSL with numeric
//! fields only; the single free-text field is a short rationale that is
//! stored but never scored. Unknown keys reject the whole response so a
//! drifting model surfaces as `LlmMalformed` instead of silent garbage.

use crate::context::HistoricalContext;
use crate::errors::{CilError, CilResult};
use crate::models::{MethodForecast, PatternGroup, ReviewContent};

pub const PREDICTION_SYSTEM_PROMPT: &str = "\
You are a numeric forecasting engine for pattern groups. Respond with \
KEY=VALUE lines only, one per line, no prose outside RATIONALE:\n\
TARGET_PCT=<expected favorable move, percent>\n\
STOP_PCT=<adverse move to abandon at, percent, positive>\n\
CONFIDENCE=<0..1>\n\
DURATION_SECS=<expected seconds to outcome, optional>\n\
RATIONALE=<one sentence referencing only the supplied numbers>\n\
Never explain outcomes by market events, news, or actors. Base every \
number on the historical outcomes provided.";

/// Numeric digest of the group and its context. Nothing narrative goes in.
pub fn build_prediction_prompt(group: &PatternGroup, context: &HistoricalContext) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!(
        "GROUP shape={} asset={} pattern_types={} timeframes={} cycles={} avg_strength={:.3}\n",
        group.shape.as_str(),
        group.symbol,
        group.pattern_types.join(","),
        group
            .timeframes
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(","),
        group.cycle_count,
        group.avg_strength,
    ));
    prompt.push_str(&format!(
        "CONTEXT exact={} similar={} confidence={:.3}\n",
        context.exact_count, context.similar_count, context.confidence_level
    ));

    for (label, strand, similarity) in context
        .exact
        .iter()
        .map(|s| ("EXACT", s, 1.0))
        .chain(context.similar.iter().map(|m| ("SIMILAR", &m.review, m.similarity)))
        .take(24)
    {
        if let Ok(content) = strand.content_as::<ReviewContent>() {
            prompt.push_str(&format!(
                "{label} sim={:.2} ret={:.3} mfe={:.3} mae={:.3} hit_target={} hit_stop={}\n",
                similarity,
                content.outcome.realized_return_pct,
                content.outcome.max_favorable_pct,
                content.outcome.max_adverse_pct,
                content.outcome.hit_target,
                content.outcome.hit_stop,
            ));
        }
    }
    prompt
}

/// Parse the KEY=VALUE response into a forecast.
pub fn parse_forecast_dsl(raw: &str) -> CilResult<MethodForecast> {
    let mut target_pct: Option<f64> = None;
    let mut stop_pct: Option<f64> = None;
    let mut confidence: Option<f64> = None;
    let mut duration_secs: Option<u64> = None;
    let mut rationale: Option<String> = None;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim().to_ascii_uppercase();
        let val = v.trim();

        match key.as_str() {
            "TARGET_PCT" => {
                target_pct = val
                    .parse::<f64>()
                    .ok()
                    .filter(|x| x.is_finite())
                    .map(|x| x.clamp(-50.0, 50.0));
            }
            "STOP_PCT" => {
                stop_pct = val
                    .parse::<f64>()
                    .ok()
                    .filter(|x| x.is_finite() && *x >= 0.0)
                    .map(|x| x.clamp(0.0, 50.0));
            }
            "CONFIDENCE" => {
                confidence = val
                    .parse::<f64>()
                    .ok()
                    .filter(|x| x.is_finite())
                    .map(|x| x.clamp(0.0, 1.0));
            }
            "DURATION_SECS" => {
                duration_secs = val.parse::<u64>().ok();
            }
            "RATIONALE" => {
                if !val.is_empty() {
                    rationale = Some(val.chars().take(160).collect());
                }
            }
            _ => return Err(CilError::LlmMalformed(format!("unknown key in dsl: {key}"))),
        }
    }

    let target_return_pct =
        target_pct.ok_or_else(|| CilError::LlmMalformed("missing TARGET_PCT".to_string()))?;
    let stop_loss_pct =
        stop_pct.ok_or_else(|| CilError::LlmMalformed("missing STOP_PCT".to_string()))?;
    let confidence =
        confidence.ok_or_else(|| CilError::LlmMalformed("missing CONFIDENCE".to_string()))?;

    Ok(MethodForecast {
        target_return_pct,
        stop_loss_pct,
        confidence,
        expected_duration_secs: duration_secs,
        rationale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_forecast() {
        let raw = "TARGET_PCT=1.8\nSTOP_PCT=0.6\nCONFIDENCE=0.72\nDURATION_SECS=5400\nRATIONALE=median of 7 neighbors is positive";
        let forecast = parse_forecast_dsl(raw).unwrap();
        assert_eq!(forecast.target_return_pct, 1.8);
        assert_eq!(forecast.stop_loss_pct, 0.6);
        assert_eq!(forecast.confidence, 0.72);
        assert_eq!(forecast.expected_duration_secs, Some(5400));
    }

    #[test]
    fn unknown_key_rejected() {
        let raw = "TARGET_PCT=1.0\nSTOP_PCT=0.5\nCONFIDENCE=0.5\nVIBES=GOOD";
        assert!(matches!(
            parse_forecast_dsl(raw),
            Err(CilError::LlmMalformed(_))
        ));
    }

    #[test]
    fn missing_required_field_rejected() {
        let raw = "TARGET_PCT=1.0\nCONFIDENCE=0.5";
        assert!(parse_forecast_dsl(raw).is_err());
    }

    #[test]
    fn out_of_range_values_clamped() {
        let raw = "TARGET_PCT=900\nSTOP_PCT=120\nCONFIDENCE=7";
        let forecast = parse_forecast_dsl(raw).unwrap();
        assert_eq!(forecast.target_return_pct, 50.0);
        assert_eq!(forecast.stop_loss_pct, 50.0);
        assert_eq!(forecast.confidence, 1.0);
    }
}
