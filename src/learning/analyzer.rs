//! LLM learning analyzer.
//!
//! Prompts the model over a cluster's reviews and extracts a stats-focused
//! lesson. The contract is strict: JSON only, statements grounded in the
//! supplied numbers, explicit uncertainty allowed and encouraged. Responses
//! that reach for market-cause narratives, or whose echoed aggregates
//! disagree with the supplied reviews, are rejected as `LlmMalformed` so
//! the caller retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::errors::{CilError, CilResult};
use crate::models::{ClusterType, Config, LearningInsights, ReviewContent, Strand};
use crate::ports::{LlmPort, LlmRequest};
use crate::store::StrandStore;

/// Tolerated disagreement between the analyzer's echoed success rate and
/// the one computed from the reviews.
const SUCCESS_RATE_EPSILON: f64 = 0.05;

/// Bare market-cause vocabulary. A response mentioning any of these in its
/// findings is refusing the numeric contract.
const NARRATIVE_DENYLIST: [&str; 10] = [
    "fed", "fomc", "news", "sentiment", "macro", "etf", "election", "regulation", "geopolit",
    "whale",
];

pub const LEARNING_SYSTEM_PROMPT: &str = "\
You are a statistics-only learning analyzer for clusters of resolved \
trading predictions. Respond with one JSON object and nothing else:\n\
{\"patterns_observed\":[],\"mistakes_identified\":[],\"success_factors\":[],\
\"lessons_learned\":[],\"recommendations\":[],\
\"uncertainty\":{\"pattern_clarity\":0.0,\"data_sufficiency\":0.0,\"confidence\":0.0},\
\"member_count\":0,\"success_rate\":0.0}\n\
Every statement must be grounded in the numbers supplied. Echo member_count \
and success_rate exactly as computed from the rows. You may say \
\"insufficient signal\" and report low confidence. Never explain outcomes \
by market events, news, actors, or sentiment.";

/// Numeric aggregates of the cluster members, computed locally and used to
/// cross-check the analyzer's echo.
#[derive(Debug, Clone, Default)]
pub struct ClusterAggregates {
    pub member_count: usize,
    pub success_rate: f64,
    pub avg_confidence: f64,
    pub avg_return_pct: f64,
}

pub fn aggregate(members: &[Strand]) -> ClusterAggregates {
    let mut successes = 0usize;
    let mut return_sum = 0.0;
    let mut confidence_sum = 0.0;
    let mut counted = 0usize;

    for member in members {
        if let Ok(content) = member.content_as::<ReviewContent>() {
            counted += 1;
            if content.outcome.success {
                successes += 1;
            }
            return_sum += content.outcome.realized_return_pct;
            let confidence = member.scores.sig_confidence;
            confidence_sum += if confidence > 0.0 { confidence } else { 0.5 };
        }
    }

    if counted == 0 {
        return ClusterAggregates::default();
    }
    ClusterAggregates {
        member_count: counted,
        success_rate: successes as f64 / counted as f64,
        avg_confidence: confidence_sum / counted as f64,
        avg_return_pct: return_sum / counted as f64,
    }
}

pub fn build_learning_prompt(
    cluster_type: ClusterType,
    cluster_key: &str,
    members: &[Strand],
    aggregates: &ClusterAggregates,
) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(&format!(
        "CLUSTER family={} key={} members={} success_rate={:.4} avg_return={:.4}\n",
        cluster_type.as_str(),
        cluster_key,
        aggregates.member_count,
        aggregates.success_rate,
        aggregates.avg_return_pct,
    ));
    for (i, member) in members.iter().enumerate() {
        if let Ok(content) = member.content_as::<ReviewContent>() {
            prompt.push_str(&format!(
                "REVIEW {i} shape={} types={} ret={:.3} mfe={:.3} mae={:.3} hit_target={} hit_stop={} method={} cycles={}\n",
                content.group_type.as_str(),
                content.pattern_types.join(","),
                content.outcome.realized_return_pct,
                content.outcome.max_favorable_pct,
                content.outcome.max_adverse_pct,
                content.outcome.hit_target,
                content.outcome.hit_stop,
                content.method,
                content.cycle_count,
            ));
        }
    }
    prompt
}

/// Strip optional markdown fences and parse the JSON body.
pub fn parse_insights(raw: &str) -> CilResult<LearningInsights> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str(body).map_err(|e| CilError::LlmMalformed(format!("insights parse: {e}")))
}

/// Reject disallowed content and numeric disagreement.
pub fn validate_insights(
    insights: &LearningInsights,
    aggregates: &ClusterAggregates,
) -> CilResult<()> {
    let all_statements = insights
        .patterns_observed
        .iter()
        .chain(&insights.mistakes_identified)
        .chain(&insights.success_factors)
        .chain(&insights.lessons_learned)
        .chain(&insights.recommendations);
    for statement in all_statements {
        let lower = statement.to_lowercase();
        for term in NARRATIVE_DENYLIST {
            if lower.contains(term) {
                return Err(CilError::LlmMalformed(format!(
                    "market narrative rejected: \"{term}\" in {statement:?}"
                )));
            }
        }
    }

    if insights.member_count != aggregates.member_count {
        return Err(CilError::LlmMalformed(format!(
            "member_count echo {} != {}",
            insights.member_count, aggregates.member_count
        )));
    }
    if (insights.success_rate - aggregates.success_rate).abs() > SUCCESS_RATE_EPSILON {
        return Err(CilError::LlmMalformed(format!(
            "success_rate echo {:.4} != {:.4}",
            insights.success_rate, aggregates.success_rate
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct LearningAnalyzer {
    llm: Arc<dyn LlmPort>,
    store: StrandStore,
    config: Config,
}

impl LearningAnalyzer {
    pub fn new(llm: Arc<dyn LlmPort>, store: StrandStore, config: Config) -> Self {
        Self { llm, store, config }
    }

    /// One analysis attempt. Transport and contract failures surface as
    /// typed errors; the retry schedule lives with the caller.
    pub async fn analyze(
        &self,
        cluster_type: ClusterType,
        cluster_key: &str,
        members: &[Strand],
    ) -> CilResult<(LearningInsights, ClusterAggregates)> {
        let aggregates = aggregate(members);
        if aggregates.member_count == 0 {
            return Err(CilError::ValidationFailure(
                "no readable reviews in cluster".to_string(),
            ));
        }

        let request = LlmRequest {
            system: LEARNING_SYSTEM_PROMPT.to_string(),
            user: build_learning_prompt(cluster_type, cluster_key, members, &aggregates),
            max_tokens: 768,
            temperature: 0.2,
            deadline: Duration::from_millis(self.config.llm_deadline_ms),
        };

        let output = self.llm.complete(request).await?;
        let tokens = output.usage.total_tokens.unwrap_or(0);
        let _ = self.store.record_llm_usage(1, tokens).await;

        let insights = parse_insights(&output.content)?;
        validate_insights(&insights, &aggregates)?;
        debug!(
            family = cluster_type.as_str(),
            key = cluster_key,
            members = aggregates.member_count,
            confidence = insights.uncertainty.confidence,
            "cluster analyzed"
        );
        Ok((insights, aggregates))
    }
}
