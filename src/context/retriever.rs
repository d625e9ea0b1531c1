//! Context retriever.
//!
//! Given a live group, returns the exact-signature history for the same
//! asset plus similarity-scored neighbors, and derives a saturating
//! confidence level from the counts and aggregate historical success.

use tracing::debug;

use crate::context::similarity;
use crate::errors::{CilError, CilResult};
use crate::models::{Config, PatternGroup, ReviewContent, Strand, StrandKind};
use crate::store::{StrandFilter, StrandStore};

#[cfg(feature = "embeddings")]
use crate::ports::embedding::EmbeddingPort;
#[cfg(feature = "embeddings")]
use std::sync::Arc;

/// Cap on candidates scanned for similarity per retrieval.
const SIMILAR_CANDIDATE_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub review: Strand,
    pub similarity: f64,
    pub differences: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoricalContext {
    pub exact: Vec<Strand>,
    pub similar: Vec<SimilarMatch>,
    pub exact_count: usize,
    pub similar_count: usize,
    pub confidence_level: f64,
}

#[derive(Clone)]
pub struct ContextRetriever {
    store: StrandStore,
    config: Config,
    #[cfg(feature = "embeddings")]
    embedder: Option<Arc<dyn EmbeddingPort>>,
}

impl ContextRetriever {
    pub fn new(store: StrandStore, config: Config) -> Self {
        Self {
            store,
            config,
            #[cfg(feature = "embeddings")]
            embedder: None,
        }
    }

    #[cfg(feature = "embeddings")]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingPort>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn retrieve(&self, group: &PatternGroup) -> CilResult<HistoricalContext> {
        let exact = self
            .store
            .query(
                &StrandFilter::new()
                    .kind(StrandKind::PredictionReview)
                    .braid_level(1)
                    .symbol(group.symbol.as_str())
                    .group_signature(group.group_signature.as_str()),
            )
            .await
            .map_err(|e| CilError::ContextUnavailable(e.to_string()))?;

        let candidates = self
            .store
            .query(
                &StrandFilter::new()
                    .kind(StrandKind::PredictionReview)
                    .braid_level(1)
                    .symbol(group.symbol.as_str())
                    .limit(SIMILAR_CANDIDATE_LIMIT),
            )
            .await
            .map_err(|e| CilError::ContextUnavailable(e.to_string()))?;

        let mut similar = Vec::new();
        for candidate in candidates {
            let content: ReviewContent = match candidate.content_as() {
                Ok(c) => c,
                Err(_) => continue,
            };
            if content.group_signature == group.group_signature {
                continue; // already in the exact set
            }
            // Only overlapping pattern-type sets are candidates at all.
            if !content
                .pattern_types
                .iter()
                .any(|t| group.pattern_types.contains(t))
            {
                continue;
            }
            #[allow(unused_mut)]
            let mut score = similarity::score(group, &content);
            #[cfg(feature = "embeddings")]
            if let Some(embedder) = &self.embedder {
                if let Some(refined) = self.embedding_score(embedder, group, &content).await {
                    score = 0.5 * score + 0.5 * refined;
                }
            }
            if score >= self.config.similarity_threshold {
                similar.push(SimilarMatch {
                    differences: similarity::differences(group, &content),
                    review: candidate,
                    similarity: score,
                });
            }
        }
        similar.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        let confidence_level = self.confidence_level(&exact, &similar);
        debug!(
            signature = %group.group_signature,
            exact = exact.len(),
            similar = similar.len(),
            confidence = confidence_level,
            "context retrieved"
        );

        Ok(HistoricalContext {
            exact_count: exact.len(),
            similar_count: similar.len(),
            exact,
            similar,
            confidence_level,
        })
    }

    /// Saturating confidence: exact matches dominate, plateauing at
    /// `context_saturation_n`; aggregate success fills in the rest.
    fn confidence_level(&self, exact: &[Strand], similar: &[SimilarMatch]) -> f64 {
        let n_sat = self.config.context_saturation_n as f64;
        if exact.is_empty() && similar.is_empty() {
            return 0.0;
        }

        let exact_sat = (exact.len() as f64 / n_sat).min(1.0);
        let similar_sat = (similar.len() as f64 / n_sat).min(1.0);

        let mut successes = 0usize;
        let mut total = 0usize;
        for strand in exact.iter().chain(similar.iter().map(|m| &m.review)) {
            if let Ok(content) = strand.content_as::<ReviewContent>() {
                total += 1;
                if content.outcome.success {
                    successes += 1;
                }
            }
        }
        let success_rate = if total == 0 {
            0.5
        } else {
            successes as f64 / total as f64
        };

        (0.5 * exact_sat + 0.2 * similar_sat + 0.3 * success_rate).clamp(0.0, 1.0)
    }

    #[cfg(feature = "embeddings")]
    async fn embedding_score(
        &self,
        embedder: &Arc<dyn EmbeddingPort>,
        group: &PatternGroup,
        review: &ReviewContent,
    ) -> Option<f64> {
        let a = embedder.embed(&group.pattern_types.join(" ")).await.ok()?;
        let b = embedder.embed(&review.pattern_types.join(" ")).await.ok()?;
        crate::ports::embedding::cosine(&a, &b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use crate::store::StrandStore;

    fn group(signature: &str, types: &[&str]) -> PatternGroup {
        PatternGroup {
            shape: GroupShape::SingleSingle,
            symbol: "BTC".to_string(),
            pattern_strand_ids: vec!["p1".to_string()],
            pattern_types: types.iter().map(|s| s.to_string()).collect(),
            timeframes: vec![Timeframe::H1],
            cycle_count: 1,
            group_signature: signature.to_string(),
            anchor_timeframe: Timeframe::H1,
            avg_strength: 0.5,
        }
    }

    async fn seed_review(store: &StrandStore, signature: &str, types: &[&str], success: bool) {
        let prediction = Strand::new(StrandKind::Prediction)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&serde_json::json!({"group_signature": signature}))
            .with_tracking(TrackingStatus::Active);
        let prediction_id = store.append(&prediction).await.unwrap();
        store
            .update_tracking(&prediction_id, TrackingStatus::Completed)
            .await
            .unwrap();

        let content = ReviewContent {
            prediction_id,
            outcome: Outcome {
                success,
                realized_return_pct: if success { 1.0 } else { -1.0 },
                max_favorable_pct: 1.5,
                max_adverse_pct: 1.5,
                ..Outcome::default()
            },
            plan_vs_reality: PlanVsReality::default(),
            method_comparison: None,
            group_signature: signature.to_string(),
            method: "code".to_string(),
            group_type: GroupShape::SingleSingle,
            pattern_types: types.iter().map(|s| s.to_string()).collect(),
            timeframes: vec![Timeframe::H1],
            cycle_count: 1,
            original_pattern_strand_ids: vec![],
            braid: None,
        };
        let review = Strand::new(StrandKind::PredictionReview)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&content);
        store.append(&review).await.unwrap();
    }

    #[tokio::test]
    async fn empty_history_means_zero_confidence() {
        let store = StrandStore::in_memory().unwrap();
        let retriever = ContextRetriever::new(store, Config::default());
        let ctx = retriever.retrieve(&group("sig-x", &["volume_spike"])).await.unwrap();
        assert_eq!(ctx.exact_count, 0);
        assert_eq!(ctx.similar_count, 0);
        assert_eq!(ctx.confidence_level, 0.0);
    }

    #[tokio::test]
    async fn exact_and_similar_are_separated() {
        let store = StrandStore::in_memory().unwrap();
        seed_review(&store, "sig-x", &["volume_spike"], true).await;
        // Same structure, different signature: a similar match.
        seed_review(&store, "sig-y", &["volume_spike"], false).await;
        // Disjoint types: not even a candidate.
        seed_review(&store, "sig-z", &["microstructure"], true).await;

        let retriever = ContextRetriever::new(store, Config::default());
        let ctx = retriever.retrieve(&group("sig-x", &["volume_spike"])).await.unwrap();
        assert_eq!(ctx.exact_count, 1);
        assert_eq!(ctx.similar_count, 1);
        assert!(ctx.confidence_level > 0.0);
    }

    #[tokio::test]
    async fn confidence_saturates() {
        let store = StrandStore::in_memory().unwrap();
        for _ in 0..25 {
            seed_review(&store, "sig-x", &["volume_spike"], true).await;
        }
        let mut config = Config::default();
        config.context_saturation_n = 10;
        let retriever = ContextRetriever::new(store, config);
        let ctx = retriever.retrieve(&group("sig-x", &["volume_spike"])).await.unwrap();
        // 0.5 exact (saturated) + 0.3 success, similar term empty.
        assert!((ctx.confidence_level - 0.8).abs() < 1e-9);
    }
}
