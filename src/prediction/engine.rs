//! Prediction engine.
//!
//! `create_prediction` retrieves context, computes the deterministic code
//! forecast, asks the LLM for its own numbers when the path is enabled, and
//! appends an active `prediction` strand. Context loss degrades to a
//! code-only prediction plus an uncertainty strand; LLM loss degrades
//! silently to code-only.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::context::{ContextRetriever, HistoricalContext};
use crate::errors::{CilError, CilResult};
use crate::models::{
    Config, MatchQuality, MethodForecast, PatternGroup, PredictionContent, RuntimeToggles, Strand,
    StrandKind, TrackingStatus, UncertaintyContent, UncertaintyType,
};
use crate::ports::{ClockPort, LlmPort, LlmRequest, MarketDataPort};
use crate::prediction::{code_model, llm_model};
use crate::store::StrandStore;

pub const TAG_PREDICTION: &str = "cil:prediction";
pub const TAG_UNCERTAINTY: &str = "cil:uncertainty";

#[derive(Clone)]
pub struct PredictionEngine {
    store: StrandStore,
    retriever: ContextRetriever,
    market: Arc<dyn MarketDataPort>,
    llm: Option<Arc<dyn LlmPort>>,
    clock: Arc<dyn ClockPort>,
    toggles: Arc<RuntimeToggles>,
    config: Config,
}

impl PredictionEngine {
    pub fn new(
        store: StrandStore,
        retriever: ContextRetriever,
        market: Arc<dyn MarketDataPort>,
        llm: Option<Arc<dyn LlmPort>>,
        clock: Arc<dyn ClockPort>,
        toggles: Arc<RuntimeToggles>,
        config: Config,
    ) -> Self {
        Self {
            store,
            retriever,
            market,
            llm,
            clock,
            toggles,
            config,
        }
    }

    pub async fn create_prediction(&self, group: &PatternGroup) -> CilResult<String> {
        if group.pattern_strand_ids.is_empty() {
            return Err(CilError::ValidationFailure("empty pattern group".to_string()));
        }

        let context = match self.retriever.retrieve(group).await {
            Ok(context) => context,
            Err(CilError::ContextUnavailable(reason)) => {
                warn!(signature = %group.group_signature, %reason, "context unavailable, degrading to code-only");
                self.emit_context_uncertainty(group, &reason).await;
                HistoricalContext::default()
            }
            Err(e) => return Err(e),
        };

        let code_prediction = code_model::code_forecast(group, &context, &self.config);
        let llm_prediction = self.llm_forecast(group, &context).await;

        let now = self.clock.now();
        let entry_price = self
            .market
            .last_close(&group.symbol, group.anchor_timeframe, now)
            .await
            .map_err(|e| CilError::ContextUnavailable(format!("no entry price: {e}")))?;

        let target_price = entry_price * (1.0 + code_prediction.target_return_pct / 100.0);
        let stop_loss = entry_price * (1.0 - code_prediction.stop_loss_pct / 100.0);
        let max_hold_secs =
            self.config.hold_multiple as u64 * group.anchor_timeframe.duration().as_secs();

        let match_quality = if context.exact_count > 0 {
            MatchQuality::Exact
        } else if context.similar_count > 0 {
            MatchQuality::Similar
        } else {
            MatchQuality::FirstTime
        };

        let content = PredictionContent {
            group: group.clone(),
            group_signature: group.group_signature.clone(),
            code_prediction,
            llm_prediction,
            entry_price,
            target_price,
            stop_loss,
            max_hold_secs,
            match_quality,
            exact_count: context.exact_count,
            similar_count: context.similar_count,
            confidence_level: context.confidence_level,
        };

        let strand = Strand::new(StrandKind::Prediction)
            .with_created_at(now)
            .with_symbol(group.symbol.clone())
            .with_timeframe(group.anchor_timeframe)
            .with_content(&content)
            .with_tracking(TrackingStatus::Active)
            .with_tag(TAG_PREDICTION)
            .with_lineage(group.pattern_strand_ids.clone(), "prediction from group");

        let id = self.store.append(&strand).await?;
        debug!(
            prediction = %id,
            signature = %group.group_signature,
            quality = match_quality.as_str(),
            hold_secs = max_hold_secs,
            "prediction created"
        );
        Ok(id)
    }

    async fn llm_forecast(
        &self,
        group: &PatternGroup,
        context: &HistoricalContext,
    ) -> Option<MethodForecast> {
        if !self.config.llm_enabled || !self.toggles.llm_enabled() {
            return None;
        }
        let llm = self.llm.as_ref()?;

        let request = LlmRequest {
            system: llm_model::PREDICTION_SYSTEM_PROMPT.to_string(),
            user: llm_model::build_prediction_prompt(group, context),
            max_tokens: 256,
            temperature: 0.1,
            deadline: Duration::from_millis(self.config.llm_deadline_ms),
        };

        match llm.complete(request).await {
            Ok(output) => {
                let tokens = output.usage.total_tokens.unwrap_or(0);
                let _ = self.store.record_llm_usage(1, tokens).await;
                match llm_model::parse_forecast_dsl(&output.content) {
                    Ok(forecast) => Some(forecast),
                    Err(e) => {
                        warn!(error = %e, "llm forecast malformed, code-only");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "llm unavailable, code-only");
                None
            }
        }
    }

    async fn emit_context_uncertainty(&self, group: &PatternGroup, reason: &str) {
        let content = UncertaintyContent {
            uncertainty_type: UncertaintyType::DataSufficiency,
            resolution_priority: 0.6,
            resolution_actions: vec!["restore strand store connectivity".to_string()],
            source: Some(format!("prediction for {}", group.group_signature)),
        };
        let strand = Strand::new(StrandKind::Uncertainty)
            .with_symbol(group.symbol.clone())
            .with_content(&content)
            .with_tag(TAG_UNCERTAINTY)
            .with_lesson(format!("context retrieval failed: {reason}"));
        if let Err(e) = self.store.append(&strand).await {
            warn!(error = %e, "failed to record context uncertainty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupShape, Timeframe};
    use crate::ports::{Candle, ScriptedLlm, SimClock, SimMarketData};
    use chrono::{TimeZone, Utc};

    fn group() -> PatternGroup {
        PatternGroup {
            shape: GroupShape::SingleSingle,
            symbol: "BTC".to_string(),
            pattern_strand_ids: vec!["p1".to_string()],
            pattern_types: vec!["volume_spike".to_string()],
            timeframes: vec![Timeframe::H1],
            cycle_count: 1,
            group_signature: "sig-engine".to_string(),
            anchor_timeframe: Timeframe::H1,
            avg_strength: 0.8,
        }
    }

    fn engine_with(llm: Option<Arc<dyn LlmPort>>) -> (PredictionEngine, StrandStore) {
        let store = StrandStore::in_memory().unwrap();
        let config = Config::default();
        let retriever = ContextRetriever::new(store.clone(), config.clone());
        let market = SimMarketData::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        market.push_candle(
            "BTC",
            Timeframe::H1,
            Candle {
                ts: t0,
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.0,
                volume: 10.0,
            },
        );
        let clock = Arc::new(SimClock::at(t0 + chrono::Duration::hours(1)));
        let toggles = RuntimeToggles::from_config(&config);
        let engine =
            PredictionEngine::new(store.clone(), retriever, market, llm, clock, toggles, config);
        (engine, store)
    }

    #[tokio::test]
    async fn first_time_prediction_has_twenty_bar_horizon() {
        let (engine, store) = engine_with(None);
        let id = engine.create_prediction(&group()).await.unwrap();
        let strand = store.get(&id).await.unwrap();
        let content: PredictionContent = strand.content_as().unwrap();
        assert_eq!(content.match_quality, MatchQuality::FirstTime);
        assert_eq!(content.max_hold_secs, 20 * 3600);
        assert_eq!(content.exact_count, 0);
        assert_eq!(content.similar_count, 0);
        assert!(content.llm_prediction.is_none());
        assert_eq!(strand.tracking_status, Some(TrackingStatus::Active));
    }

    #[tokio::test]
    async fn llm_outage_degrades_to_code_only() {
        let scripted = Arc::new(ScriptedLlm::new());
        scripted.push_err(CilError::LlmUnavailable("down".to_string()));
        let (engine, store) = engine_with(Some(scripted.clone() as Arc<dyn LlmPort>));
        let id = engine.create_prediction(&group()).await.unwrap();
        let content: PredictionContent = store.get(&id).await.unwrap().content_as().unwrap();
        assert!(content.llm_prediction.is_none());
    }

    #[tokio::test]
    async fn llm_forecast_is_attached_when_valid() {
        let scripted = Arc::new(ScriptedLlm::new());
        scripted.push_ok("TARGET_PCT=2.5\nSTOP_PCT=0.8\nCONFIDENCE=0.6");
        let (engine, store) = engine_with(Some(scripted.clone() as Arc<dyn LlmPort>));
        let id = engine.create_prediction(&group()).await.unwrap();
        let content: PredictionContent = store.get(&id).await.unwrap().content_as().unwrap();
        let llm = content.llm_prediction.unwrap();
        assert_eq!(llm.target_return_pct, 2.5);
        assert_eq!(llm.stop_loss_pct, 0.8);
    }
}
