//! Central Intelligence Layer backend library.
//!
//! Turns a stream of low-level pattern observations into durable knowledge
//! and conditional trading plans: strand store, prediction engine,
//! multi-cluster braiding, resonance scoring, plan promotion.

pub mod api;
pub mod clustering;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod grouping;
pub mod learning;
pub mod models;
pub mod plans;
pub mod ports;
pub mod prediction;
pub mod resonance;
pub mod store;

use std::sync::Arc;

use crate::clustering::ClusterAssigner;
use crate::context::ContextRetriever;
use crate::dispatch::Dispatcher;
use crate::errors::CilResult;
use crate::grouping::PatternGroupAssembler;
use crate::learning::{ClusterBraider, LearningAnalyzer};
use crate::models::{Config, RuntimeToggles};
use crate::plans::{DoctrinePort, PlanComposer};
use crate::ports::{ClockPort, LlmPort, MarketDataPort};
use crate::prediction::{OutcomeAnalyzer, PredictionEngine, PredictionTracker};
use crate::resonance::{ResonanceField, ResonanceWorker, SelectionScorer, TelemetryWorker};
use crate::store::StrandStore;

/// Fully wired intelligence layer. Ports are injected so tests can run the
/// whole pipeline against simulated collaborators.
pub struct Cil {
    pub store: StrandStore,
    pub dispatcher: Arc<Dispatcher>,
    pub field: Arc<ResonanceField>,
    pub toggles: Arc<RuntimeToggles>,
    pub config: Config,
}

impl Cil {
    pub fn bootstrap(
        store: StrandStore,
        market: Arc<dyn MarketDataPort>,
        llm: Option<Arc<dyn LlmPort>>,
        clock: Arc<dyn ClockPort>,
        doctrine: Arc<dyn DoctrinePort>,
        config: Config,
    ) -> CilResult<Self> {
        let toggles = RuntimeToggles::from_config(&config);
        let field = Arc::new(ResonanceField::new(config.resonance.clone()));

        let retriever = ContextRetriever::new(store.clone(), config.clone());
        let assembler = PatternGroupAssembler::new(config.clone());
        let engine = PredictionEngine::new(
            store.clone(),
            retriever,
            market.clone(),
            llm.clone(),
            clock.clone(),
            toggles.clone(),
            config.clone(),
        );
        let outcome = OutcomeAnalyzer::new(market, config.success_threshold_pct);
        let tracker = PredictionTracker::new(store.clone(), outcome, clock.clone());
        let assigner = ClusterAssigner::new(store.clone());

        // Braiding is LLM-dependent; without a port the dispatcher parks
        // learning jobs and the pipeline runs code-only.
        let analyzer_llm = llm.unwrap_or_else(|| Arc::new(ports::llm::DisabledLlm));
        let analyzer = LearningAnalyzer::new(analyzer_llm, store.clone(), config.clone());
        let braider = ClusterBraider::new(
            store.clone(),
            analyzer,
            assigner.clone(),
            clock.clone(),
            config.clone(),
        );

        let composer = PlanComposer::new(store.clone(), doctrine, config.clone());
        let telemetry = TelemetryWorker::new(store.clone(), clock.clone(), config.clone());
        let resonance = ResonanceWorker::new(
            store.clone(),
            field.clone(),
            toggles.clone(),
            clock.clone(),
            config.clone(),
        );
        let scorer = SelectionScorer::new(store.clone(), clock.clone(), config.clone());

        let dispatcher = Dispatcher::new(
            store.clone(),
            assembler,
            engine,
            tracker,
            assigner,
            braider,
            composer,
            telemetry,
            resonance,
            scorer,
            clock,
            toggles.clone(),
            config.clone(),
        );

        Ok(Self {
            store,
            dispatcher,
            field,
            toggles,
            config,
        })
    }
}
