//! Dispatcher.
//!
//! Drives all periodic work: the heartbeat chain on new pattern overviews,
//! the resolution sweep over active predictions, the cluster sweep on new
//! reviews, resonance ticks, and the retry loop for parked LLM jobs. The
//! LLM is treated as a rate-limited external resource: a bounded in-flight
//! semaphore plus a failure-window circuit breaker that degrades the whole
//! pipeline to code-only while open.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::clustering::ClusterAssigner;
use crate::errors::{CilError, CilResult};
use crate::grouping::{PatternGroupAssembler, PatternRef};
use crate::learning::{BraidOutcome, ClusterBraider, SlotId};
use crate::models::{Config, PatternOverviewContent, RuntimeToggles, Strand, StrandKind};
use crate::plans::PlanComposer;
use crate::ports::ClockPort;
use crate::prediction::{PredictionEngine, PredictionTracker};
use crate::resonance::{selection, ResonanceWorker, SelectionScorer, TelemetryWorker};
use crate::store::StrandStore;

use super::retry::{RetryJob, RetryQueue};

/// Failure-window circuit breaker for the LLM path. While open, every
/// `probe_interval`-th caller is let through as a half-open probe; one
/// success closes the breaker.
pub struct LlmBreaker {
    window: VecDeque<bool>,
    window_size: usize,
    consecutive_failures: u32,
    failure_threshold: u32,
    open: bool,
    probe_counter: u32,
    probe_interval: u32,
}

impl LlmBreaker {
    pub fn new(window_size: usize, failure_threshold: u32, probe_interval: u32) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            consecutive_failures: 0,
            failure_threshold,
            open: false,
            probe_counter: 0,
            probe_interval: probe_interval.max(1),
        }
    }

    pub fn record_success(&mut self) {
        self.push(true);
        self.consecutive_failures = 0;
        if self.open {
            info!("llm breaker closed after success");
            self.open = false;
        }
    }

    pub fn record_failure(&mut self) {
        self.push(false);
        self.consecutive_failures += 1;
        if !self.open && self.consecutive_failures >= self.failure_threshold {
            warn!(
                failures = self.consecutive_failures,
                "llm breaker open, degrading to code-only"
            );
            self.open = true;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Gate one call. Open breaker blocks all but the periodic probe.
    pub fn should_block(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.probe_counter += 1;
        if self.probe_counter >= self.probe_interval {
            self.probe_counter = 0;
            return false; // half-open probe
        }
        true
    }

    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn push(&mut self, ok: bool) {
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }
}

pub struct Dispatcher {
    store: StrandStore,
    assembler: PatternGroupAssembler,
    engine: PredictionEngine,
    tracker: PredictionTracker,
    assigner: ClusterAssigner,
    braider: ClusterBraider,
    composer: PlanComposer,
    telemetry: TelemetryWorker,
    resonance: ResonanceWorker,
    scorer: SelectionScorer,
    retry: Arc<RetryQueue>,
    llm_permits: Arc<Semaphore>,
    breaker: Mutex<LlmBreaker>,
    clock: Arc<dyn ClockPort>,
    toggles: Arc<RuntimeToggles>,
    config: Config,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StrandStore,
        assembler: PatternGroupAssembler,
        engine: PredictionEngine,
        tracker: PredictionTracker,
        assigner: ClusterAssigner,
        braider: ClusterBraider,
        composer: PlanComposer,
        telemetry: TelemetryWorker,
        resonance: ResonanceWorker,
        scorer: SelectionScorer,
        clock: Arc<dyn ClockPort>,
        toggles: Arc<RuntimeToggles>,
        config: Config,
    ) -> Arc<Self> {
        let retry = Arc::new(RetryQueue::new(
            Duration::from_millis(config.llm_deadline_ms.max(1000)),
            config.llm_max_retries,
            0x5eed,
        ));
        let llm_permits = Arc::new(Semaphore::new(config.llm_max_in_flight));
        Arc::new(Self {
            store,
            assembler,
            engine,
            tracker,
            assigner,
            braider,
            composer,
            telemetry,
            resonance,
            scorer,
            retry,
            llm_permits,
            breaker: Mutex::new(LlmBreaker::new(32, 5, 4)),
            clock,
            toggles,
            config,
        })
    }

    /// Spawn all periodic loops. Each runs until the process exits.
    pub fn spawn_loops(self: &Arc<Self>) {
        // Heartbeat: new pattern overviews drive the grouping -> prediction
        // chain; new reviews drive the cluster sweep.
        {
            let dispatcher = self.clone();
            let mut events = dispatcher.store.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => match event.strand.kind {
                            StrandKind::PatternOverview => {
                                if let Err(e) = dispatcher.handle_overview(&event.strand).await {
                                    error!(error = %e, "overview heartbeat failed");
                                }
                            }
                            StrandKind::PredictionReview => {
                                if let Err(e) = dispatcher.on_new_review(&event.strand.id).await {
                                    error!(error = %e, "cluster sweep failed");
                                }
                            }
                            _ => {}
                        },
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event feed lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        // Resolution sweep.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_secs(dispatcher.config.resolution_sweep_secs));
                loop {
                    tick.tick().await;
                    match dispatcher.tracker.sweep().await {
                        Ok(reviews) if !reviews.is_empty() => {
                            debug!(resolved = reviews.len(), "resolution sweep");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "resolution sweep failed"),
                    }
                }
            });
        }

        // Learning sweep: find eligible slots, prioritize, braid.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_secs(dispatcher.config.learning_sweep_secs));
                loop {
                    tick.tick().await;
                    if let Err(e) = dispatcher.learning_sweep().await {
                        warn!(error = %e, "learning sweep failed");
                    }
                }
            });
        }

        // Resonance field tick.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_secs(dispatcher.config.field_tick_secs));
                loop {
                    tick.tick().await;
                    match dispatcher.resonance.field_tick().await {
                        Ok(snapshot) => {
                            metrics::gauge!("cil_field_theta", snapshot.theta);
                            debug!(theta = snapshot.theta, hbar = snapshot.hbar, "field tick");
                        }
                        Err(e) => warn!(error = %e, "field tick failed"),
                    }
                }
            });
        }

        // Retry loop.
        {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    dispatcher.drain_due_retries().await;
                }
            });
        }
    }

    /// One pass of the retry loop: run every job whose due time passed.
    pub async fn drain_due_retries(&self) {
        let due = self.retry.due_jobs(self.clock.now());
        for job in due {
            self.process_braid_job(job).await;
        }
    }

    /// Minute heartbeat: a new overview strand fans out into groups and
    /// predictions.
    pub async fn handle_overview(&self, overview: &Strand) -> CilResult<()> {
        let content: PatternOverviewContent = overview.content_as()?;
        let mut patterns = Vec::with_capacity(content.pattern_strand_ids.len());
        for id in &content.pattern_strand_ids {
            match self.store.get(id).await {
                Ok(strand) => match PatternRef::from_strand(&strand) {
                    Ok(p) => patterns.push(p),
                    Err(e) => warn!(pattern = %id, error = %e, "skipping malformed pattern"),
                },
                Err(e) => warn!(pattern = %id, error = %e, "pattern not found"),
            }
        }
        if patterns.is_empty() {
            return Err(CilError::ValidationFailure(
                "overview references no readable patterns".to_string(),
            ));
        }

        let groups = self.assembler.assemble(&patterns);
        info!(
            overview = %overview.id,
            patterns = patterns.len(),
            groups = groups.len(),
            "heartbeat: groups assembled"
        );
        for group in &groups {
            match self.engine.create_prediction(group).await {
                Ok(id) => debug!(prediction = %id, shape = group.shape.as_str(), "prediction"),
                Err(CilError::ValidationFailure(reason)) => {
                    warn!(%reason, "group rejected");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Cluster sweep on a new review (any level): assign families, refresh
    /// telemetry/resonance/scores, and re-evaluate the affected slots.
    pub async fn on_new_review(&self, review_id: &str) -> CilResult<()> {
        let review = self.store.get(review_id).await?;
        self.assigner.assign(&review).await?;

        if let Err(e) = self.telemetry.recompute(review_id).await {
            warn!(review = %review_id, error = %e, "telemetry recompute failed");
        }
        if let Err(e) = self.resonance.update_strand(review_id).await {
            warn!(review = %review_id, error = %e, "resonance update failed");
        }
        if let Err(e) = self.scorer.score_strand(review_id).await {
            warn!(review = %review_id, error = %e, "selection scoring failed");
        }

        // Re-evaluate only the slots this review touches. Enqueued rather
        // than run inline: braiding produces reviews of its own.
        let review = self.store.get(review_id).await?;
        let eligible = self.braider.scan().await?;
        for slot in eligible {
            let touches = review.cluster_key.iter().any(|s| {
                s.cluster_type == slot.0 && s.cluster_key == slot.1 && s.braid_level == slot.2
            });
            if touches {
                self.retry
                    .schedule_immediate(RetryJob { slot, attempt: 0 }, self.clock.now());
            }
        }
        Ok(())
    }

    /// Full learning sweep with backpressure and resonance prioritization.
    pub async fn learning_sweep(&self) -> CilResult<()> {
        self.apply_backpressure();

        let slots = self.braider.scan().await?;
        if slots.is_empty() {
            return Ok(());
        }
        let ordered = self.prioritize(slots).await;
        for slot in ordered {
            self.process_braid_job(RetryJob { slot, attempt: 0 }).await;
        }
        Ok(())
    }

    /// Order slots by the mean enhanced selection score of their members:
    /// `S* = S · (1 + w_res · clip(φ·ρ·surprise, 0, 1))`.
    async fn prioritize(&self, slots: Vec<SlotId>) -> Vec<SlotId> {
        let mut scored = Vec::with_capacity(slots.len());
        for slot in slots {
            let members = self
                .store
                .unconsumed_members(slot.0, &slot.1, slot.2, self.config.max_braid_size)
                .await
                .unwrap_or_default();
            let mut total = 0.0;
            for member in &members {
                let s = if member.scores.selection > 0.0 {
                    member.scores.selection
                } else {
                    0.5
                };
                total += selection::enhanced_score(
                    s,
                    member.resonance_state.phi,
                    member.resonance_state.rho,
                    member.telemetry.surprise,
                    self.toggles.w_res(),
                );
            }
            let priority = if members.is_empty() {
                0.0
            } else {
                total / members.len() as f64
            };
            scored.push((priority, slot));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, slot)| slot).collect()
    }

    /// One braid attempt with breaker, bounded concurrency, retry and
    /// parking semantics.
    pub async fn process_braid_job(&self, job: RetryJob) {
        if !self.toggles.llm_enabled() || self.breaker.lock().should_block() {
            // Park quietly; the retry loop re-offers the slot when the
            // breaker closes.
            let requeued = self
                .retry
                .schedule(RetryJob { slot: job.slot.clone(), attempt: job.attempt }, self.clock.now());
            if !requeued {
                self.braider.park_failed_slot(&job.slot, "llm breaker open").await;
            }
            return;
        }

        let Ok(_permit) = self.llm_permits.acquire().await else {
            return;
        };

        match self.braider.braid_slot(&job.slot).await {
            Ok(BraidOutcome::Braided(braid_id)) => {
                self.breaker.lock().record_success();
                if let Err(e) = self.on_new_review(&braid_id).await {
                    warn!(braid = %braid_id, error = %e, "post-braid sweep failed");
                }
                match self.composer.try_promote(&braid_id).await {
                    Ok(Some(plan_id)) => info!(plan = %plan_id, "plan promoted"),
                    Ok(None) => {}
                    Err(e) => warn!(braid = %braid_id, error = %e, "promotion check failed"),
                }
            }
            Ok(BraidOutcome::Skipped) | Ok(BraidOutcome::ParkedUncertain) => {}
            Err(e) if e.is_transient() => {
                self.breaker.lock().record_failure();
                let next = RetryJob {
                    slot: job.slot.clone(),
                    attempt: job.attempt + 1,
                };
                if !self.retry.schedule(next, self.clock.now()) {
                    self.braider
                        .park_failed_slot(&job.slot, &e.to_string())
                        .await;
                }
            }
            Err(e) => {
                // Permanent: quarantine the job, surface the gap, move on.
                error!(error = %e, "braid job failed permanently");
                self.braider
                    .park_failed_slot(&job.slot, &e.to_string())
                    .await;
            }
        }
    }

    /// Raise `min_braid_size` while the pending queue is deep; restore when
    /// it drains.
    fn apply_backpressure(&self) {
        let depth = self.retry.len();
        metrics::gauge!("cil_retry_queue_depth", depth as f64);
        if depth > self.config.backpressure_queue_high {
            self.braider
                .set_effective_min_braid_size(self.config.min_braid_size + 1);
            warn!(depth, "backpressure: raising min braid size");
        } else if depth <= self.config.backpressure_queue_low {
            self.braider
                .set_effective_min_braid_size(self.config.min_braid_size);
        }
    }

    /// Cancellation propagation: a broken group invalidation cancels the
    /// still-active predictions derived from those patterns.
    pub async fn cancel_predictions_for_patterns(&self, pattern_ids: &[String]) -> CilResult<usize> {
        let active = self
            .store
            .query(
                &crate::store::StrandFilter::new()
                    .kind(StrandKind::Prediction)
                    .tracking_status(crate::models::TrackingStatus::Active),
            )
            .await?;
        let mut cancelled = 0usize;
        for prediction in active {
            let derived = prediction
                .lineage
                .parent_ids
                .iter()
                .any(|id| pattern_ids.contains(id));
            if derived {
                self.tracker.cancel(&prediction.id).await?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Control-endpoint hook: run a field tick outside the schedule.
    pub async fn force_field_tick(&self) -> CilResult<crate::resonance::FieldSnapshot> {
        self.resonance.field_tick().await
    }

    pub fn toggles(&self) -> &Arc<RuntimeToggles> {
        &self.toggles
    }

    pub fn braider(&self) -> &ClusterBraider {
        &self.braider
    }

    pub fn tracker(&self) -> &PredictionTracker {
        &self.tracker
    }

    pub fn llm_error_rate(&self) -> f64 {
        self.breaker.lock().error_rate()
    }

    pub fn retry_depth(&self) -> usize {
        self.retry.len()
    }
}
