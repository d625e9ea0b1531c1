//! Resonance state updates and the global field tick.
//!
//! Per-strand: `Δφ = (sr + λ1·cr − λ2·xr) − φ_prev`, `ρ` integrates `Δφ`
//! with gain `α`, `φ` relaxes toward `φ·ρ` with memory `γ`. Both are hard
//! clamped at the configured bounds; an update that would leave them is
//! clamped and flagged, never applied raw.
//!
//! Global: `θ ← (1−δ)·θ_prev + ħ·Σ_active(φ·ρ)` with `ħ` the mean surprise
//! of active strands. The field lives in an `ArcSwap` so every reader in a
//! tick observes one consistent snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::CilResult;
use crate::models::{
    Config, ResonanceConfig, ResonanceState, RuntimeToggles, StrandKind, Telemetry, TrackingStatus,
};
use crate::ports::ClockPort;
use crate::store::{StrandFilter, StrandStore};

/// Absolute ceiling for the field scalar; a runaway θ is a bug, not signal.
const THETA_MAX: f64 = 1e6;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FieldSnapshot {
    pub theta: f64,
    pub hbar: f64,
    pub active_strands: usize,
    pub updated_at: DateTime<Utc>,
}

/// One per-strand update. Returns the new state and whether any component
/// had to be clamped.
pub fn update_state(
    previous: &ResonanceState,
    telemetry: &Telemetry,
    config: &ResonanceConfig,
    now: DateTime<Utc>,
) -> (ResonanceState, bool) {
    let drive = telemetry.success_rate + config.lambda1 * telemetry.confirmation_rate
        - config.lambda2 * telemetry.contradiction_rate;
    let delta_phi = drive - previous.phi;

    let rho_raw = previous.rho + config.alpha * delta_phi;
    let rho = rho_raw.clamp(config.rho_min, config.rho_max);

    let phi_raw = (1.0 - config.gamma) * (previous.phi * rho) + config.gamma * previous.phi;
    let phi = phi_raw.clamp(config.phi_min, config.phi_max);

    let clamped = rho_raw != rho || phi_raw != phi;
    (
        ResonanceState {
            phi,
            rho,
            theta_contribution: phi * rho,
            updated_at: now,
        },
        clamped,
    )
}

/// Global field state behind an atomically swappable snapshot.
pub struct ResonanceField {
    snapshot: ArcSwap<FieldSnapshot>,
    config: ResonanceConfig,
}

impl ResonanceField {
    pub fn new(config: ResonanceConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(FieldSnapshot {
                theta: 0.0,
                hbar: 0.0,
                active_strands: 0,
                updated_at: Utc::now(),
            }),
            config,
        }
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        **self.snapshot.load()
    }

    /// One field tick over the active strands' `(φ·ρ, surprise)` pairs.
    pub fn tick(&self, contributions: &[(f64, f64)], now: DateTime<Utc>) -> FieldSnapshot {
        let previous = self.snapshot();
        let hbar = if contributions.is_empty() {
            0.0
        } else {
            contributions.iter().map(|(_, s)| s).sum::<f64>() / contributions.len() as f64
        };
        let field_sum: f64 = contributions.iter().map(|(c, _)| c).sum();

        let theta_raw = (1.0 - self.config.delta) * previous.theta + hbar * field_sum;
        let theta = theta_raw.clamp(0.0, THETA_MAX);
        if theta != theta_raw {
            warn!(theta_raw, "field scalar clamped");
        }

        let next = FieldSnapshot {
            theta,
            hbar,
            active_strands: contributions.len(),
            updated_at: now,
        };
        self.snapshot.store(Arc::new(next));
        next
    }
}

/// Event-driven worker applying per-strand resonance updates and the
/// periodic field tick.
#[derive(Clone)]
pub struct ResonanceWorker {
    store: StrandStore,
    field: Arc<ResonanceField>,
    toggles: Arc<RuntimeToggles>,
    clock: Arc<dyn ClockPort>,
    config: Config,
}

impl ResonanceWorker {
    pub fn new(
        store: StrandStore,
        field: Arc<ResonanceField>,
        toggles: Arc<RuntimeToggles>,
        clock: Arc<dyn ClockPort>,
        config: Config,
    ) -> Self {
        Self {
            store,
            field,
            toggles,
            clock,
            config,
        }
    }

    pub fn field(&self) -> &ResonanceField {
        &self.field
    }

    /// Recompute one strand's resonance from its current telemetry.
    pub async fn update_strand(&self, strand_id: &str) -> CilResult<ResonanceState> {
        let strand = self.store.get(strand_id).await?;
        let bounds = self.toggles.resonance();
        let (state, clamped) = update_state(
            &strand.resonance_state,
            &strand.telemetry,
            &bounds,
            self.clock.now(),
        );
        if clamped {
            warn!(strand = %strand_id, phi = state.phi, rho = state.rho, "resonance clamped");
            metrics::counter!("cil_resonance_clamped", 1);
        }
        self.store.update_resonance(strand_id, &state).await?;
        Ok(state)
    }

    /// Periodic global tick over active predictions and fresh reviews.
    pub async fn field_tick(&self) -> CilResult<FieldSnapshot> {
        let mut contributions = Vec::new();

        let active = self
            .store
            .query(
                &StrandFilter::new()
                    .kind(StrandKind::Prediction)
                    .tracking_status(TrackingStatus::Active),
            )
            .await?;
        let since = self.clock.now()
            - chrono::Duration::from_std(self.config.telemetry_window).unwrap_or_default();
        let recent_reviews = self
            .store
            .query(
                &StrandFilter::new()
                    .kind(StrandKind::PredictionReview)
                    .since(since),
            )
            .await?;

        for strand in active.iter().chain(recent_reviews.iter()) {
            contributions.push((
                strand.resonance_state.phi * strand.resonance_state.rho,
                strand.telemetry.surprise,
            ));
        }

        Ok(self.field.tick(&contributions, self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResonanceConfig {
        ResonanceConfig::default()
    }

    #[test]
    fn bounds_hold_under_arbitrary_event_sequences() {
        let cfg = config();
        let mut state = ResonanceState::default();
        // Alternate extreme telemetry for many steps; phi/rho must never
        // leave the configured bounds.
        for step in 0..1000 {
            let telemetry = if step % 2 == 0 {
                Telemetry {
                    success_rate: 1.0,
                    confirmation_rate: 1.0,
                    contradiction_rate: 0.0,
                    surprise: 1.0,
                }
            } else {
                Telemetry {
                    success_rate: 0.0,
                    confirmation_rate: 0.0,
                    contradiction_rate: 1.0,
                    surprise: 1.0,
                }
            };
            let (next, _) = update_state(&state, &telemetry, &cfg, Utc::now());
            assert!(next.phi >= cfg.phi_min && next.phi <= cfg.phi_max);
            assert!(next.rho >= cfg.rho_min && next.rho <= cfg.rho_max);
            state = next;
        }
    }

    #[test]
    fn out_of_bound_updates_are_clamped_and_flagged() {
        let cfg = ResonanceConfig {
            phi_max: 1.2,
            ..config()
        };
        let mut state = ResonanceState {
            phi: 1.2,
            rho: 2.0,
            theta_contribution: 0.0,
            updated_at: Utc::now(),
        };
        let telemetry = Telemetry {
            success_rate: 1.0,
            confirmation_rate: 1.0,
            contradiction_rate: 0.0,
            surprise: 0.0,
        };
        let (next, clamped) = update_state(&state, &telemetry, &cfg, Utc::now());
        assert!(clamped);
        assert!(next.phi <= 1.2);
        state = next;
        assert!(state.phi <= 1.2);
    }

    #[test]
    fn field_tick_blends_previous_theta() {
        let field = ResonanceField::new(config());
        let first = field.tick(&[(2.0, 0.5), (3.0, 0.5)], Utc::now());
        // theta = 0.95*0 + 0.5*5
        assert!((first.theta - 2.5).abs() < 1e-9);
        let second = field.tick(&[(2.0, 0.5), (3.0, 0.5)], Utc::now());
        assert!((second.theta - (0.95 * 2.5 + 2.5)).abs() < 1e-9);
        assert_eq!(second.active_strands, 2);
    }

    #[test]
    fn empty_tick_decays_toward_zero() {
        let field = ResonanceField::new(config());
        field.tick(&[(10.0, 1.0)], Utc::now());
        let before = field.snapshot().theta;
        let after = field.tick(&[], Utc::now());
        assert!(after.theta < before);
        assert_eq!(after.hbar, 0.0);
    }
}
