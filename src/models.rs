//! Core data model: everything the system knows is a Strand.
//!
//! Strands are append-only records in one logical table. After creation only
//! a small mutable subset may change: cluster-slot consumption, tracking
//! status, resonance state, telemetry, scores, and `updated_at`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CilError;

/// Payload schema version. Producers must not remove or rename fields
/// within a version; consumers ignore unknown fields.
pub const FEATURE_VERSION: u32 = 1;

/// Strand discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrandKind {
    Pattern,
    PatternOverview,
    Prediction,
    PredictionReview,
    ConditionalPlan,
    Uncertainty,
    Motif,
    LearningBraid,
    MetaSignal,
}

impl StrandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrandKind::Pattern => "pattern",
            StrandKind::PatternOverview => "pattern_overview",
            StrandKind::Prediction => "prediction",
            StrandKind::PredictionReview => "prediction_review",
            StrandKind::ConditionalPlan => "conditional_plan",
            StrandKind::Uncertainty => "uncertainty",
            StrandKind::Motif => "motif",
            StrandKind::LearningBraid => "learning_braid",
            StrandKind::MetaSignal => "meta_signal",
        }
    }
}

impl FromStr for StrandKind {
    type Err = CilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pattern" => Ok(StrandKind::Pattern),
            "pattern_overview" => Ok(StrandKind::PatternOverview),
            "prediction" => Ok(StrandKind::Prediction),
            "prediction_review" => Ok(StrandKind::PredictionReview),
            "conditional_plan" => Ok(StrandKind::ConditionalPlan),
            "uncertainty" => Ok(StrandKind::Uncertainty),
            "motif" => Ok(StrandKind::Motif),
            "learning_braid" => Ok(StrandKind::LearningBraid),
            "meta_signal" => Ok(StrandKind::MetaSignal),
            other => Err(CilError::ValidationFailure(format!(
                "unknown strand kind: {other}"
            ))),
        }
    }
}

/// Lifecycle status for time-bound kinds. Transitions are monotonic:
/// `active -> completed | expired | cancelled`, all terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Active => "active",
            TrackingStatus::Completed => "completed",
            TrackingStatus::Expired => "expired",
            TrackingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrackingStatus::Active)
    }

    pub fn can_transition_to(&self, next: TrackingStatus) -> bool {
        matches!(self, TrackingStatus::Active) && next.is_terminal()
    }
}

impl FromStr for TrackingStatus {
    type Err = CilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TrackingStatus::Active),
            "completed" => Ok(TrackingStatus::Completed),
            "expired" => Ok(TrackingStatus::Expired),
            "cancelled" => Ok(TrackingStatus::Cancelled),
            other => Err(CilError::ValidationFailure(format!(
                "unknown tracking status: {other}"
            ))),
        }
    }
}

/// Supported chart timeframes. Weights come from the configured table, not
/// a formula; unknown timeframes are rejected at parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Bar duration.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M5 => Duration::from_secs(5 * 60),
            Timeframe::M15 => Duration::from_secs(15 * 60),
            Timeframe::H1 => Duration::from_secs(60 * 60),
            Timeframe::H4 => Duration::from_secs(4 * 60 * 60),
            Timeframe::D1 => Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = CilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(CilError::ValidationFailure(format!(
                "unknown timeframe: {other}"
            ))),
        }
    }
}

/// The seven cluster families a review is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    PatternTimeframe,
    Asset,
    Timeframe,
    Outcome,
    Pattern,
    GroupType,
    Method,
}

impl ClusterType {
    pub const ALL: [ClusterType; 7] = [
        ClusterType::PatternTimeframe,
        ClusterType::Asset,
        ClusterType::Timeframe,
        ClusterType::Outcome,
        ClusterType::Pattern,
        ClusterType::GroupType,
        ClusterType::Method,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::PatternTimeframe => "pattern_timeframe",
            ClusterType::Asset => "asset",
            ClusterType::Timeframe => "timeframe",
            ClusterType::Outcome => "outcome",
            ClusterType::Pattern => "pattern",
            ClusterType::GroupType => "group_type",
            ClusterType::Method => "method",
        }
    }
}

impl FromStr for ClusterType {
    type Err = CilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pattern_timeframe" => Ok(ClusterType::PatternTimeframe),
            "asset" => Ok(ClusterType::Asset),
            "timeframe" => Ok(ClusterType::Timeframe),
            "outcome" => Ok(ClusterType::Outcome),
            "pattern" => Ok(ClusterType::Pattern),
            "group_type" => Ok(ClusterType::GroupType),
            "method" => Ok(ClusterType::Method),
            other => Err(CilError::ValidationFailure(format!(
                "unknown cluster type: {other}"
            ))),
        }
    }
}

/// One cluster membership slot. A strand carries many of these, each with
/// its own consumption flag, so the same strand can braid under several
/// families independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSlot {
    pub cluster_type: ClusterType,
    pub cluster_key: String,
    pub braid_level: u32,
    pub consumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ClusterSlot {
    pub fn new(
        cluster_type: ClusterType,
        cluster_key: impl Into<String>,
        braid_level: u32,
    ) -> Self {
        Self {
            cluster_type,
            cluster_key: cluster_key.into(),
            braid_level,
            consumed: false,
            consumed_at: None,
        }
    }
}

/// Strands directly consumed to produce this one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent_ids: Vec<String>,
    pub mutation_note: String,
}

/// Bounded self-reinforcement state. phi and rho never leave the configured
/// bounds; updates that would exceed them are clamped and flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResonanceState {
    pub phi: f64,
    pub rho: f64,
    pub theta_contribution: f64,
    pub updated_at: DateTime<Utc>,
}

impl Default for ResonanceState {
    fn default() -> Self {
        Self {
            phi: 1.0,
            rho: 1.0,
            theta_contribution: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// Running estimates over the configured window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub success_rate: f64,
    pub confirmation_rate: f64,
    pub contradiction_rate: f64,
    pub surprise: f64,
}

/// Fitness components plus the composite selection score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub sig_sigma: f64,
    pub sig_confidence: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub stability: f64,
    pub orthogonality: f64,
    pub cost: f64,
    pub selection: f64,
}

/// The uniform record. Everything the system observes, predicts, reviews,
/// learns, or plans is one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strand {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: StrandKind,
    pub braid_level: u32,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub session_bucket: Option<String>,
    pub regime: Option<String>,
    pub content: Value,
    pub tags: Vec<String>,
    pub cluster_key: Vec<ClusterSlot>,
    pub lesson: Option<String>,
    pub lineage: Lineage,
    pub resonance_state: ResonanceState,
    pub telemetry: Telemetry,
    pub scores: Scores,
    pub tracking_status: Option<TrackingStatus>,
    pub feature_version: u32,
}

impl Strand {
    pub fn new(kind: StrandKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kind,
            braid_level: 1,
            symbol: None,
            timeframe: None,
            session_bucket: None,
            regime: None,
            content: Value::Null,
            tags: Vec::new(),
            cluster_key: Vec::new(),
            lesson: None,
            lineage: Lineage::default(),
            resonance_state: ResonanceState::default(),
            telemetry: Telemetry::default(),
            scores: Scores::default(),
            tracking_status: None,
            feature_version: FEATURE_VERSION,
        }
    }

    /// Stamp creation time from an injected clock (both `created_at` and
    /// `updated_at`).
    pub fn with_created_at(mut self, t: DateTime<Utc>) -> Self {
        self.created_at = t;
        self.updated_at = t;
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn with_braid_level(mut self, level: u32) -> Self {
        self.braid_level = level;
        self
    }

    pub fn with_content<T: Serialize>(mut self, content: &T) -> Self {
        self.content = serde_json::to_value(content).unwrap_or(Value::Null);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tracking(mut self, status: TrackingStatus) -> Self {
        self.tracking_status = Some(status);
        self
    }

    pub fn with_lineage(mut self, parent_ids: Vec<String>, note: impl Into<String>) -> Self {
        self.lineage = Lineage {
            parent_ids,
            mutation_note: note.into(),
        };
        self
    }

    pub fn with_lesson(mut self, lesson: impl Into<String>) -> Self {
        self.lesson = Some(lesson.into());
        self
    }

    /// Decode the content payload into a typed shape. Unknown fields are
    /// ignored so payloads can grow within a feature version.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CilError> {
        serde_json::from_value(self.content.clone())
            .map_err(|e| CilError::ValidationFailure(format!("content decode: {e}")))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn slot(
        &self,
        cluster_type: ClusterType,
        cluster_key: &str,
        level: u32,
    ) -> Option<&ClusterSlot> {
        self.cluster_key.iter().find(|s| {
            s.cluster_type == cluster_type && s.cluster_key == cluster_key && s.braid_level == level
        })
    }
}

// ---------------------------------------------------------------------------
// Content payloads by kind
// ---------------------------------------------------------------------------

/// `kind = pattern`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternContent {
    pub pattern_type: String,
    pub strength: f64,
    #[serde(default)]
    pub features: Value,
    /// Detection cycle the pattern was observed in (unix seconds of the
    /// 5-minute cycle boundary).
    pub cycle_time: i64,
}

/// `kind = pattern_overview` — links one detection cycle's leaf patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternOverviewContent {
    pub pattern_strand_ids: Vec<String>,
    pub cycle_time: i64,
}

/// The six canonical group shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupShape {
    SingleSingle,
    MultiSingle,
    SingleMulti,
    MultiMulti,
    SingleMultiCycle,
    MultiMultiCycle,
}

impl GroupShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupShape::SingleSingle => "single_single",
            GroupShape::MultiSingle => "multi_single",
            GroupShape::SingleMulti => "single_multi",
            GroupShape::MultiMulti => "multi_multi",
            GroupShape::SingleMultiCycle => "single_multi_cycle",
            GroupShape::MultiMultiCycle => "multi_multi_cycle",
        }
    }
}

impl FromStr for GroupShape {
    type Err = CilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_single" => Ok(GroupShape::SingleSingle),
            "multi_single" => Ok(GroupShape::MultiSingle),
            "single_multi" => Ok(GroupShape::SingleMulti),
            "multi_multi" => Ok(GroupShape::MultiMulti),
            "single_multi_cycle" => Ok(GroupShape::SingleMultiCycle),
            "multi_multi_cycle" => Ok(GroupShape::MultiMultiCycle),
            other => Err(CilError::ValidationFailure(format!(
                "unknown group shape: {other}"
            ))),
        }
    }
}

/// A pattern group assembled from one or more leaf pattern strands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternGroup {
    pub shape: GroupShape,
    pub symbol: String,
    pub pattern_strand_ids: Vec<String>,
    pub pattern_types: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub cycle_count: u32,
    pub group_signature: String,
    /// Highest-weight timeframe among constituents; drives the hold horizon.
    pub anchor_timeframe: Timeframe,
    pub avg_strength: f64,
}

/// Match quality against historical context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    Exact,
    Similar,
    FirstTime,
}

impl MatchQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchQuality::Exact => "exact",
            MatchQuality::Similar => "similar",
            MatchQuality::FirstTime => "first_time",
        }
    }
}

/// One method's numeric forecast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodForecast {
    pub target_return_pct: f64,
    pub stop_loss_pct: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// `kind = prediction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionContent {
    pub group: PatternGroup,
    pub group_signature: String,
    pub code_prediction: MethodForecast,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_prediction: Option<MethodForecast>,
    pub entry_price: f64,
    pub target_price: f64,
    pub stop_loss: f64,
    pub max_hold_secs: u64,
    pub match_quality: MatchQuality,
    pub exact_count: usize,
    pub similar_count: usize,
    pub confidence_level: f64,
}

/// Numeric outcome of a resolved prediction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub realized_return_pct: f64,
    pub max_favorable_pct: f64,
    pub max_adverse_pct: f64,
    pub time_to_outcome_secs: u64,
    pub hit_target: bool,
    pub hit_stop: bool,
    /// Which level was crossed first when both were ("target" | "stop").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_hit: Option<String>,
    pub success: bool,
}

/// Plan-vs-reality deltas, all numeric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanVsReality {
    pub target_delta_pct: f64,
    pub stop_delta_pct: f64,
    pub duration_delta_secs: i64,
    pub better_entry_available_pct: f64,
    #[serde(default)]
    pub same_bar_ambiguity: bool,
}

/// Which method's forecast tracked the realized outcome more closely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodComparison {
    pub better_method: String,
    pub code_error_pct: f64,
    pub llm_error_pct: f64,
}

/// `kind = prediction_review` (braid level 1). Braided reviews at level 2+
/// reuse this shape with the aggregate block populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewContent {
    pub prediction_id: String,
    pub outcome: Outcome,
    pub plan_vs_reality: PlanVsReality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_comparison: Option<MethodComparison>,
    pub group_signature: String,
    /// "code" | "llm" — the method credited with this review.
    pub method: String,
    pub group_type: GroupShape,
    pub pattern_types: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub cycle_count: u32,
    pub original_pattern_strand_ids: Vec<String>,
    /// Aggregates, present on braided reviews only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub braid: Option<BraidAggregates>,
}

/// Aggregate statistics carried by a braided review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraidAggregates {
    pub cluster_type: ClusterType,
    pub cluster_key: String,
    pub member_count: usize,
    pub success_rate: f64,
    pub avg_confidence: f64,
    pub avg_return_pct: f64,
    pub insights: LearningInsights,
}

/// Structured output of the learning analyzer. Statements must be grounded
/// in the supplied numbers; free text is advisory and never scored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningInsights {
    #[serde(default)]
    pub patterns_observed: Vec<String>,
    #[serde(default)]
    pub mistakes_identified: Vec<String>,
    #[serde(default)]
    pub success_factors: Vec<String>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub uncertainty: InsightUncertainty,
    /// Echoed aggregates, cross-checked against the supplied reviews.
    #[serde(default)]
    pub member_count: usize,
    #[serde(default)]
    pub success_rate: f64,
}

/// Explicit uncertainty the analyzer is allowed (and encouraged) to state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightUncertainty {
    pub pattern_clarity: f64,
    pub data_sufficiency: f64,
    pub confidence: f64,
}

impl Default for InsightUncertainty {
    fn default() -> Self {
        Self {
            pattern_clarity: 0.5,
            data_sufficiency: 0.5,
            confidence: 0.5,
        }
    }
}

/// `kind = uncertainty`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyType {
    PatternClarity,
    CausalClarity,
    DataSufficiency,
    AnalogyConfidence,
}

impl UncertaintyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UncertaintyType::PatternClarity => "pattern_clarity",
            UncertaintyType::CausalClarity => "causal_clarity",
            UncertaintyType::DataSufficiency => "data_sufficiency",
            UncertaintyType::AnalogyConfidence => "analogy_confidence",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyContent {
    pub uncertainty_type: UncertaintyType,
    pub resolution_priority: f64,
    pub resolution_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// `kind = conditional_plan`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalPlanContent {
    pub conditions: PlanConditions,
    pub entry_criteria: Vec<String>,
    pub exit_criteria: Vec<String>,
    pub risk: PlanRisk,
    pub scope: PlanScope,
    pub provenance: PlanProvenance,
    pub expected_rr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConditions {
    pub activation: Vec<String>,
    pub invalidation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRisk {
    pub sizing_pct: f64,
    pub max_drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanScope {
    pub assets: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub regimes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProvenance {
    pub braid_ids: Vec<String>,
    pub review_ids: Vec<String>,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Resonance equation constants and hard bounds.
#[derive(Debug, Clone)]
pub struct ResonanceConfig {
    pub alpha: f64,
    pub gamma: f64,
    pub delta: f64,
    pub lambda1: f64,
    pub lambda2: f64,
    pub rho_min: f64,
    pub rho_max: f64,
    pub phi_min: f64,
    pub phi_max: f64,
}

impl Default for ResonanceConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            gamma: 0.3,
            delta: 0.05,
            lambda1: 0.5,
            lambda2: 0.5,
            rho_min: 0.1,
            rho_max: 10.0,
            phi_min: 0.01,
            phi_max: 100.0,
        }
    }
}

/// Application configuration. Every recognized option is overridable by an
/// environment variable; defaults match the documented values.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    pub min_braid_size: usize,
    pub max_braid_size: usize,
    pub braid_min_selection: f64,
    pub max_staleness: Duration,
    pub similarity_threshold: f64,
    pub context_saturation_n: usize,
    pub success_threshold_pct: f64,
    pub timeframe_weights: HashMap<Timeframe, f64>,
    pub hold_multiple: u32,

    pub resonance: ResonanceConfig,
    pub w_res: f64,
    pub telemetry_window: Duration,

    pub llm_enabled: bool,
    pub llm_model: String,
    pub llm_deadline_ms: u64,
    pub llm_max_retries: u32,
    pub llm_max_in_flight: usize,

    pub uncertainty_enabled: bool,
    pub uncertainty_min_confidence: f64,
    pub uncertainty_min_sufficiency: f64,

    pub plan_min_members: usize,
    pub plan_min_selection: f64,

    pub resolution_sweep_secs: u64,
    pub learning_sweep_secs: u64,
    pub field_tick_secs: u64,
    pub backpressure_queue_high: usize,
    pub backpressure_queue_low: usize,
}

impl Config {
    pub fn default_timeframe_weights() -> HashMap<Timeframe, f64> {
        HashMap::from([
            (Timeframe::M1, 1.0),
            (Timeframe::M5, 2.0),
            (Timeframe::M15, 5.0),
            (Timeframe::H1, 10.0),
            (Timeframe::H4, 20.0),
            (Timeframe::D1, 50.0),
        ])
    }

    pub fn timeframe_weight(&self, tf: Timeframe) -> f64 {
        self.timeframe_weights.get(&tf).copied().unwrap_or(1.0)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("CIL_DATABASE_PATH").unwrap_or_else(|_| "./cil.db".to_string());

        let port = env_parse("CIL_PORT", 8080u16);

        let min_braid_size = env_parse("CIL_MIN_BRAID_SIZE", 3usize).max(2);
        let max_braid_size = env_parse("CIL_MAX_BRAID_SIZE", 8usize).max(min_braid_size);

        Ok(Self {
            database_path,
            port,
            min_braid_size,
            max_braid_size,
            braid_min_selection: env_parse("CIL_BRAID_MIN_SELECTION", 0.4f64),
            max_staleness: Duration::from_secs(env_parse("CIL_MAX_STALENESS_SECS", 86_400u64)),
            similarity_threshold: env_parse("CIL_SIMILARITY_THRESHOLD", 0.7f64),
            context_saturation_n: env_parse("CIL_CONTEXT_SATURATION_N", 10usize).max(1),
            success_threshold_pct: env_parse("CIL_SUCCESS_THRESHOLD_PCT", 0.0f64),
            timeframe_weights: Self::default_timeframe_weights(),
            hold_multiple: env_parse("CIL_HOLD_MULTIPLE", 20u32).max(1),
            resonance: ResonanceConfig {
                alpha: env_parse("CIL_RES_ALPHA", 0.1f64),
                gamma: env_parse("CIL_RES_GAMMA", 0.3f64),
                delta: env_parse("CIL_RES_DELTA", 0.05f64),
                lambda1: env_parse("CIL_RES_LAMBDA1", 0.5f64),
                lambda2: env_parse("CIL_RES_LAMBDA2", 0.5f64),
                rho_min: env_parse("CIL_RES_RHO_MIN", 0.1f64),
                rho_max: env_parse("CIL_RES_RHO_MAX", 10.0f64),
                phi_min: env_parse("CIL_RES_PHI_MIN", 0.01f64),
                phi_max: env_parse("CIL_RES_PHI_MAX", 100.0f64),
            },
            w_res: env_parse("CIL_W_RES", 0.2f64),
            telemetry_window: Duration::from_secs(env_parse(
                "CIL_TELEMETRY_WINDOW_SECS",
                7 * 86_400u64,
            )),
            llm_enabled: env_flag("CIL_LLM_ENABLED", true),
            llm_model: std::env::var("CIL_LLM_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            llm_deadline_ms: env_parse("CIL_LLM_DEADLINE_MS", 20_000u64),
            llm_max_retries: env_parse("CIL_LLM_MAX_RETRIES", 5u32),
            llm_max_in_flight: env_parse("CIL_LLM_MAX_IN_FLIGHT", 4usize).max(1),
            uncertainty_enabled: env_flag("CIL_UNCERTAINTY_ENABLED", true),
            uncertainty_min_confidence: env_parse("CIL_UNCERTAINTY_MIN_CONFIDENCE", 0.2f64),
            uncertainty_min_sufficiency: env_parse("CIL_UNCERTAINTY_MIN_SUFFICIENCY", 0.2f64),
            plan_min_members: env_parse("CIL_PLAN_MIN_MEMBERS", 10usize),
            plan_min_selection: env_parse("CIL_PLAN_MIN_SELECTION", 0.5f64),
            resolution_sweep_secs: env_parse("CIL_RESOLUTION_SWEEP_SECS", 15u64).max(1),
            learning_sweep_secs: env_parse("CIL_LEARNING_SWEEP_SECS", 30u64).max(1),
            field_tick_secs: env_parse("CIL_FIELD_TICK_SECS", 60u64).max(1),
            backpressure_queue_high: env_parse("CIL_BACKPRESSURE_QUEUE_HIGH", 64usize),
            backpressure_queue_low: env_parse("CIL_BACKPRESSURE_QUEUE_LOW", 16usize),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./cil.db".to_string(),
            port: 8080,
            min_braid_size: 3,
            max_braid_size: 8,
            braid_min_selection: 0.4,
            max_staleness: Duration::from_secs(86_400),
            similarity_threshold: 0.7,
            context_saturation_n: 10,
            success_threshold_pct: 0.0,
            timeframe_weights: Self::default_timeframe_weights(),
            hold_multiple: 20,
            resonance: ResonanceConfig::default(),
            w_res: 0.2,
            telemetry_window: Duration::from_secs(7 * 86_400),
            llm_enabled: true,
            llm_model: "openai/gpt-4o-mini".to_string(),
            llm_deadline_ms: 20_000,
            llm_max_retries: 5,
            llm_max_in_flight: 4,
            uncertainty_enabled: true,
            uncertainty_min_confidence: 0.2,
            uncertainty_min_sufficiency: 0.2,
            plan_min_members: 10,
            plan_min_selection: 0.5,
            resolution_sweep_secs: 15,
            learning_sweep_secs: 30,
            field_tick_secs: 60,
            backpressure_queue_high: 64,
            backpressure_queue_low: 16,
        }
    }
}

/// Live-tunable runtime state behind the control endpoint. Everything else
/// in `Config` is fixed at startup.
#[derive(Debug)]
pub struct RuntimeToggles {
    llm_enabled: std::sync::atomic::AtomicBool,
    w_res: parking_lot::Mutex<f64>,
    resonance: parking_lot::Mutex<ResonanceConfig>,
}

impl RuntimeToggles {
    pub fn from_config(config: &Config) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            llm_enabled: std::sync::atomic::AtomicBool::new(config.llm_enabled),
            w_res: parking_lot::Mutex::new(config.w_res),
            resonance: parking_lot::Mutex::new(config.resonance.clone()),
        })
    }

    pub fn llm_enabled(&self) -> bool {
        self.llm_enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_llm_enabled(&self, enabled: bool) {
        self.llm_enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn w_res(&self) -> f64 {
        *self.w_res.lock()
    }

    pub fn set_w_res(&self, w_res: f64) {
        *self.w_res.lock() = w_res.clamp(0.0, 1.0);
    }

    pub fn resonance(&self) -> ResonanceConfig {
        self.resonance.lock().clone()
    }

    pub fn set_resonance_bounds(
        &self,
        phi_min: Option<f64>,
        phi_max: Option<f64>,
        rho_min: Option<f64>,
        rho_max: Option<f64>,
    ) {
        let mut resonance = self.resonance.lock();
        if let Some(v) = phi_min {
            resonance.phi_min = v;
        }
        if let Some(v) = phi_max {
            resonance.phi_max = v.max(resonance.phi_min);
        }
        if let Some(v) = rho_min {
            resonance.rho_min = v;
        }
        if let Some(v) = rho_max {
            resonance.rho_max = v.max(resonance.rho_min);
        }
    }
}

fn env_parse<T: FromStr + Copy>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_status_transitions_are_monotonic() {
        assert!(TrackingStatus::Active.can_transition_to(TrackingStatus::Completed));
        assert!(TrackingStatus::Active.can_transition_to(TrackingStatus::Expired));
        assert!(!TrackingStatus::Completed.can_transition_to(TrackingStatus::Active));
        assert!(!TrackingStatus::Cancelled.can_transition_to(TrackingStatus::Completed));
    }

    #[test]
    fn timeframe_weights_strictly_increase() {
        let weights = Config::default_timeframe_weights();
        let mut prev = 0.0;
        for tf in Timeframe::ALL {
            let w = weights[&tf];
            assert!(w > prev, "{tf} weight must exceed {prev}");
            prev = w;
        }
    }

    #[test]
    fn strand_content_round_trip() {
        let content = PatternContent {
            pattern_type: "volume_spike".to_string(),
            strength: 0.8,
            features: serde_json::json!({"zscore": 3.1}),
            cycle_time: 1_700_000_000,
        };
        let strand = Strand::new(StrandKind::Pattern)
            .with_symbol("BTC")
            .with_timeframe(Timeframe::H1)
            .with_content(&content);
        let decoded: PatternContent = strand.content_as().unwrap();
        assert_eq!(decoded.pattern_type, "volume_spike");
        assert_eq!(decoded.cycle_time, 1_700_000_000);
    }

    #[test]
    fn unknown_timeframe_rejected() {
        assert!("7m".parse::<Timeframe>().is_err());
    }
}
