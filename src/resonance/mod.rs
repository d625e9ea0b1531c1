//! Resonance and selection: bounded self-reinforcement state per strand, a
//! global field scalar, and the composite fitness score used for
//! prioritization and pruning.

pub mod field;
pub mod selection;
pub mod telemetry;

pub use field::{FieldSnapshot, ResonanceField, ResonanceWorker};
pub use selection::SelectionScorer;
pub use telemetry::TelemetryWorker;
