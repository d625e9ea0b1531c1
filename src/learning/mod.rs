//! Per-cluster learning: eligibility scanning, braiding jobs, and the LLM
//! learning analyzer that distills a cluster's reviews into a lesson.

pub mod analyzer;
pub mod braider;

#[cfg(test)]
mod braider_tests;

pub use analyzer::LearningAnalyzer;
pub use braider::{BraidOutcome, ClusterBraider, SlotId};
