//! Conditional plan composition: promoting high-confidence braids into
//! structured plans for downstream decision-makers.

pub mod composer;

pub use composer::{DoctrinePort, PermissiveDoctrine, PlanComposer};
