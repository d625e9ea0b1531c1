//! Multi-cluster grouping engine: every review joins one cluster per
//! family, each membership carrying its own consumption flag.

pub mod assigner;

pub use assigner::ClusterAssigner;
