//! Historical context retrieval for prediction groups: exact signature
//! matches plus weighted-similarity neighbors.

pub mod retriever;
pub mod similarity;

pub use retriever::{ContextRetriever, HistoricalContext, SimilarMatch};
