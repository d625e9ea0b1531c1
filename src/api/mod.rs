//! Public ports: ingest, query, subscription, control.

pub mod routes;

pub use routes::{router, AppState};
