//! Deterministic group signatures.
//!
//! A signature identifies the *shape* of a group for exact-context lookup
//! across time, so it never encodes cycle timestamps — only the cycle
//! count. Constituents are sorted and deduplicated first, which makes the
//! signature invariant under reordering of the input strands.

use sha2::{Digest, Sha256};

use crate::models::{GroupShape, Timeframe};

/// Canonical pre-hash form; exposed for tests.
pub fn canonical_string(
    shape: GroupShape,
    symbol: &str,
    pattern_types: &[String],
    timeframes: &[Timeframe],
    cycle_count: u32,
) -> String {
    let mut types: Vec<&str> = pattern_types.iter().map(|s| s.as_str()).collect();
    types.sort_unstable();
    types.dedup();

    let mut tfs: Vec<&str> = timeframes.iter().map(|t| t.as_str()).collect();
    tfs.sort_unstable();
    tfs.dedup();

    format!(
        "{}|{}|{}|{}|c{}",
        shape.as_str(),
        symbol,
        types.join(","),
        tfs.join(","),
        cycle_count
    )
}

/// Stable signature: SHA-256 of the canonical string, first 16 bytes hex.
pub fn group_signature(
    shape: GroupShape,
    symbol: &str,
    pattern_types: &[String],
    timeframes: &[Timeframe],
    cycle_count: u32,
) -> String {
    let canonical = canonical_string(shape, symbol, pattern_types, timeframes, cycle_count);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..16])
}
