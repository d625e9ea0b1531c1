//! Pattern group assembly: six canonical group shapes per asset from one
//! detection cycle's leaf patterns.

pub mod assembler;
pub mod signature;

pub use assembler::{PatternGroupAssembler, PatternRef};
pub use signature::group_signature;
