//! Typed ports to external collaborators: clock, market data, LLM, and the
//! optional embedding provider. The core only talks to the outside world
//! through these.

pub mod clock;
pub mod llm;
pub mod market_data;

#[cfg(feature = "embeddings")]
pub mod embedding;

pub use clock::{ClockPort, SimClock, WallClock};
pub use llm::{
    DisabledLlm, LlmCallOutput, LlmPort, LlmRequest, LlmUsage, OpenRouterClient, ScriptedLlm,
};
pub use market_data::{Candle, MarketDataPort, RestMarketData, SimMarketData};
