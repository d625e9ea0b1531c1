//! Market data port.
//!
//! Read-only OHLCV access used by outcome analysis. Implementations must
//! return a monotonically-ordered series; gaps are explicit (missing bars
//! are simply absent, never interpolated).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{CilError, CilResult};
use crate::models::Timeframe;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Bars with `ts` in `[start, end]`, ascending.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CilResult<Vec<Candle>>;

    /// Most recent close at or before `at`.
    async fn last_close(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        at: DateTime<Utc>,
    ) -> CilResult<f64>;
}

/// In-memory series provider for tests and replay.
#[derive(Default)]
pub struct SimMarketData {
    series: RwLock<HashMap<(String, Timeframe), Vec<Candle>>>,
}

impl SimMarketData {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the series for one `(symbol, timeframe)`. Bars are sorted by
    /// timestamp on insert so reads stay monotonic.
    pub fn set_series(&self, symbol: &str, timeframe: Timeframe, mut bars: Vec<Candle>) {
        bars.sort_by_key(|c| c.ts);
        self.series
            .write()
            .insert((symbol.to_string(), timeframe), bars);
    }

    pub fn push_candle(&self, symbol: &str, timeframe: Timeframe, candle: Candle) {
        let mut series = self.series.write();
        let bars = series.entry((symbol.to_string(), timeframe)).or_default();
        bars.push(candle);
        bars.sort_by_key(|c| c.ts);
    }
}

#[async_trait]
impl MarketDataPort for SimMarketData {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CilResult<Vec<Candle>> {
        let series = self.series.read();
        let bars = series
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| {
                CilError::NotFound(format!("no series for {symbol}/{timeframe}"))
            })?;
        Ok(bars
            .iter()
            .filter(|c| c.ts >= start && c.ts <= end)
            .copied()
            .collect())
    }

    async fn last_close(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        at: DateTime<Utc>,
    ) -> CilResult<f64> {
        let series = self.series.read();
        let bars = series
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| {
                CilError::NotFound(format!("no series for {symbol}/{timeframe}"))
            })?;
        bars.iter()
            .rev()
            .find(|c| c.ts <= at)
            .map(|c| c.close)
            .ok_or_else(|| CilError::NotFound(format!("no close at or before {at}")))
    }
}

/// REST implementation against a Binance-compatible klines endpoint.
pub struct RestMarketData {
    http: reqwest::Client,
    base_url: String,
}

impl RestMarketData {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn binance(http: reqwest::Client) -> Self {
        Self::new(http, "https://api.binance.com")
    }

    fn interval(timeframe: Timeframe) -> &'static str {
        // Binance interval names match ours.
        timeframe.as_str()
    }
}

#[async_trait]
impl MarketDataPort for RestMarketData {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CilResult<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit=1000",
            self.base_url,
            symbol,
            Self::interval(timeframe),
            start.timestamp_millis(),
            end.timestamp_millis(),
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CilError::ContextUnavailable(format!("klines request: {e}")))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(CilError::ContextUnavailable(format!(
                "klines {}: {snippet}",
                status.as_u16()
            )));
        }

        // Rows: [open_time, open, high, low, close, volume, ...]
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)
            .map_err(|e| CilError::ContextUnavailable(format!("klines parse: {e}")))?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let ts_ms = row.first().and_then(|v| v.as_i64()).unwrap_or(0);
            let ts = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or(start);
            let field = |i: usize| -> f64 {
                row.get(i)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0)
            };
            candles.push(Candle {
                ts,
                open: field(1),
                high: field(2),
                low: field(3),
                close: field(4),
                volume: field(5),
            });
        }
        candles.sort_by_key(|c| c.ts);
        Ok(candles)
    }

    async fn last_close(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        at: DateTime<Utc>,
    ) -> CilResult<f64> {
        let lookback = chrono::Duration::from_std(timeframe.duration() * 4).unwrap_or_default();
        let bars = self
            .fetch_ohlcv(symbol, timeframe, at - lookback, at)
            .await?;
        bars.iter()
            .rev()
            .find(|c| c.ts <= at)
            .map(|c| c.close)
            .ok_or_else(|| CilError::ContextUnavailable(format!("no recent close for {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(secs: i64, close: f64) -> Candle {
        let ts = Utc.timestamp_opt(secs, 0).unwrap();
        Candle {
            ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    #[tokio::test]
    async fn series_stays_ordered_with_gaps() {
        let sim = SimMarketData::new();
        sim.push_candle("BTC", Timeframe::H1, candle(7200, 101.0));
        sim.push_candle("BTC", Timeframe::H1, candle(0, 100.0));
        // 3600 missing: that gap must survive, not be filled.

        let bars = sim
            .fetch_ohlcv(
                "BTC",
                Timeframe::H1,
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(10_000, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars[0].ts < bars[1].ts);

        let close = sim
            .last_close("BTC", Timeframe::H1, Utc.timestamp_opt(4000, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(close, 100.0);
    }
}
