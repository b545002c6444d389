// =============================================================================
// MarketDataFetcher — component C
// =============================================================================
//
// For a symbol, produce a `MarketSnapshot`: current price, two candle-series
// horizons (3m x 40, 4h x 60) with EMA/MACD/RSI/ATR computed over each, an
// open-interest history window, and the latest funding rate.
//
// The concrete fetcher speaks Binance USDT-M futures' public REST endpoints
// (no API key required for market data) — grounded on the reference open
// interest / funding rate poller shape, generalized from a standalone
// aggregator into the `MarketDataFetcher` capability this engine consumes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::CoreError;
use crate::indicators::{atr, ema, macd, rsi};

const INTRADAY_INTERVAL: &str = "3m";
const INTRADAY_LIMIT: usize = 40;
const LONGER_TERM_INTERVAL: &str = "4h";
const LONGER_TERM_LIMIT: usize = 60;
const OI_BUCKET_PERIOD: &str = "5m";
const OI_BUCKET_LIMIT: usize = 30;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One OHLCV bar. Field set mirrors what Binance's kline endpoint returns,
/// which is also exactly what the ATR/indicator math needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

/// Intraday (3-minute) indicator series. All series share the same length
/// and are aligned oldest-to-latest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntradaySeries {
    pub mid_prices: Vec<f64>,
    pub ema20: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
}

/// Longer-term (4-hour) indicators: a mix of scalar "current value" reads and
/// full series for MACD/RSI (the prompt renders recent history for these).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongerTermSeries {
    pub ema20: f64,
    pub ema50: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub current_volume: f64,
    pub average_volume: f64,
    pub macd: Vec<f64>,
    pub rsi14: Vec<f64>,
}

/// Open interest snapshot. `latest`/`average` are `None` when the venue has
/// no OI history for the symbol — never coerced to zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenInterestInfo {
    pub latest: Option<f64>,
    pub average: Option<f64>,
}

impl OpenInterestInfo {
    pub fn open_interest_usd(&self, current_price: f64) -> Option<f64> {
        self.latest.map(|v| v * current_price)
    }
}

/// The full per-symbol evidence snapshot handed to the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_1h: f64,
    pub price_change_4h: f64,
    pub intraday: IntradaySeries,
    pub longer_term: LongerTermSeries,
    pub open_interest: OpenInterestInfo,
    pub funding_rate: f64,
}

impl MarketSnapshot {
    pub fn open_interest_usd(&self) -> Option<f64> {
        self.open_interest.open_interest_usd(self.current_price)
    }
}

/// Upper-case and append `USDT` if the caller passed a bare base asset
/// (`btc` -> `BTCUSDT`). Already-suffixed symbols pass through unchanged.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.to_uppercase();
    if upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

#[async_trait]
pub trait MarketDataFetcher: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, CoreError>;
}

// -----------------------------------------------------------------------
// Binance futures public-data implementation
// -----------------------------------------------------------------------

pub struct BinanceMarketDataFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl BinanceMarketDataFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://fapi.binance.com".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[instrument(skip(self), name = "market_data.fetch_klines", fields(symbol, interval, limit))]
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, CoreError> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let resp = tokio::time::timeout(
            self.timeout,
            self.client
                .get(&url)
                .query(&[
                    ("symbol", symbol),
                    ("interval", interval),
                    ("limit", &limit.to_string()),
                ])
                .send(),
        )
        .await
        .map_err(|_| CoreError::TransientIo(format!("kline fetch timed out for {symbol}")))?
        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(CoreError::TransientIo(format!("{status}: {body}")));
            }
            return Err(CoreError::VendorRejection(format!("{status}: {body}")));
        }

        let raw: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| CoreError::Parse(e.to_string()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for row in raw {
            let arr = row
                .as_array()
                .ok_or_else(|| CoreError::Parse("kline row was not an array".into()))?;
            let get_f64 = |i: usize| -> Result<f64, CoreError> {
                arr.get(i)
                    .and_then(|v| v.as_str().and_then(|s| s.parse::<f64>().ok()).or(v.as_f64()))
                    .ok_or_else(|| CoreError::Parse(format!("kline field {i} missing/invalid")))
            };
            let get_i64 = |i: usize| -> Result<i64, CoreError> {
                arr.get(i)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| CoreError::Parse(format!("kline field {i} missing/invalid")))
            };
            candles.push(Candle {
                open_time: get_i64(0)?,
                open: get_f64(1)?,
                high: get_f64(2)?,
                low: get_f64(3)?,
                close: get_f64(4)?,
                volume: get_f64(5)?,
                close_time: get_i64(6)?,
                quote_volume: get_f64(7)?,
                trades_count: arr.get(8).and_then(|v| v.as_u64()).unwrap_or(0),
                taker_buy_volume: get_f64(9)?,
                taker_buy_quote_volume: get_f64(10)?,
                is_closed: true,
            });
        }
        Ok(candles)
    }

    #[instrument(skip(self), name = "market_data.fetch_open_interest", fields(symbol))]
    async fn fetch_open_interest(&self, symbol: &str) -> OpenInterestInfo {
        let url = format!("{}/futures/data/openInterestHist", self.base_url);
        let result = tokio::time::timeout(
            self.timeout,
            self.client
                .get(&url)
                .query(&[
                    ("symbol", symbol),
                    ("period", OI_BUCKET_PERIOD),
                    ("limit", &OI_BUCKET_LIMIT.to_string()),
                ])
                .send(),
        )
        .await;

        let resp = match result {
            Ok(Ok(r)) if r.status().is_success() => r,
            Ok(Ok(r)) => {
                warn!(symbol, status = %r.status(), "open interest fetch rejected");
                return OpenInterestInfo::default();
            }
            Ok(Err(e)) => {
                warn!(symbol, error = %e, "open interest fetch failed");
                return OpenInterestInfo::default();
            }
            Err(_) => {
                warn!(symbol, "open interest fetch timed out");
                return OpenInterestInfo::default();
            }
        };

        let raw: Vec<serde_json::Value> = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, error = %e, "open interest response was not valid JSON");
                return OpenInterestInfo::default();
            }
        };

        let values: Vec<f64> = raw
            .iter()
            .filter_map(|row| row.get("sumOpenInterest").and_then(|v| v.as_str()))
            .filter_map(|s| s.parse::<f64>().ok())
            .collect();

        if values.is_empty() {
            return OpenInterestInfo::default();
        }

        let latest = *values.last().unwrap();
        let average = values.iter().sum::<f64>() / values.len() as f64;
        OpenInterestInfo {
            latest: Some(latest),
            average: Some(average),
        }
    }

    #[instrument(skip(self), name = "market_data.fetch_funding_rate", fields(symbol))]
    async fn fetch_funding_rate(&self, symbol: &str) -> f64 {
        let url = format!("{}/fapi/v1/premiumIndex", self.base_url);
        let result = tokio::time::timeout(
            self.timeout,
            self.client.get(&url).query(&[("symbol", symbol)]).send(),
        )
        .await;

        let resp = match result {
            Ok(Ok(r)) if r.status().is_success() => r,
            _ => {
                warn!(symbol, "funding rate fetch failed, defaulting to 0.0");
                return 0.0;
            }
        };

        match resp.json::<serde_json::Value>().await {
            Ok(v) => v
                .get("lastFundingRate")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }
}

#[async_trait]
impl MarketDataFetcher for BinanceMarketDataFetcher {
    #[instrument(skip(self), name = "market_data.fetch_snapshot", fields(symbol))]
    async fn fetch_snapshot(&self, symbol_in: &str) -> Result<MarketSnapshot, CoreError> {
        let symbol = normalize_symbol(symbol_in);

        let (intraday_candles, longer_term_candles) = tokio::try_join!(
            self.fetch_klines(&symbol, INTRADAY_INTERVAL, INTRADAY_LIMIT),
            self.fetch_klines(&symbol, LONGER_TERM_INTERVAL, LONGER_TERM_LIMIT),
        )?;

        if intraday_candles.len() < 21 || longer_term_candles.is_empty() {
            return Err(CoreError::TransientIo(format!(
                "insufficient candle history for {symbol}"
            )));
        }

        let (open_interest, funding_rate) = tokio::join!(
            self.fetch_open_interest(&symbol),
            self.fetch_funding_rate(&symbol),
        );

        let intraday_closes: Vec<f64> = intraday_candles.iter().map(|c| c.close).collect();
        let current_price = *intraday_closes.last().unwrap();

        // close 20 bars back on the 3m series.
        let price_change_1h = pct_change_back(&intraday_closes, 20);
        let longer_closes: Vec<f64> = longer_term_candles.iter().map(|c| c.close).collect();
        // close 1 bar back on the 4h series.
        let price_change_4h = pct_change_back(&longer_closes, 1);

        let target_len = intraday_closes.len();
        let intraday = IntradaySeries {
            mid_prices: intraday_closes.clone(),
            ema20: pad_front(ema::calculate_ema(&intraday_closes, 20), target_len),
            macd: pad_front(
                macd::calculate(&intraday_closes)
                    .into_iter()
                    .map(|p| p.macd)
                    .collect(),
                target_len,
            ),
            rsi7: pad_front(rsi::calculate_rsi(&intraday_closes, 7), target_len),
            rsi14: pad_front(rsi::calculate_rsi(&intraday_closes, 14), target_len),
        };

        let ema20_series = ema::calculate_ema(&longer_closes, 20);
        let ema50_series = ema::calculate_ema(&longer_closes, 50);
        let volumes: Vec<f64> = longer_term_candles.iter().map(|c| c.volume).collect();

        let longer_term = LongerTermSeries {
            ema20: ema20_series.last().copied().unwrap_or(current_price),
            ema50: ema50_series.last().copied().unwrap_or(current_price),
            atr3: atr::calculate_atr(&longer_term_candles, 3).unwrap_or(0.0),
            atr14: atr::calculate_atr(&longer_term_candles, 14).unwrap_or(0.0),
            current_volume: volumes.last().copied().unwrap_or(0.0),
            average_volume: if volumes.is_empty() {
                0.0
            } else {
                volumes.iter().sum::<f64>() / volumes.len() as f64
            },
            macd: macd::calculate(&longer_closes)
                .into_iter()
                .map(|p| p.macd)
                .collect(),
            rsi14: rsi::calculate_rsi(&longer_closes, 14),
        };

        Ok(MarketSnapshot {
            symbol,
            current_price,
            price_change_1h,
            price_change_4h,
            intraday,
            longer_term,
            open_interest,
            funding_rate,
        })
    }
}

/// Left-pad an indicator series with `f64::NAN` so it reaches `target_len`,
/// mirroring the NaN-padding a warmup-period indicator library produces when
/// aligned back to the full candle series. A no-op if already long enough.
fn pad_front(series: Vec<f64>, target_len: usize) -> Vec<f64> {
    if series.len() >= target_len {
        return series;
    }
    let mut padded = vec![f64::NAN; target_len - series.len()];
    padded.extend(series);
    padded
}

/// Percent change between the latest close and the close `bars_back` bars
/// earlier. Returns 0.0 if the series is too short (rather than panicking).
fn pct_change_back(closes: &[f64], bars_back: usize) -> f64 {
    if closes.len() <= bars_back {
        return 0.0;
    }
    let latest = closes[closes.len() - 1];
    let past = closes[closes.len() - 1 - bars_back];
    if past == 0.0 {
        return 0.0;
    }
    (latest - past) / past * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_symbol_appends_usdt() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn pct_change_back_handles_short_series() {
        assert_eq!(pct_change_back(&[1.0, 2.0], 20), 0.0);
    }

    #[test]
    fn pad_front_left_pads_with_nan_and_preserves_tail() {
        let series = vec![1.0, 2.0, 3.0];
        let padded = pad_front(series, 5);
        assert_eq!(padded.len(), 5);
        assert!(padded[0].is_nan());
        assert!(padded[1].is_nan());
        assert_eq!(&padded[2..], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn pad_front_is_noop_when_already_long_enough() {
        let series = vec![1.0, 2.0, 3.0];
        let padded = pad_front(series.clone(), 3);
        assert_eq!(padded, series);
        let padded_shorter_target = pad_front(series.clone(), 2);
        assert_eq!(padded_shorter_target, series);
    }

    #[test]
    fn intraday_series_fields_share_length_with_mid_prices() {
        let mid_prices: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let target_len = mid_prices.len();
        let intraday = IntradaySeries {
            mid_prices: mid_prices.clone(),
            ema20: pad_front(ema::calculate_ema(&mid_prices, 20), target_len),
            macd: pad_front(
                macd::calculate(&mid_prices).into_iter().map(|p| p.macd).collect(),
                target_len,
            ),
            rsi7: pad_front(rsi::calculate_rsi(&mid_prices, 7), target_len),
            rsi14: pad_front(rsi::calculate_rsi(&mid_prices, 14), target_len),
        };
        assert_eq!(intraday.ema20.len(), target_len);
        assert_eq!(intraday.macd.len(), target_len);
        assert_eq!(intraday.rsi7.len(), target_len);
        assert_eq!(intraday.rsi14.len(), target_len);
    }

    #[test]
    fn pct_change_back_computes_expected_ratio() {
        let closes = vec![100.0, 100.0, 110.0];
        assert!((pct_change_back(&closes, 1) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn open_interest_usd_is_none_when_missing() {
        let oi = OpenInterestInfo::default();
        assert!(oi.open_interest_usd(100.0).is_none());
    }

    #[test]
    fn open_interest_usd_computed_when_present() {
        let oi = OpenInterestInfo {
            latest: Some(1000.0),
            average: Some(900.0),
        };
        assert_eq!(oi.open_interest_usd(50.0), Some(50_000.0));
    }
}
