//! Market-data providers.

mod hyperliquid;

pub use hyperliquid::HyperliquidProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Provider failure, tagged with the HTTP status or transport cause.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: &'static str,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: &'static str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            provider,
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(
                f,
                "Provider error ({}): HTTP {}: {}",
                self.provider, code, self.message
            ),
            None => write!(f, "Provider error ({}): {}", self.provider, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread_bps: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
    pub predicted_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OpenInterest {
    pub symbol: String,
    pub oi_usd: f64,
    pub oi_contracts: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Read-only exchange data client. Every returned value carries an explicit
/// timestamp so downstream staleness checks have something to bite on.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ticker(&self, symbol: &str) -> ProviderResult<Ticker>;

    /// Candles, oldest first, newest last.
    async fn candles(&self, symbol: &str, interval: &str, limit: usize)
        -> ProviderResult<Vec<Candle>>;

    async fn orderbook(&self, symbol: &str, depth: usize) -> ProviderResult<OrderBook>;

    async fn funding_rate(&self, symbol: &str) -> ProviderResult<FundingRate>;

    async fn open_interest(&self, symbol: &str) -> ProviderResult<OpenInterest>;

    async fn mark_price(&self, symbol: &str) -> ProviderResult<f64>;

    async fn day_volume(&self, symbol: &str) -> ProviderResult<f64>;
}

/// Normalize an external symbol to the exchange's coin name: uppercase with
/// common quote/product suffixes stripped.
pub fn normalize_symbol(symbol: &str) -> String {
    let mut s = symbol.trim().to_ascii_uppercase();
    for suffix in ["-PERP", "/USDT", "/USDC", "/USD", "-USDT", "-USDC", "-USD", "USDT", "USDC"] {
        if s.len() > suffix.len() {
            if let Some(stripped) = s.strip_suffix(suffix) {
                s = stripped.to_string();
                break;
            }
        }
    }
    s
}

/// Seconds-to-interval mapping used for candle staleness thresholds.
pub fn interval_seconds(interval: &str) -> i64 {
    match interval {
        "1m" => 60,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1800,
        "1h" => 3600,
        "4h" => 14_400,
        "1d" => 86_400,
        _ => 3600,
    }
}
