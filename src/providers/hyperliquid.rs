//! Hyperliquid exchange data provider.
//!
//! All reads go through the `/info` POST endpoint. Asset-context results
//! (funding, open interest, mark price, 24h volume arrive as one bundle) are
//! memoized process-wide with a short TTL to amortize repeat calls within a
//! single enrichment.

use super::{
    interval_seconds, normalize_symbol, BookLevel, Candle, FundingRate, MarketDataProvider,
    OpenInterest, OrderBook, ProviderError, ProviderResult, Ticker,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

const PROVIDER_NAME: &str = "hyperliquid";

#[derive(Debug, Clone)]
struct AssetCtx {
    funding: f64,
    premium: Option<f64>,
    open_interest: f64,
    mark_price: f64,
    day_volume: f64,
    fetched_at: DateTime<Utc>,
}

pub struct HyperliquidProvider {
    base_url: String,
    timeout: Duration,
    client: OnceLock<reqwest::Client>,
    ctx_ttl: Duration,
    ctx_cache: Mutex<Option<(Instant, Arc<HashMap<String, AssetCtx>>)>>,
}

impl HyperliquidProvider {
    pub fn new(base_url: String, timeout_ms: u64, ctx_ttl_ms: u64) -> Self {
        Self {
            base_url,
            timeout: Duration::from_millis(timeout_ms),
            client: OnceLock::new(),
            ctx_ttl: Duration::from_millis(ctx_ttl_ms),
            ctx_cache: Mutex::new(None),
        }
    }

    fn client(&self) -> &reqwest::Client {
        self.client.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(self.timeout)
                .build()
                .expect("reqwest client construction cannot fail with static options")
        })
    }

    async fn info(&self, body: Value) -> ProviderResult<Value> {
        let url = format!("{}/info", self.base_url);
        let started = std::time::Instant::now();
        let result = self.info_inner(&url, body).await;
        metrics::histogram!(
            "lens_provider_request_duration_seconds",
            started.elapsed().as_secs_f64(),
            "provider" => PROVIDER_NAME,
        );
        metrics::increment_counter!(
            "lens_provider_requests_total",
            "provider" => PROVIDER_NAME,
            "outcome" => if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    async fn info_inner(&self, url: &str, body: Value) -> ProviderResult<Value> {
        let response = self
            .client()
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(PROVIDER_NAME, None, format!("Request failed: {e}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(300).collect();
            return Err(ProviderError::new(
                PROVIDER_NAME,
                Some(status.as_u16()),
                snippet,
            ));
        }
        response.json::<Value>().await.map_err(|e| {
            ProviderError::new(PROVIDER_NAME, None, format!("JSON decode failed: {e}"))
        })
    }

    fn parse_f64(v: &Value) -> Option<f64> {
        match v {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Fetch (or reuse) the full asset-context bundle.
    async fn asset_ctxs(&self) -> ProviderResult<Arc<HashMap<String, AssetCtx>>> {
        {
            let cache = self.ctx_cache.lock();
            if let Some((at, ctxs)) = cache.as_ref() {
                if at.elapsed() < self.ctx_ttl {
                    return Ok(ctxs.clone());
                }
            }
        }

        let data = self.info(json!({ "type": "metaAndAssetCtxs" })).await?;
        let universe = data
            .get(0)
            .and_then(|m| m.get("universe"))
            .and_then(|u| u.as_array())
            .ok_or_else(|| {
                ProviderError::new(PROVIDER_NAME, None, "Malformed metaAndAssetCtxs universe")
            })?;
        let ctxs = data.get(1).and_then(|c| c.as_array()).ok_or_else(|| {
            ProviderError::new(PROVIDER_NAME, None, "Malformed metaAndAssetCtxs contexts")
        })?;

        let now = Utc::now();
        let mut map = HashMap::with_capacity(universe.len());
        for (asset, ctx) in universe.iter().zip(ctxs.iter()) {
            let Some(name) = asset.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            map.insert(
                name.to_string(),
                AssetCtx {
                    funding: ctx.get("funding").and_then(Self::parse_f64).unwrap_or(0.0),
                    premium: ctx.get("premium").and_then(Self::parse_f64),
                    open_interest: ctx
                        .get("openInterest")
                        .and_then(Self::parse_f64)
                        .unwrap_or(0.0),
                    mark_price: ctx.get("markPx").and_then(Self::parse_f64).unwrap_or(0.0),
                    day_volume: ctx
                        .get("dayNtlVlm")
                        .and_then(Self::parse_f64)
                        .unwrap_or(0.0),
                    fetched_at: now,
                },
            );
        }

        let shared = Arc::new(map);
        *self.ctx_cache.lock() = Some((Instant::now(), shared.clone()));
        debug!(assets = shared.len(), "Asset context cache refreshed");
        Ok(shared)
    }

    async fn asset_ctx(&self, symbol: &str) -> ProviderResult<AssetCtx> {
        let coin = normalize_symbol(symbol);
        let ctxs = self.asset_ctxs().await?;
        ctxs.get(&coin).cloned().ok_or_else(|| {
            ProviderError::new(PROVIDER_NAME, None, format!("Symbol not found: {coin}"))
        })
    }
}

#[async_trait]
impl MarketDataProvider for HyperliquidProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn ticker(&self, symbol: &str) -> ProviderResult<Ticker> {
        let coin = normalize_symbol(symbol);
        let mids = self.info(json!({ "type": "allMids" })).await?;
        let mid = mids
            .get(&coin)
            .and_then(Self::parse_f64)
            .filter(|m| *m > 0.0)
            .ok_or_else(|| {
                ProviderError::new(PROVIDER_NAME, None, format!("Symbol not found: {coin}"))
            })?;

        let book = self.orderbook(&coin, 1).await?;
        let bid = book.bids.first().map(|l| l.price).unwrap_or(mid);
        let ask = book.asks.first().map(|l| l.price).unwrap_or(mid);
        let spread_bps = if mid > 0.0 {
            (ask - bid) / mid * 10_000.0
        } else {
            0.0
        };

        Ok(Ticker {
            symbol: coin,
            mid,
            bid,
            ask,
            spread_bps,
            timestamp: Utc::now(),
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ProviderResult<Vec<Candle>> {
        let coin = normalize_symbol(symbol);
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - (limit as i64) * interval_seconds(interval) * 1000;
        let data = self
            .info(json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": coin,
                    "interval": interval,
                    "startTime": start_ms,
                    "endTime": end_ms,
                },
            }))
            .await?;

        let raw = data.as_array().ok_or_else(|| {
            ProviderError::new(PROVIDER_NAME, None, "Malformed candleSnapshot response")
        })?;

        let mut candles = Vec::with_capacity(raw.len().min(limit));
        for c in raw.iter().rev().take(limit).rev() {
            let ts_ms = c.get("t").and_then(|v| v.as_i64()).unwrap_or(0);
            let Some(ts) = Utc.timestamp_millis_opt(ts_ms).single() else {
                continue;
            };
            candles.push(Candle {
                timestamp: ts,
                open: c.get("o").and_then(Self::parse_f64).unwrap_or(0.0),
                high: c.get("h").and_then(Self::parse_f64).unwrap_or(0.0),
                low: c.get("l").and_then(Self::parse_f64).unwrap_or(0.0),
                close: c.get("c").and_then(Self::parse_f64).unwrap_or(0.0),
                volume: c.get("v").and_then(Self::parse_f64).unwrap_or(0.0),
            });
        }
        Ok(candles)
    }

    async fn orderbook(&self, symbol: &str, depth: usize) -> ProviderResult<OrderBook> {
        let coin = normalize_symbol(symbol);
        let data = self.info(json!({ "type": "l2Book", "coin": coin })).await?;
        let levels = data
            .get("levels")
            .and_then(|l| l.as_array())
            .ok_or_else(|| ProviderError::new(PROVIDER_NAME, None, "Malformed l2Book levels"))?;

        let parse_side = |side: Option<&Value>| -> Vec<BookLevel> {
            side.and_then(|s| s.as_array())
                .map(|entries| {
                    entries
                        .iter()
                        .take(depth)
                        .filter_map(|level| {
                            Some(BookLevel {
                                price: level.get("px").and_then(Self::parse_f64)?,
                                size: level.get("sz").and_then(Self::parse_f64)?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            symbol: coin,
            bids: parse_side(levels.first()),
            asks: parse_side(levels.get(1)),
            timestamp: Utc::now(),
        })
    }

    async fn funding_rate(&self, symbol: &str) -> ProviderResult<FundingRate> {
        let ctx = self.asset_ctx(symbol).await?;
        Ok(FundingRate {
            symbol: normalize_symbol(symbol),
            rate: ctx.funding,
            predicted_rate: ctx.premium,
            timestamp: ctx.fetched_at,
        })
    }

    async fn open_interest(&self, symbol: &str) -> ProviderResult<OpenInterest> {
        let ctx = self.asset_ctx(symbol).await?;
        Ok(OpenInterest {
            symbol: normalize_symbol(symbol),
            oi_usd: ctx.open_interest * ctx.mark_price,
            oi_contracts: Some(ctx.open_interest),
            timestamp: ctx.fetched_at,
        })
    }

    async fn mark_price(&self, symbol: &str) -> ProviderResult<f64> {
        Ok(self.asset_ctx(symbol).await?.mark_price)
    }

    async fn day_volume(&self, symbol: &str) -> ProviderResult<f64> {
        Ok(self.asset_ctx(symbol).await?.day_volume)
    }
}
