//! Enrichment service: market snapshot + indicators + data-quality flags.

use super::indicators;
use super::profile::{FeatureProfile, ProfileRegistry};
use crate::models::SignalSubmission;
use crate::providers::{interval_seconds, Candle, MarketDataProvider};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

/// Staleness thresholds per data kind, in seconds. Candles use 2x the bar
/// interval instead.
const STALE_TICKER_S: i64 = 10;
const STALE_ORDERBOOK_S: i64 = 5;
const STALE_FUNDING_S: i64 = 60;

/// Spread beyond which the book is considered out of range (1%).
const MAX_SANE_SPREAD_BPS: f64 = 100.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityFlags {
    pub stale: Vec<String>,
    pub missing: Vec<String>,
    pub out_of_range: Vec<String>,
    pub provider_errors: Vec<String>,
}

impl QualityFlags {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    /// True when no provider errors occurred and market data is present.
    /// Stale/out-of-range findings degrade quality but do not fail enrichment.
    pub success: bool,
    pub market_data: Option<Value>,
    pub ta_data: Option<Value>,
    pub derivs_data: Option<Value>,
    pub constraints: Value,
    pub data_timestamps: Value,
    pub quality_flags: QualityFlags,
    pub enriched_payload: Value,
}

pub struct EnrichmentService {
    provider: Arc<dyn MarketDataProvider>,
    profiles: Arc<ProfileRegistry>,
}

impl EnrichmentService {
    pub fn new(provider: Arc<dyn MarketDataProvider>, profiles: Arc<ProfileRegistry>) -> Self {
        Self { provider, profiles }
    }

    pub fn provider(&self) -> Arc<dyn MarketDataProvider> {
        self.provider.clone()
    }

    pub async fn enrich(
        &self,
        event_id: &str,
        signal: &SignalSubmission,
        profile_name: &str,
    ) -> EnrichmentOutcome {
        let profile = self.profiles.get_or_default(profile_name);
        let now = Utc::now();
        let mut flags = QualityFlags::default();
        let mut timestamps: Map<String, Value> = Map::new();
        if signal.parsed_ts().is_some() {
            timestamps.insert("signal_ts".into(), json!(signal.ts_utc));
        }

        let market_fut = self.fetch_market(signal);
        let ta_fut = self.fetch_ta(signal, profile);
        let derivs_fut = self.fetch_derivs(signal, profile);
        let (market, ta, derivs) = tokio::join!(market_fut, ta_fut, derivs_fut);

        let market_data = match market {
            MarketFetch::Ok { data, mid_ts } => {
                timestamps.insert("mid_ts".into(), json!(mid_ts.to_rfc3339()));
                Some(data)
            }
            MarketFetch::MissingVolume { data, mid_ts } => {
                timestamps.insert("mid_ts".into(), json!(mid_ts.to_rfc3339()));
                flags.missing.push("volume_24h".into());
                Some(data)
            }
            MarketFetch::Err(message) => {
                flags.provider_errors.push(format!("ticker: {message}"));
                None
            }
        };

        let mut ta_map: Map<String, Value> = Map::new();
        for per_tf in ta {
            match per_tf {
                TaFetch::Ok { timeframe, data, last_candle_ts } => {
                    timestamps.insert(
                        format!("candles_{timeframe}_ts"),
                        json!(last_candle_ts.to_rfc3339()),
                    );
                    ta_map.insert(timeframe, data);
                }
                TaFetch::Empty { timeframe } => {
                    flags.missing.push(format!("candles_{timeframe}"));
                }
                TaFetch::Err { timeframe, message } => {
                    flags
                        .provider_errors
                        .push(format!("candles_{timeframe}: {message}"));
                }
            }
        }
        let ta_data = if ta_map.is_empty() {
            None
        } else {
            Some(json!({ "timeframes": Value::Object(ta_map) }))
        };

        let derivs_data = match derivs {
            DerivsFetch::Ok { data, funding_ts } => {
                timestamps.insert("funding_ts".into(), json!(funding_ts.to_rfc3339()));
                Some(data)
            }
            DerivsFetch::NotRequested => None,
            DerivsFetch::Err(message) => {
                flags.provider_errors.push(format!("derivs: {message}"));
                None
            }
        };

        check_staleness(&timestamps, now, &mut flags);
        validate_market_data(market_data.as_ref(), &mut flags);
        validate_ta_data(ta_data.as_ref(), &mut flags);

        let constraints = serde_json::to_value(&profile.constraints).unwrap_or_else(|_| json!({}));
        let enriched_payload = json!({
            "event_id": event_id,
            "symbol": signal.symbol,
            "signal_direction": signal.signal_direction,
            "entry_price": signal.entry_price,
            "size": signal.size,
            "ts_utc": signal.ts_utc,
            "source": signal.source,
            "event_type": signal.event_type,
            "market": market_data.clone().unwrap_or_else(|| json!({})),
            "ta": ta_data.clone().unwrap_or_else(|| json!({})),
            "derivs": derivs_data.clone().unwrap_or_else(|| json!({})),
            "constraints": constraints,
        });

        let success = flags.provider_errors.is_empty() && market_data.is_some();
        EnrichmentOutcome {
            success,
            market_data,
            ta_data,
            derivs_data,
            constraints,
            data_timestamps: Value::Object(timestamps),
            quality_flags: flags,
            enriched_payload,
        }
    }

    async fn fetch_market(&self, signal: &SignalSubmission) -> MarketFetch {
        let ticker = match self.provider.ticker(&signal.symbol).await {
            Ok(t) => t,
            Err(e) => return MarketFetch::Err(e.to_string()),
        };
        let drift_bps = if signal.entry_price > 0.0 {
            (ticker.mid - signal.entry_price) / signal.entry_price * 10_000.0
        } else {
            0.0
        };
        let mut data = json!({
            "mid_price": ticker.mid,
            "bid": ticker.bid,
            "ask": ticker.ask,
            "spread_bps": ticker.spread_bps,
            "price_drift_from_entry_bps": (drift_bps * 100.0).round() / 100.0,
        });
        match self.provider.day_volume(&signal.symbol).await {
            Ok(volume) => {
                data["volume_24h"] = json!(volume);
                MarketFetch::Ok {
                    data,
                    mid_ts: ticker.timestamp,
                }
            }
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "24h volume unavailable");
                MarketFetch::MissingVolume {
                    data,
                    mid_ts: ticker.timestamp,
                }
            }
        }
    }

    async fn fetch_ta(&self, signal: &SignalSubmission, profile: &FeatureProfile) -> Vec<TaFetch> {
        let limit = profile.indicators.candle_limit();
        let futures = profile.timeframes.iter().map(|tf| {
            let tf = tf.clone();
            async move {
                match self.provider.candles(&signal.symbol, &tf, limit).await {
                    Ok(candles) if candles.is_empty() => TaFetch::Empty { timeframe: tf },
                    Ok(candles) => {
                        let last_candle_ts = candles.last().map(|c| c.timestamp).unwrap_or_else(Utc::now);
                        TaFetch::Ok {
                            data: compute_indicators(&candles, &profile.indicators),
                            timeframe: tf,
                            last_candle_ts,
                        }
                    }
                    Err(e) => TaFetch::Err {
                        timeframe: tf,
                        message: e.to_string(),
                    },
                }
            }
        });
        join_all(futures).await
    }

    async fn fetch_derivs(&self, signal: &SignalSubmission, profile: &FeatureProfile) -> DerivsFetch {
        if !profile.requires_derivs {
            return DerivsFetch::NotRequested;
        }
        let funding = match self.provider.funding_rate(&signal.symbol).await {
            Ok(f) => f,
            Err(e) => return DerivsFetch::Err(e.to_string()),
        };
        let oi = match self.provider.open_interest(&signal.symbol).await {
            Ok(oi) => oi,
            Err(e) => return DerivsFetch::Err(e.to_string()),
        };
        let mark = match self.provider.mark_price(&signal.symbol).await {
            Ok(m) => m,
            Err(e) => return DerivsFetch::Err(e.to_string()),
        };
        DerivsFetch::Ok {
            data: json!({
                "funding_rate": funding.rate,
                "predicted_funding": funding.predicted_rate,
                "funding_interval_h": 1,
                "open_interest": oi.oi_usd,
                "oi_contracts": oi.oi_contracts,
                "mark_price": mark,
            }),
            funding_ts: funding.timestamp,
        }
    }
}

enum MarketFetch {
    Ok { data: Value, mid_ts: DateTime<Utc> },
    MissingVolume { data: Value, mid_ts: DateTime<Utc> },
    Err(String),
}

enum TaFetch {
    Ok {
        timeframe: String,
        data: Value,
        last_candle_ts: DateTime<Utc>,
    },
    Empty {
        timeframe: String,
    },
    Err {
        timeframe: String,
        message: String,
    },
}

enum DerivsFetch {
    Ok { data: Value, funding_ts: DateTime<Utc> },
    NotRequested,
    Err(String),
}

fn compute_indicators(candles: &[Candle], set: &super::profile::IndicatorSet) -> Value {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut out = Map::new();

    let mut emas = Map::new();
    for period in &set.ema_periods {
        if let Some(value) = indicators::ema(&closes, *period) {
            emas.insert(period.to_string(), json!(value));
        }
    }
    out.insert("ema".into(), Value::Object(emas));

    if let Some(m) = indicators::macd(&closes, set.macd_fast, set.macd_slow, set.macd_signal) {
        out.insert(
            "macd".into(),
            json!({
                "macd_line": m.macd_line,
                "signal_line": m.signal_line,
                "histogram": m.histogram,
            }),
        );
    }
    if let Some(r) = indicators::rsi(&closes, set.rsi_period) {
        out.insert("rsi".into(), json!(r));
    }
    if let Some(a) = indicators::atr(candles, set.atr_period) {
        out.insert("atr".into(), json!(a));
    }
    if !set.sma_periods.is_empty() {
        let mut smas = Map::new();
        for period in &set.sma_periods {
            if let Some(value) = indicators::sma(&closes, *period) {
                smas.insert(period.to_string(), json!(value));
            }
        }
        out.insert("sma".into(), Value::Object(smas));
    }
    if let Some(b) = &set.bollinger {
        if let Some(bands) = indicators::bollinger(&closes, b.period, b.k) {
            out.insert(
                "bollinger".into(),
                json!({ "upper": bands.upper, "middle": bands.middle, "lower": bands.lower }),
            );
        }
    }
    if let Some(s) = &set.stochastic {
        if let Some(stoch) = indicators::stochastic(candles, s.k_period, s.d_period) {
            out.insert("stochastic".into(), json!({ "k": stoch.k, "d": stoch.d }));
        }
    }
    if let Some(period) = set.adx_period {
        if let Some(a) = indicators::adx(candles, period) {
            out.insert("adx".into(), json!(a));
        }
    }
    if set.include_volume {
        let volume: f64 = candles.iter().rev().take(24).map(|c| c.volume).sum();
        out.insert("volume_recent".into(), json!(volume));
    }
    Value::Object(out)
}

fn staleness_threshold(key: &str) -> Option<i64> {
    if key == "signal_ts" {
        return None; // signal age is the validator's concern
    }
    if let Some(rest) = key.strip_prefix("candles_") {
        let tf = rest.trim_end_matches("_ts");
        return Some(2 * interval_seconds(tf));
    }
    if key.contains("funding") {
        return Some(STALE_FUNDING_S);
    }
    if key.contains("mid") || key.contains("ticker") {
        return Some(STALE_TICKER_S);
    }
    Some(STALE_ORDERBOOK_S)
}

fn check_staleness(timestamps: &Map<String, Value>, now: DateTime<Utc>, flags: &mut QualityFlags) {
    for (key, value) in timestamps {
        let Some(threshold) = staleness_threshold(key) else {
            continue;
        };
        let Some(ts) = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        else {
            continue;
        };
        let age = (now - ts.with_timezone(&Utc)).num_seconds();
        if age > threshold {
            flags
                .stale
                .push(format!("{key}: {age}s old (threshold: {threshold}s)"));
        }
    }
}

fn validate_market_data(market_data: Option<&Value>, flags: &mut QualityFlags) {
    let Some(data) = market_data else { return };
    let get = |k: &str| data.get(k).and_then(|v| v.as_f64()).unwrap_or(0.0);
    let bid = get("bid");
    let ask = get("ask");
    let mid = get("mid_price");
    let spread_bps = get("spread_bps");

    if spread_bps > MAX_SANE_SPREAD_BPS {
        flags
            .out_of_range
            .push(format!("spread_bps: {spread_bps} (>{MAX_SANE_SPREAD_BPS} bps)"));
    }
    if bid > 0.0 && ask > 0.0 {
        if bid > ask {
            flags.out_of_range.push(format!("bid ({bid}) > ask ({ask})"));
        }
        if mid > 0.0 && (mid < bid || mid > ask) {
            flags
                .out_of_range
                .push(format!("mid ({mid}) outside bid/ask"));
        }
    }
}

fn validate_ta_data(ta_data: Option<&Value>, flags: &mut QualityFlags) {
    let Some(timeframes) = ta_data
        .and_then(|d| d.get("timeframes"))
        .and_then(|t| t.as_object())
    else {
        return;
    };
    for (tf, ind) in timeframes {
        if let Some(rsi) = ind.get("rsi").and_then(|v| v.as_f64()) {
            if !(0.0..=100.0).contains(&rsi) {
                flags
                    .out_of_range
                    .push(format!("{tf}_rsi: {rsi} (should be 0-100)"));
            }
        }
        if let Some(atr) = ind.get("atr").and_then(|v| v.as_f64()) {
            if atr < 0.0 {
                flags
                    .out_of_range
                    .push(format!("{tf}_atr: {atr} (should be positive)"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn candle_staleness_scales_with_interval() {
        assert_eq!(staleness_threshold("candles_1h_ts"), Some(7200));
        assert_eq!(staleness_threshold("candles_15m_ts"), Some(1800));
        assert_eq!(staleness_threshold("funding_ts"), Some(60));
        assert_eq!(staleness_threshold("mid_ts"), Some(10));
        assert_eq!(staleness_threshold("signal_ts"), None);
    }

    #[test]
    fn stale_mid_is_flagged() {
        let mut flags = QualityFlags::default();
        let mut timestamps = Map::new();
        let old = Utc::now() - Duration::seconds(30);
        timestamps.insert("mid_ts".into(), json!(old.to_rfc3339()));
        check_staleness(&timestamps, Utc::now(), &mut flags);
        assert_eq!(flags.stale.len(), 1);
        assert!(flags.stale[0].starts_with("mid_ts"));
    }

    #[test]
    fn fresh_timestamps_raise_no_flags() {
        let mut flags = QualityFlags::default();
        let mut timestamps = Map::new();
        timestamps.insert("mid_ts".into(), json!(Utc::now().to_rfc3339()));
        timestamps.insert("candles_1h_ts".into(), json!(Utc::now().to_rfc3339()));
        check_staleness(&timestamps, Utc::now(), &mut flags);
        assert!(flags.stale.is_empty());
    }

    #[test]
    fn crossed_book_and_wide_spread_flagged() {
        let mut flags = QualityFlags::default();
        let data = json!({
            "bid": 101.0,
            "ask": 100.0,
            "mid_price": 150.0,
            "spread_bps": 250.0,
        });
        validate_market_data(Some(&data), &mut flags);
        assert_eq!(flags.out_of_range.len(), 3);
    }

    #[test]
    fn mid_inside_book_not_flagged() {
        let mut flags = QualityFlags::default();
        let data = json!({
            "bid": 99.0,
            "ask": 101.0,
            "mid_price": 100.0,
            "spread_bps": 20.0,
        });
        validate_market_data(Some(&data), &mut flags);
        assert!(flags.out_of_range.is_empty());
    }

    #[test]
    fn bad_rsi_and_negative_atr_flagged() {
        let mut flags = QualityFlags::default();
        let ta = json!({
            "timeframes": {
                "1h": { "rsi": 140.0, "atr": -2.0 },
                "4h": { "rsi": 55.0, "atr": 12.0 },
            }
        });
        validate_ta_data(Some(&ta), &mut flags);
        assert_eq!(flags.out_of_range.len(), 2);
    }
}
