//! Pre-enrichment signal gate.
//!
//! Two checks, in order: age (no network call) then price drift against the
//! current mid. Both thresholds are strict `>`. A hard failure marks the
//! signal rejected; provider errors during the drift fetch are transient and
//! bubble up for retry.

use crate::models::SignalSubmission;
use crate::providers::{MarketDataProvider, ProviderError};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason_code: &'static str,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub current_price: Option<f64>,
    pub drift_bps: f64,
    pub age_seconds: f64,
    pub rejection: Option<Rejection>,
}

pub struct SignalValidator {
    provider: Arc<dyn MarketDataProvider>,
    max_age_s: i64,
    max_drift_bps: f64,
}

impl SignalValidator {
    pub fn new(provider: Arc<dyn MarketDataProvider>, max_age_s: i64, max_drift_bps: f64) -> Self {
        Self {
            provider,
            max_age_s,
            max_drift_bps,
        }
    }

    pub async fn validate(
        &self,
        signal: &SignalSubmission,
    ) -> Result<ValidationOutcome, ProviderError> {
        let now = Utc::now();
        let age_seconds = signal.age_seconds(now);

        // Age first: needs no network call.
        if age_seconds > self.max_age_s as f64 {
            let message = format!(
                "Signal too old: {age_seconds:.0}s (max: {}s)",
                self.max_age_s
            );
            warn!(symbol = %signal.symbol, age_s = age_seconds, "Signal rejected as stale");
            return Ok(ValidationOutcome {
                valid: false,
                current_price: None,
                drift_bps: 0.0,
                age_seconds,
                rejection: Some(Rejection {
                    reason_code: "signal_too_old",
                    message,
                    details: json!({
                        "signal_age_seconds": age_seconds,
                        "max_signal_age_seconds": self.max_age_s,
                    }),
                }),
            });
        }

        // Zero entry price: nothing to measure drift against.
        if signal.entry_price <= 0.0 {
            return Ok(ValidationOutcome {
                valid: true,
                current_price: None,
                drift_bps: 0.0,
                age_seconds,
                rejection: None,
            });
        }

        let ticker = self.provider.ticker(&signal.symbol).await?;
        let current = ticker.mid;
        let drift_bps = if current > 0.0 {
            ((current - signal.entry_price) / signal.entry_price).abs() * 10_000.0
        } else {
            0.0
        };

        if drift_bps > self.max_drift_bps {
            let message = format!(
                "Price drift too high: {:.2}% (max: {:.1}%)",
                drift_bps / 100.0,
                self.max_drift_bps / 100.0
            );
            warn!(
                symbol = %signal.symbol,
                entry = signal.entry_price,
                current,
                drift_bps,
                "Signal rejected on drift"
            );
            return Ok(ValidationOutcome {
                valid: false,
                current_price: Some(current),
                drift_bps,
                age_seconds,
                rejection: Some(Rejection {
                    reason_code: "price_drift_too_high",
                    message,
                    details: json!({
                        "entry_price": signal.entry_price,
                        "current_price": current,
                        "drift_bps": (drift_bps * 100.0).round() / 100.0,
                        "max_drift_bps": self.max_drift_bps,
                    }),
                }),
            });
        }

        info!(
            symbol = %signal.symbol,
            drift_bps,
            age_s = age_seconds,
            "Signal validated"
        );
        Ok(ValidationOutcome {
            valid: true,
            current_price: Some(current),
            drift_bps,
            age_seconds,
            rejection: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        Candle, FundingRate, OpenInterest, OrderBook, ProviderResult, Ticker,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use parking_lot::Mutex;

    struct FixedPriceProvider {
        mid: f64,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl MarketDataProvider for FixedPriceProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn ticker(&self, symbol: &str) -> ProviderResult<Ticker> {
            *self.calls.lock() += 1;
            Ok(Ticker {
                symbol: symbol.to_string(),
                mid: self.mid,
                bid: self.mid - 0.5,
                ask: self.mid + 0.5,
                spread_bps: 1.0,
                timestamp: Utc::now(),
            })
        }
        async fn candles(&self, _: &str, _: &str, _: usize) -> ProviderResult<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn orderbook(&self, symbol: &str, _: usize) -> ProviderResult<OrderBook> {
            Ok(OrderBook {
                symbol: symbol.to_string(),
                bids: Vec::new(),
                asks: Vec::new(),
                timestamp: Utc::now(),
            })
        }
        async fn funding_rate(&self, symbol: &str) -> ProviderResult<FundingRate> {
            Ok(FundingRate {
                symbol: symbol.to_string(),
                rate: 0.0,
                predicted_rate: None,
                timestamp: Utc::now(),
            })
        }
        async fn open_interest(&self, symbol: &str) -> ProviderResult<OpenInterest> {
            Ok(OpenInterest {
                symbol: symbol.to_string(),
                oi_usd: 0.0,
                oi_contracts: None,
                timestamp: Utc::now(),
            })
        }
        async fn mark_price(&self, _: &str) -> ProviderResult<f64> {
            Ok(self.mid)
        }
        async fn day_volume(&self, _: &str) -> ProviderResult<f64> {
            Ok(0.0)
        }
    }

    fn signal(entry_price: f64, age: Duration) -> SignalSubmission {
        SignalSubmission {
            event_type: "OPEN_SIGNAL".into(),
            symbol: "BTC".into(),
            signal_direction: "long".into(),
            entry_price,
            size: 0.1,
            liquidation_price: None,
            ts_utc: (Utc::now() - age).to_rfc3339(),
            source: "s1".into(),
            feature_profile: None,
        }
    }

    fn validator(mid: f64) -> (Arc<FixedPriceProvider>, SignalValidator) {
        let provider = Arc::new(FixedPriceProvider {
            mid,
            calls: Mutex::new(0),
        });
        let v = SignalValidator::new(provider.clone(), 300, 200.0);
        (provider, v)
    }

    #[tokio::test]
    async fn fresh_signal_near_market_passes() {
        let (_, v) = validator(42000.0);
        let outcome = v.validate(&signal(42000.0, Duration::seconds(5))).await.unwrap();
        assert!(outcome.valid);
        assert!(outcome.drift_bps < 1.0);
    }

    #[tokio::test]
    async fn stale_signal_rejected_without_provider_call() {
        let (provider, v) = validator(42000.0);
        let outcome = v
            .validate(&signal(42000.0, Duration::seconds(600)))
            .await
            .unwrap();
        assert!(!outcome.valid);
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.reason_code, "signal_too_old");
        assert!(rejection.message.contains("old"));
        // Age check fired before any network call.
        assert_eq!(*provider.calls.lock(), 0);
    }

    #[tokio::test]
    async fn excessive_drift_rejected() {
        // Current 50000 vs entry 45000 → ~1111 bps, well past 200.
        let (_, v) = validator(50000.0);
        let outcome = v.validate(&signal(45000.0, Duration::seconds(5))).await.unwrap();
        assert!(!outcome.valid);
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.reason_code, "price_drift_too_high");
        assert!(rejection.message.contains("drift"));
        assert_eq!(outcome.current_price, Some(50000.0));
    }

    #[tokio::test]
    async fn drift_below_threshold_passes() {
        // 42000 → 42500 is ~119 bps, under the 200 bps limit.
        let (_, v) = validator(42500.0);
        let outcome = v.validate(&signal(42000.0, Duration::seconds(5))).await.unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn zero_entry_price_skips_drift_and_passes() {
        let (provider, v) = validator(50000.0);
        let outcome = v.validate(&signal(0.0, Duration::seconds(5))).await.unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.drift_bps, 0.0);
        assert_eq!(*provider.calls.lock(), 0);
    }
}
