//! Feature profiles: named bundles of timeframes, indicator parameters, a
//! derivatives flag and trading constraints selecting what enrichment
//! computes. Built-ins cover the shipped profiles; a TOML file can override
//! or extend them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraints {
    pub max_position_size_pct: f64,
    pub min_hold_minutes: u32,
    pub max_trades_per_hour: u32,
    pub max_leverage: u32,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_position_size_pct: 20.0,
            min_hold_minutes: 30,
            max_trades_per_hour: 4,
            max_leverage: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorSet {
    pub ema_periods: Vec<usize>,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub sma_periods: Vec<usize>,
    pub bollinger: Option<BollingerParams>,
    pub stochastic: Option<StochasticParams>,
    pub adx_period: Option<usize>,
    pub include_volume: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BollingerParams {
    pub period: usize,
    pub k: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StochasticParams {
    pub k_period: usize,
    pub d_period: usize,
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self {
            ema_periods: vec![9, 21, 50],
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            atr_period: 14,
            sma_periods: Vec::new(),
            bollinger: None,
            stochastic: None,
            adx_period: None,
            include_volume: false,
        }
    }
}

impl IndicatorSet {
    /// Candle history needed for the slowest indicator, plus buffer.
    pub fn candle_limit(&self) -> usize {
        let mut max_period = self.macd_slow + self.macd_signal;
        for p in &self.ema_periods {
            max_period = max_period.max(*p);
        }
        for p in &self.sma_periods {
            max_period = max_period.max(*p);
        }
        max_period = max_period.max(self.rsi_period).max(self.atr_period);
        if let Some(b) = &self.bollinger {
            max_period = max_period.max(b.period);
        }
        if let Some(s) = &self.stochastic {
            max_period = max_period.max(s.k_period + s.d_period);
        }
        if let Some(p) = self.adx_period {
            max_period = max_period.max(2 * p + 1);
        }
        max_period + 50
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureProfile {
    #[serde(default)]
    pub name: String,
    pub timeframes: Vec<String>,
    #[serde(default)]
    pub indicators: IndicatorSet,
    #[serde(default)]
    pub requires_derivs: bool,
    #[serde(default)]
    pub constraints: Constraints,
}

impl FeatureProfile {
    fn trend_follow_v1() -> Self {
        Self {
            name: "trend_follow_v1".into(),
            timeframes: vec!["15m".into(), "1h".into(), "4h".into()],
            indicators: IndicatorSet::default(),
            requires_derivs: false,
            constraints: Constraints::default(),
        }
    }

    fn crypto_perps_v1() -> Self {
        Self {
            name: "crypto_perps_v1".into(),
            requires_derivs: true,
            ..Self::trend_follow_v1()
        }
    }

    fn full_v1() -> Self {
        Self {
            name: "full_v1".into(),
            timeframes: vec!["15m".into(), "1h".into(), "4h".into(), "1d".into()],
            indicators: IndicatorSet {
                sma_periods: vec![20, 200],
                bollinger: Some(BollingerParams { period: 20, k: 2.0 }),
                stochastic: Some(StochasticParams {
                    k_period: 14,
                    d_period: 3,
                }),
                adx_period: Some(14),
                include_volume: true,
                ..IndicatorSet::default()
            },
            requires_derivs: true,
            constraints: Constraints::default(),
        }
    }
}

/// Profile lookup, built-ins overlaid with an optional TOML file of the shape
/// `[profiles.<name>]`.
pub struct ProfileRegistry {
    profiles: HashMap<String, FeatureProfile>,
}

#[derive(Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: HashMap<String, FeatureProfile>,
}

impl ProfileRegistry {
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();
        for p in [
            FeatureProfile::trend_follow_v1(),
            FeatureProfile::crypto_perps_v1(),
            FeatureProfile::full_v1(),
        ] {
            profiles.insert(p.name.clone(), p);
        }
        Self { profiles }
    }

    pub fn with_overrides(path: &str) -> Result<Self> {
        let mut registry = Self::builtin();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile file {path}"))?;
        let file: ProfileFile =
            toml::from_str(&raw).with_context(|| format!("Failed to parse profile file {path}"))?;
        for (name, mut profile) in file.profiles {
            profile.name = name.clone();
            registry.profiles.insert(name, profile);
        }
        info!(path, profiles = registry.profiles.len(), "Feature profiles loaded");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&FeatureProfile> {
        self.profiles.get(name)
    }

    /// Named profile, or trend_follow_v1 when the name is unknown.
    pub fn get_or_default(&self, name: &str) -> &FeatureProfile {
        self.profiles
            .get(name)
            .unwrap_or_else(|| &self.profiles["trend_follow_v1"])
    }
}
