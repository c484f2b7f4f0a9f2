//! Technical indicator math.
//!
//! Pure functions over candle slices; no I/O, no suspension. Candles are
//! expected oldest-first. Every function returns None when the input is too
//! short for the requested period.

use crate::providers::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).and_then(|s| s.last().copied())
}

pub fn ema_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);
    let mut current = seed;
    for v in &values[period..] {
        current = alpha * v + (1.0 - alpha) * current;
        series.push(current);
    }
    Some(series)
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast >= slow || closes.len() < slow + signal {
        return None;
    }
    let fast_series = ema_series(closes, fast)?;
    let slow_series = ema_series(closes, slow)?;
    // Align the two series on their tails.
    let len = slow_series.len();
    let fast_tail = &fast_series[fast_series.len() - len..];
    let macd_values: Vec<f64> = fast_tail
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_series = ema_series(&macd_values, signal)?;
    let macd_line = *macd_values.last()?;
    let signal_line = *signal_series.last()?;
    Some(Macd {
        macd_line,
        signal_line,
        histogram: macd_line - signal_line,
    })
}

/// RSI with Wilder smoothing.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in closes[..period + 1].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect()
}

/// ATR with Wilder smoothing.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let trs = true_ranges(candles);
    let mut value = trs[..period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
    }
    Some(value)
}

pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bollinger> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let middle = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let variance =
        window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();
    Some(Bollinger {
        upper: middle + k * std_dev,
        middle,
        lower: middle - k * std_dev,
    })
}

/// Stochastic oscillator; %D is the SMA of the last `d_period` %K values.
pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Option<Stochastic> {
    if k_period == 0 || d_period == 0 || candles.len() < k_period + d_period - 1 {
        return None;
    }
    let k_at = |end: usize| -> f64 {
        let window = &candles[end + 1 - k_period..=end];
        let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        if high > low {
            (candles[end].close - low) / (high - low) * 100.0
        } else {
            50.0
        }
    };
    let last = candles.len() - 1;
    let ks: Vec<f64> = (0..d_period).map(|i| k_at(last - i)).collect();
    Some(Stochastic {
        k: ks[0],
        d: ks.iter().sum::<f64>() / d_period as f64,
    })
}

/// Average directional index over `period` with Wilder smoothing.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }
    let trs = true_ranges(candles);
    let mut plus_dm = Vec::with_capacity(trs.len());
    let mut minus_dm = Vec::with_capacity(trs.len());
    for w in candles.windows(2) {
        let up = w[1].high - w[0].high;
        let down = w[0].low - w[1].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let wilder = |values: &[f64]| -> Vec<f64> {
        let mut out = Vec::with_capacity(values.len());
        let mut smoothed = values[..period].iter().sum::<f64>();
        out.push(smoothed);
        for v in &values[period..] {
            smoothed = smoothed - smoothed / period as f64 + v;
            out.push(smoothed);
        }
        out
    };

    let tr_s = wilder(&trs);
    let plus_s = wilder(&plus_dm);
    let minus_s = wilder(&minus_dm);

    let dxs: Vec<f64> = tr_s
        .iter()
        .zip(plus_s.iter().zip(minus_s.iter()))
        .filter_map(|(tr, (p, m))| {
            if *tr == 0.0 {
                return None;
            }
            let pdi = p / tr * 100.0;
            let mdi = m / tr * 100.0;
            let sum = pdi + mdi;
            if sum == 0.0 {
                None
            } else {
                Some((pdi - mdi).abs() / sum * 100.0)
            }
        })
        .collect();
    if dxs.len() < period {
        return None;
    }
    let mut adx = dxs[..period].iter().sum::<f64>() / period as f64;
    for dx in &dxs[period..] {
        adx = (adx * (period as f64 - 1.0) + dx) / period as f64;
    }
    Some(adx)
}
