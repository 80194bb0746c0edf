use crate::indicators::calculate_rsi;
use crate::models::{Bar, RawFactorValue};
use chrono::NaiveDate;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

pub const RETURN_3M: &str = "return_3m";
pub const RETURN_6M: &str = "return_6m";
pub const RETURN_12M: &str = "return_12m";
pub const RSI_14: &str = "rsi_14";
pub const VOLATILITY_1Y: &str = "volatility_1y";
pub const MAX_DRAWDOWN_1Y: &str = "max_drawdown_1y";

pub const TRADING_DAYS_PER_YEAR: usize = 252;
const RETURN_WINDOWS: [(&str, usize); 3] = [(RETURN_3M, 63), (RETURN_6M, 126), (RETURN_12M, 252)];

/// Names of the factors this module derives from daily bars.
pub const PRICE_FACTORS: [&str; 6] = [
    RETURN_3M,
    RETURN_6M,
    RETURN_12M,
    RSI_14,
    VOLATILITY_1Y,
    MAX_DRAWDOWN_1Y,
];

fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Percent change of the close over the trailing `bars` bars.
pub fn trailing_return_pct(closes: &[f64], index: usize, bars: usize) -> Option<f64> {
    if bars == 0 || index >= closes.len() || index < bars {
        return None;
    }
    let start = closes[index - bars];
    if start <= 0.0 {
        return None;
    }
    finite((closes[index] / start - 1.0) * 100.0)
}

/// Annualized standard deviation of daily returns, in percent, over the
/// `window` returns ending at `index`.
pub fn annualized_volatility_pct(closes: &[f64], index: usize, window: usize) -> Option<f64> {
    if window < 2 || index >= closes.len() || index < window {
        return None;
    }
    let mut returns = Vec::with_capacity(window);
    for i in index + 1 - window..=index {
        let previous = closes[i - 1];
        if previous <= 0.0 {
            return None;
        }
        returns.push(closes[i] / previous - 1.0);
    }
    let std_dev = returns.std_dev();
    finite(std_dev * (TRADING_DAYS_PER_YEAR as f64).sqrt() * 100.0)
}

/// Largest peak-to-trough decline of the close, as a positive percentage,
/// over the `window` bars ending at `index`.
pub fn max_drawdown_pct(closes: &[f64], index: usize, window: usize) -> Option<f64> {
    if window == 0 || index >= closes.len() || index + 1 < window {
        return None;
    }
    let mut peak = f64::MIN;
    let mut max_drawdown: f64 = 0.0;
    for &close in &closes[index + 1 - window..=index] {
        peak = peak.max(close);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - close) / peak);
        }
    }
    finite(max_drawdown * 100.0)
}

/// Derives the price-based factors for every daily bar dated on or after `since`.
pub fn derive_price_factors(symbol: &str, bars: &[Bar], since: NaiveDate) -> Vec<RawFactorValue> {
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let rsi = calculate_rsi(&closes, 14);

    let mut values = Vec::new();
    for (index, bar) in bars.iter().enumerate() {
        if bar.date < since {
            continue;
        }
        let mut push = |factor: &str, value: Option<f64>| {
            values.push(RawFactorValue {
                symbol: symbol.to_string(),
                date: bar.date,
                factor: factor.to_string(),
                value,
            });
        };
        for (factor, window) in RETURN_WINDOWS {
            push(factor, trailing_return_pct(&closes, index, window));
        }
        push(RSI_14, rsi[index]);
        push(
            VOLATILITY_1Y,
            annualized_volatility_pct(&closes, index, TRADING_DAYS_PER_YEAR),
        );
        push(
            MAX_DRAWDOWN_1Y,
            max_drawdown_pct(&closes, index, TRADING_DAYS_PER_YEAR),
        );
    }
    values
}

/// Combines derived and provider values. A provider value wins over a derived
/// one with the same (symbol, date, factor) unless the provider has no reading.
pub fn merge_factor_values(
    derived: Vec<RawFactorValue>,
    provided: Vec<RawFactorValue>,
) -> Vec<RawFactorValue> {
    let mut merged: BTreeMap<(NaiveDate, String, String), RawFactorValue> = BTreeMap::new();
    for value in derived {
        merged.insert(
            (value.date, value.symbol.clone(), value.factor.clone()),
            value,
        );
    }
    for value in provided {
        let key = (value.date, value.symbol.clone(), value.factor.clone());
        if value.value.is_none() && merged.get(&key).is_some_and(|v| v.value.is_some()) {
            continue;
        }
        merged.insert(key, value);
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_utils::weekday_calendar;
    use crate::models::Timeframe;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let dates = weekday_calendar(NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), closes.len());
        closes
            .iter()
            .zip(dates)
            .map(|(&close, date)| Bar {
                symbol: "F".to_string(),
                timeframe: Timeframe::Daily,
                date,
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    fn raw(symbol: &str, factor: &str, value: Option<f64>) -> RawFactorValue {
        RawFactorValue {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            factor: factor.to_string(),
            value,
        }
    }

    #[test]
    fn test_trailing_return() {
        let closes: Vec<f64> = (0..70).map(|i| 100.0 + i as f64).collect();
        assert!((trailing_return_pct(&closes, 63, 63).unwrap() - 63.0).abs() < 1e-9);
        assert!(trailing_return_pct(&closes, 62, 63).is_none());
    }

    #[test]
    fn test_constant_growth_has_zero_volatility() {
        let closes: Vec<f64> = (0..260).map(|i| 100.0 * 1.001f64.powi(i)).collect();
        let vol = annualized_volatility_pct(&closes, 259, 252).unwrap();
        assert!(vol.abs() < 1e-6);
        assert!(annualized_volatility_pct(&closes, 200, 252).is_none());
    }

    #[test]
    fn test_max_drawdown() {
        let closes = vec![100.0, 120.0, 90.0, 110.0, 60.0, 130.0];
        let dd = max_drawdown_pct(&closes, 5, 6).unwrap();
        assert!((dd - 50.0).abs() < 1e-9);
        assert!(max_drawdown_pct(&closes, 3, 6).is_none());
    }

    #[test]
    fn test_derive_price_factors_respects_since_and_windows() {
        let closes: Vec<f64> = (0..100).map(|i| 50.0 + (i as f64 * 0.2).sin()).collect();
        let bars = bars_from_closes(&closes);
        let since = bars[90].date;
        let values = derive_price_factors("F", &bars, since);
        assert_eq!(values.len(), 10 * PRICE_FACTORS.len());
        assert!(values.iter().all(|v| v.date >= since));

        let on = |factor: &str| {
            values
                .iter()
                .find(|v| v.date == since && v.factor == factor)
                .unwrap()
                .value
        };
        assert!(on(RETURN_3M).is_some());
        assert!(on(RETURN_6M).is_none());
        assert!(on(RSI_14).is_some());
        assert!(on(VOLATILITY_1Y).is_none());
    }

    #[test]
    fn test_provider_values_take_precedence() {
        let derived = vec![raw("A", RETURN_3M, Some(5.0)), raw("A", RSI_14, Some(40.0))];
        let provided = vec![raw("A", RETURN_3M, Some(7.0)), raw("A", RSI_14, None)];
        let merged = merge_factor_values(derived, provided);
        assert_eq!(merged.len(), 2);
        let value = |factor: &str| merged.iter().find(|v| v.factor == factor).unwrap().value;
        assert_eq!(value(RETURN_3M), Some(7.0));
        assert_eq!(value(RSI_14), Some(40.0));
    }
}
