use crate::config::IndicatorWindows;
use crate::models::{Bar, IndicatorSnapshot};
use std::collections::BTreeMap;

/// Drops NaN and infinite values so they can never leak into snapshots.
fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

fn safe_div(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }
    finite(numerator / denominator)
}

pub fn calculate_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut sma_values = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return sma_values;
    }

    let mut window_sum: f64 = values[..period].iter().sum();
    sma_values[period - 1] = finite(window_sum / period as f64);
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        sma_values[i] = finite(window_sum / period as f64);
    }

    sma_values
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        // A perfectly flat window has no defined relative strength.
        None
    } else if avg_loss == 0.0 {
        Some(100.0)
    } else {
        let rs = avg_gain / avg_loss;
        finite(100.0 - 100.0 / (1.0 + rs))
    }
}

/// RSI with Wilder smoothing. The first value lands at index `period`.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return rsi_values;
    }

    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    rsi_values
}

/// True range per bar; the first bar has no previous close and yields `None`.
pub fn calculate_true_range(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut tr_values = vec![None; bars.len()];
    for i in 1..bars.len() {
        let bar = &bars[i];
        let prev_close = bars[i - 1].close;
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        tr_values[i] = finite(tr);
    }
    tr_values
}

/// Wilder ATR: seeded with the mean of the first `period` true ranges, then
/// smoothed with alpha = 1/period. First value at index `period`.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let n = bars.len();
    let mut atr = vec![None; n];
    if period == 0 || n < period + 1 {
        return atr;
    }

    let tr = calculate_true_range(bars);
    let seed: Option<Vec<f64>> = tr[1..=period].iter().copied().collect();
    let Some(seed) = seed else {
        return atr;
    };
    let mut prev_atr = seed.iter().sum::<f64>() / period as f64;
    atr[period] = finite(prev_atr);

    for i in (period + 1)..n {
        let Some(current_tr) = tr[i] else {
            continue;
        };
        prev_atr = ((prev_atr * (period as f64 - 1.0)) + current_tr) / period as f64;
        atr[i] = finite(prev_atr);
    }

    atr
}

/// Wilder ADX. Directional movement and true range are smoothed over
/// `period`, DX values are smoothed again; the first ADX lands at
/// index `2 * period - 1` when directional movement is defined from the start.
pub fn calculate_adx(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let n = bars.len();
    let mut adx_values = vec![None; n];
    if period == 0 || n < 2 * period {
        return adx_values;
    }

    let mut tr_values = vec![0.0; n];
    let mut dm_plus_values = vec![0.0; n];
    let mut dm_minus_values = vec![0.0; n];

    // Calculate True Range and Directional Movement
    for i in 1..n {
        let (high, low, prev) = (bars[i].high, bars[i].low, &bars[i - 1]);
        tr_values[i] = (high - low)
            .max((high - prev.close).abs())
            .max((low - prev.close).abs());

        let up_move = high - prev.high;
        let down_move = prev.low - low;
        dm_plus_values[i] = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        dm_minus_values[i] = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };
    }

    let mut smoothed_tr: f64 = tr_values[1..=period].iter().sum();
    let mut smoothed_plus: f64 = dm_plus_values[1..=period].iter().sum();
    let mut smoothed_minus: f64 = dm_minus_values[1..=period].iter().sum();

    let dx_at = |tr: f64, plus: f64, minus: f64| -> Option<f64> {
        let di_plus = safe_div(plus, tr)? * 100.0;
        let di_minus = safe_div(minus, tr)? * 100.0;
        safe_div((di_plus - di_minus).abs(), di_plus + di_minus).map(|dx| dx * 100.0)
    };

    let mut dx_values: Vec<Option<f64>> = vec![None; n];
    dx_values[period] = dx_at(smoothed_tr, smoothed_plus, smoothed_minus);
    for i in (period + 1)..n {
        smoothed_tr = smoothed_tr - smoothed_tr / period as f64 + tr_values[i];
        smoothed_plus = smoothed_plus - smoothed_plus / period as f64 + dm_plus_values[i];
        smoothed_minus = smoothed_minus - smoothed_minus / period as f64 + dm_minus_values[i];
        dx_values[i] = dx_at(smoothed_tr, smoothed_plus, smoothed_minus);
    }

    // ADX seeds from the first run of `period` consecutive defined DX values.
    // Later bars with an undefined DX stay null and leave the average untouched.
    let mut run_start = period;
    let mut seed_end = None;
    for i in period..n {
        if dx_values[i].is_none() {
            run_start = i + 1;
        } else if i + 1 - run_start == period {
            seed_end = Some(i);
            break;
        }
    }
    let Some(seed_end) = seed_end else {
        return adx_values;
    };
    let seed_sum: f64 = dx_values[run_start..=seed_end].iter().flatten().sum();
    let mut prev_adx = seed_sum / period as f64;
    adx_values[seed_end] = finite(prev_adx);

    for i in (seed_end + 1)..n {
        if let Some(dx) = dx_values[i] {
            prev_adx = (prev_adx * (period as f64 - 1.0) + dx) / period as f64;
            adx_values[i] = finite(prev_adx);
        }
    }

    adx_values
}

/// Mean volume over the `period` bars preceding each bar, so a surge bar is
/// measured against history rather than diluting its own average.
pub fn calculate_prior_average_volume(volumes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut averages = vec![None; volumes.len()];
    if period == 0 || volumes.len() <= period {
        return averages;
    }

    let mut window_sum: f64 = volumes[..period].iter().sum();
    for i in period..volumes.len() {
        averages[i] = finite(window_sum / period as f64);
        window_sum += volumes[i] - volumes[i - period];
    }
    averages
}

pub fn ma_distance_pct(close: f64, moving_average: Option<f64>) -> Option<f64> {
    let ma = moving_average?;
    safe_div(close - ma, ma).map(|ratio| ratio * 100.0)
}

pub fn volume_ratio(volume: f64, average_volume: Option<f64>) -> Option<f64> {
    safe_div(volume, average_volume?)
}

pub fn range_pct(bar: &Bar) -> Option<f64> {
    safe_div(bar.high - bar.low, bar.close).map(|ratio| ratio * 100.0)
}

pub fn compute_snapshots(bars: &[Bar], windows: &IndicatorWindows) -> Vec<IndicatorSnapshot> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let rsi = calculate_rsi(&closes, windows.rsi_period);
    let adx = calculate_adx(bars, windows.adx_period);
    let atr = calculate_atr(bars, windows.atr_period);
    let avg_volume = calculate_prior_average_volume(&volumes, windows.volume_avg_period);
    let moving_averages: Vec<(usize, Vec<Option<f64>>)> = windows
        .ma_periods
        .iter()
        .map(|&period| (period, calculate_sma(&closes, period)))
        .collect();

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let ma_distance_pct: BTreeMap<usize, Option<f64>> = moving_averages
                .iter()
                .map(|(period, series)| (*period, ma_distance_pct(bar.close, series[i])))
                .collect();
            IndicatorSnapshot {
                date: Some(bar.date),
                rsi: rsi[i],
                adx: adx[i],
                atr: atr[i],
                ma_distance_pct,
                avg_volume: avg_volume[i],
                volume_ratio: volume_ratio(bar.volume, avg_volume[i]),
                range_pct: range_pct(bar),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::{Duration, NaiveDate};

    fn bar(offset: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "T".to_string(),
            timeframe: Timeframe::Daily,
            date: NaiveDate::from_ymd_opt(2022, 1, 3).unwrap() + Duration::days(offset),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn wave(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05;
                bar(i as i64, base, base + 1.5, base - 1.5, base + 0.4, 1_000.0 + i as f64)
            })
            .collect()
    }

    fn all_values(snapshot: &IndicatorSnapshot) -> Vec<Option<f64>> {
        let mut values = vec![
            snapshot.rsi,
            snapshot.adx,
            snapshot.atr,
            snapshot.avg_volume,
            snapshot.volume_ratio,
            snapshot.range_pct,
        ];
        values.extend(snapshot.ma_distance_pct.values().copied());
        values
    }

    #[test]
    fn sma_is_null_until_window_is_full() {
        let sma = calculate_sma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(sma, vec![None, None, Some(2.0), Some(3.0)]);
        assert!(calculate_sma(&[1.0, 2.0], 3).iter().all(|v| v.is_none()));
    }

    #[test]
    fn rsi_matches_wilder_reference() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ];
        let rsi = calculate_rsi(&closes, 14);
        assert!(rsi[..14].iter().all(|v| v.is_none()));
        let first = rsi[14].expect("rsi at index 14");
        assert!((first - 70.46).abs() < 0.1, "unexpected rsi {}", first);
        let last = rsi[19].expect("rsi at index 19");
        assert!(last < first);
    }

    #[test]
    fn flat_prices_yield_null_instead_of_nan() {
        let bars: Vec<Bar> = (0..260)
            .map(|i| bar(i, 10.0, 10.0, 10.0, 10.0, 0.0))
            .collect();
        let windows = IndicatorWindows::for_timeframe(Timeframe::Daily);
        let snapshots = compute_snapshots(&bars, &windows);

        let last = snapshots.last().unwrap();
        assert_eq!(last.rsi, None);
        assert_eq!(last.adx, None);
        assert_eq!(last.atr, Some(0.0));
        assert_eq!(last.volume_ratio, None);
        assert_eq!(last.range_pct, Some(0.0));
        assert_eq!(last.ma_distance(200), Some(0.0));
        for snapshot in &snapshots {
            for value in all_values(snapshot).into_iter().flatten() {
                assert!(value.is_finite());
            }
        }
    }

    #[test]
    fn zero_prices_never_divide_by_zero() {
        let bars: Vec<Bar> = (0..40)
            .map(|i| bar(i, 0.0, 0.0, 0.0, 0.0, if i % 2 == 0 { 0.0 } else { 5.0 }))
            .collect();
        let windows = IndicatorWindows {
            rsi_period: 5,
            adx_period: 5,
            atr_period: 5,
            ma_periods: vec![3],
            volume_avg_period: 1,
        };
        for snapshot in compute_snapshots(&bars, &windows) {
            assert_eq!(snapshot.range_pct, None);
            assert_eq!(snapshot.ma_distance(3), None);
            for value in all_values(&snapshot).into_iter().flatten() {
                assert!(value.is_finite());
            }
        }
    }

    #[test]
    fn long_windows_stay_null_on_short_history() {
        let bars = wave(150);
        let snapshots = compute_snapshots(&bars, &IndicatorWindows::for_timeframe(Timeframe::Daily));
        assert!(snapshots.iter().all(|s| s.ma_distance(200).is_none()));
        assert!(snapshots[149].ma_distance(50).is_some());
        assert!(snapshots[49].avg_volume.is_none());
        assert!(snapshots[50].avg_volume.is_some());
    }

    #[test]
    fn atr_and_adx_start_at_expected_indices() {
        let bars = wave(60);
        let atr = calculate_atr(&bars, 14);
        assert!(atr[13].is_none());
        assert!(atr[14].is_some());

        let adx = calculate_adx(&bars, 14);
        assert!(adx[26].is_none());
        let value = adx[27].expect("adx defined at 2 * period - 1");
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn adx_recovers_after_flat_opening_stretch() {
        let mut bars: Vec<Bar> = (0..20)
            .map(|i| bar(i, 10.0, 10.5, 9.5, 10.0, 1_000.0))
            .collect();
        bars.extend((20..120).map(|i| {
            let base = 10.0 + ((i - 20) as f64 * 0.3).sin() * 2.0;
            bar(i, base, base + 0.5, base - 0.5, base + 0.1, 1_000.0)
        }));

        let adx = calculate_adx(&bars, 14);
        assert!(adx[..27].iter().all(|v| v.is_none()));
        assert!(adx[119].is_some());
        let defined: Vec<f64> = adx.iter().flatten().copied().collect();
        assert!(defined.len() > 60, "only {} defined ADX values", defined.len());
        assert!(defined.iter().all(|v| (0.0..=100.0).contains(v)));
    }

    #[test]
    fn prior_average_volume_excludes_current_bar() {
        let volumes = [100.0, 100.0, 100.0, 400.0];
        let averages = calculate_prior_average_volume(&volumes, 3);
        assert_eq!(averages, vec![None, None, None, Some(100.0)]);
        assert_eq!(volume_ratio(400.0, averages[3]), Some(4.0));
    }
}
