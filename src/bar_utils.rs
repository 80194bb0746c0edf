use crate::error::{EngineError, EngineResult};
use crate::models::{Bar, DataQualityWarning, Timeframe};
use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Bars that passed validation together with the warnings for the ones that did not.
#[derive(Debug, Clone)]
pub struct ValidatedBars {
    pub bars: Vec<Bar>,
    pub warnings: Vec<DataQualityWarning>,
}

/// Validates a provider series before any computation runs on it.
///
/// Non-finite OHLC values and out-of-order or non-contiguous dates fail the
/// whole series. Bars that break the OHLCV invariants are dropped and reported
/// as data-quality warnings instead.
pub fn validate_bars(
    symbol: &str,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    max_missing_sessions: usize,
) -> EngineResult<ValidatedBars> {
    for bar in &bars {
        let fields = [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ];
        if let Some((field, _)) = fields.into_iter().find(|(_, value)| !value.is_finite()) {
            return Err(EngineError::CorruptBar {
                symbol: symbol.to_string(),
                date: bar.date,
                field,
            });
        }
    }

    for pair in bars.windows(2) {
        let (previous, next) = (pair[0].date, pair[1].date);
        if next <= previous {
            return Err(EngineError::NonMonotonicDates {
                symbol: symbol.to_string(),
                timeframe,
                previous,
                next,
            });
        }
        if !is_contiguous(timeframe, previous, next, max_missing_sessions) {
            return Err(EngineError::DataGap {
                symbol: symbol.to_string(),
                timeframe,
                previous,
                next,
            });
        }
    }

    let mut accepted = Vec::with_capacity(bars.len());
    let mut warnings = Vec::new();
    for bar in bars {
        match check_bar_invariants(symbol, &bar) {
            Ok(()) => accepted.push(bar),
            Err(EngineError::InvariantViolation {
                symbol,
                date,
                reason,
            }) => warnings.push(DataQualityWarning {
                symbol,
                timeframe,
                date,
                reason,
            }),
            Err(err) => return Err(err),
        }
    }

    Ok(ValidatedBars {
        bars: accepted,
        warnings,
    })
}

pub fn check_bar_invariants(symbol: &str, bar: &Bar) -> EngineResult<()> {
    let reason = if bar.high < bar.low {
        format!("high {} below low {}", bar.high, bar.low)
    } else if bar.high < bar.open.max(bar.close) {
        format!(
            "high {} below open/close ({}, {})",
            bar.high, bar.open, bar.close
        )
    } else if bar.low > bar.open.min(bar.close) {
        format!(
            "low {} above open/close ({}, {})",
            bar.low, bar.open, bar.close
        )
    } else if !bar.volume.is_finite() || bar.volume < 0.0 {
        format!("invalid volume {}", bar.volume)
    } else {
        return Ok(());
    };
    Err(EngineError::InvariantViolation {
        symbol: symbol.to_string(),
        date: bar.date,
        reason,
    })
}

/// Whether `next` directly follows `previous` for the timeframe. Daily
/// series may skip up to `max_missing_sessions` weekdays for holidays.
pub fn is_contiguous(
    timeframe: Timeframe,
    previous: NaiveDate,
    next: NaiveDate,
    max_missing_sessions: usize,
) -> bool {
    if next <= previous {
        return false;
    }
    match timeframe {
        Timeframe::Daily => weekdays_between(previous, next) <= max_missing_sessions,
        Timeframe::Weekly => week_start(next) - week_start(previous) == Duration::days(7),
        Timeframe::Monthly => month_index(next) - month_index(previous) == 1,
    }
}

/// Weekdays strictly between the two dates.
fn weekdays_between(previous: NaiveDate, next: NaiveDate) -> usize {
    let mut count = 0;
    let mut day = previous + Duration::days(1);
    while day < next {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            count += 1;
        }
        day += Duration::days(1);
    }
    count
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

/// Consecutive weekday dates starting at `start` (inclusive when it is a weekday).
pub fn weekday_calendar(start: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let mut dates = Vec::with_capacity(count);
    let mut day = start;
    while dates.len() < count {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(day);
        }
        day += Duration::days(1);
    }
    dates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn bar(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "AAA".to_string(),
            timeframe: Timeframe::Daily,
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn daily_contiguity_skips_weekends_and_one_holiday() {
        // Friday -> Monday
        assert!(is_contiguous(Timeframe::Daily, date(2024, 1, 5), date(2024, 1, 8), 1));
        // Friday -> Tuesday (Monday holiday)
        assert!(is_contiguous(Timeframe::Daily, date(2024, 1, 12), date(2024, 1, 16), 1));
        // Monday -> Thursday skips two sessions
        assert!(!is_contiguous(Timeframe::Daily, date(2024, 1, 8), date(2024, 1, 11), 1));
        assert!(!is_contiguous(Timeframe::Daily, date(2024, 1, 8), date(2024, 1, 10), 0));
    }

    #[test]
    fn weekly_and_monthly_contiguity() {
        assert!(is_contiguous(Timeframe::Weekly, date(2023, 12, 29), date(2024, 1, 5), 0));
        assert!(is_contiguous(Timeframe::Weekly, date(2024, 1, 5), date(2024, 1, 8), 0));
        assert!(!is_contiguous(Timeframe::Weekly, date(2024, 1, 5), date(2024, 1, 19), 0));
        assert!(is_contiguous(Timeframe::Monthly, date(2023, 12, 29), date(2024, 1, 31), 0));
        assert!(!is_contiguous(Timeframe::Monthly, date(2024, 1, 31), date(2024, 3, 28), 0));
    }

    #[test]
    fn validation_rejects_gaps_and_disorder() {
        let days = weekday_calendar(date(2024, 1, 1), 6);
        let gapped = vec![
            bar(days[0], 10.0, 11.0, 9.0, 10.0, 100.0),
            bar(days[1], 10.0, 11.0, 9.0, 10.0, 100.0),
            bar(days[4], 10.0, 11.0, 9.0, 10.0, 100.0),
        ];
        assert!(matches!(
            validate_bars("AAA", Timeframe::Daily, gapped, 1),
            Err(EngineError::DataGap { .. })
        ));

        let duplicated = vec![
            bar(days[0], 10.0, 11.0, 9.0, 10.0, 100.0),
            bar(days[0], 10.0, 11.0, 9.0, 10.0, 100.0),
        ];
        assert!(matches!(
            validate_bars("AAA", Timeframe::Daily, duplicated, 1),
            Err(EngineError::NonMonotonicDates { .. })
        ));
    }

    #[test]
    fn invariant_violations_are_dropped_with_warnings() {
        let days = weekday_calendar(date(2024, 1, 1), 4);
        let bars = vec![
            bar(days[0], 10.0, 11.0, 9.0, 10.0, 100.0),
            bar(days[1], 10.0, 9.0, 11.0, 10.0, 100.0),
            bar(days[2], 10.0, 11.0, 9.0, 10.0, -5.0),
            bar(days[3], 10.0, 11.0, 9.0, 10.5, 100.0),
        ];
        let validated = validate_bars("AAA", Timeframe::Daily, bars, 1).unwrap();
        assert_eq!(validated.bars.len(), 2);
        assert_eq!(validated.warnings.len(), 2);
        assert_eq!(validated.warnings[0].date, days[1]);
        assert_eq!(validated.warnings[1].date, days[2]);
    }

    #[test]
    fn invariant_breach_reports_symbol_date_and_reason() {
        let day = date(2024, 1, 2);
        let err = check_bar_invariants("AAA", &bar(day, 10.0, 9.0, 11.0, 10.0, 100.0)).unwrap_err();
        assert_eq!(err.kind(), "invariant_violation");
        assert!(!err.is_retryable());
        match err {
            EngineError::InvariantViolation { symbol, date, reason } => {
                assert_eq!(symbol, "AAA");
                assert_eq!(date, day);
                assert!(reason.contains("below low"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(check_bar_invariants("AAA", &bar(day, 10.0, 11.0, 9.0, 10.0, 0.0)).is_ok());
    }

    #[test]
    fn non_finite_prices_fail_the_series() {
        let days = weekday_calendar(date(2024, 1, 1), 2);
        let bars = vec![
            bar(days[0], 10.0, 11.0, 9.0, 10.0, 100.0),
            bar(days[1], 10.0, f64::NAN, 9.0, 10.0, 100.0),
        ];
        assert!(matches!(
            validate_bars("AAA", Timeframe::Daily, bars, 1),
            Err(EngineError::CorruptBar { field: "high", .. })
        ));
    }

    #[test]
    fn weekday_calendar_skips_weekends() {
        let days = weekday_calendar(date(2024, 1, 5), 3);
        assert_eq!(days, vec![date(2024, 1, 5), date(2024, 1, 8), date(2024, 1, 9)]);
    }
}
