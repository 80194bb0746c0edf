use crate::config::SignalConfig;
use crate::models::{Bar, BaseType, ExitCondition, ExitKind, ExitTrigger};

pub const PRICE_EPSILON: f64 = 1e-6;

/// Classifies a qualified base by its depth (fraction below the pivot).
pub fn classify_base(depth: f64, config: &SignalConfig) -> BaseType {
    if depth <= config.tight_range_max_depth {
        BaseType::TightRange
    } else if depth <= config.flat_base_max_depth {
        BaseType::FlatBase
    } else {
        BaseType::Consolidation
    }
}

pub fn base_depth(pivot: f64, base_low: f64) -> Option<f64> {
    if pivot <= 0.0 || !pivot.is_finite() || !base_low.is_finite() {
        return None;
    }
    Some((pivot - base_low) / pivot)
}

/// Stop placed strictly below the base low: a fixed buffer, lowered further
/// by an ATR cushion when ATR is known.
pub fn initial_stop(base_low: f64, atr: Option<f64>, config: &SignalConfig) -> f64 {
    let buffered = base_low * (1.0 - config.stop_buffer_pct.max(0.0));
    let stop = match atr {
        Some(atr) if atr > 0.0 && atr.is_finite() && config.stop_atr_multiple > 0.0 => {
            buffered.min(base_low - config.stop_atr_multiple * atr)
        }
        _ => buffered,
    };
    if stop < base_low {
        stop
    } else {
        base_low - PRICE_EPSILON
    }
}

/// Highest high among the `lookback` bars that end right before `base_start`.
pub fn prior_resistance(bars: &[Bar], base_start: usize, lookback: usize) -> Option<f64> {
    if lookback == 0 || base_start == 0 {
        return None;
    }
    let end = base_start.min(bars.len());
    let start = end.saturating_sub(lookback);
    bars[start..end]
        .iter()
        .map(|bar| bar.high)
        .filter(|high| high.is_finite())
        .fold(None, |acc: Option<f64>, high| {
            Some(acc.map_or(high, |current| current.max(high)))
        })
}

/// Prior resistance when it leaves enough room above the entry, otherwise a
/// fixed percentage target.
pub fn target_price(entry: f64, resistance: Option<f64>, config: &SignalConfig) -> f64 {
    match resistance {
        Some(level) if level >= entry * (1.0 + config.min_target_pct) => level,
        _ => entry * (1.0 + config.target_gain_pct),
    }
}

pub fn risk_reward(entry: f64, stop: f64, target: f64) -> Option<f64> {
    let risk = entry - stop;
    if risk <= PRICE_EPSILON || !risk.is_finite() {
        return None;
    }
    let ratio = (target - entry) / risk;
    if ratio.is_finite() {
        Some(ratio)
    } else {
        None
    }
}

pub struct TrailingStopParams {
    pub current_stop: f64,
    pub highest_close: f64,
    pub close: f64,
    pub atr: Option<f64>,
    pub trailing_stop_pct: f64,
    pub trailing_atr_multiple: f64,
}

/// Ratchets the trailing stop. The result is never below `current_stop`.
pub fn compute_trailing_stop(params: TrailingStopParams) -> f64 {
    let TrailingStopParams {
        current_stop,
        highest_close,
        close,
        atr,
        trailing_stop_pct,
        trailing_atr_multiple,
    } = params;

    let mut candidate = current_stop;
    if trailing_stop_pct > 0.0 && trailing_stop_pct < 1.0 && highest_close.is_finite() {
        candidate = candidate.max(highest_close * (1.0 - trailing_stop_pct));
    }
    if trailing_atr_multiple > 0.0 {
        if let Some(atr) = atr {
            if atr > 0.0 && atr.is_finite() {
                candidate = candidate.max(close - trailing_atr_multiple * atr);
            }
        }
    }
    candidate.max(current_stop)
}

/// Fill price for a long stop on this bar, or `None` when the stop holds.
pub fn stop_exit_price(bar: &Bar, stop: f64) -> Option<f64> {
    if bar.low <= stop {
        if bar.open <= stop {
            Some(bar.open)
        } else {
            Some(stop)
        }
    } else {
        None
    }
}

pub fn target_exit_price(bar: &Bar, target: f64) -> Option<f64> {
    if bar.high >= target {
        Some(bar.open.max(target))
    } else {
        None
    }
}

pub fn build_exit_triggers(
    initial_stop: f64,
    trailing_stop: f64,
    target: f64,
    max_holding_bars: usize,
) -> Vec<ExitTrigger> {
    vec![
        ExitTrigger {
            kind: ExitKind::HardStop,
            level: initial_stop,
            condition: ExitCondition::LowAtOrBelow,
        },
        ExitTrigger {
            kind: ExitKind::TrailingStop,
            level: trailing_stop,
            condition: ExitCondition::LowAtOrBelow,
        },
        ExitTrigger {
            kind: ExitKind::Target,
            level: target,
            condition: ExitCondition::HighAtOrAbove,
        },
        ExitTrigger {
            kind: ExitKind::Time,
            level: max_holding_bars as f64,
            condition: ExitCondition::BarsHeldAtLeast,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitFill {
    pub kind: ExitKind,
    pub price: f64,
}

/// Evaluates the triggers in priority order and returns the first that fires.
///
/// The trailing trigger only counts once it has moved above the hard stop, so
/// a bar that breaches both is always reported as a hard stop.
pub fn evaluate_exit(triggers: &[ExitTrigger], bar: &Bar, bars_held: usize) -> Option<ExitFill> {
    let mut ordered: Vec<&ExitTrigger> = triggers.iter().collect();
    ordered.sort_by_key(|trigger| trigger.kind);

    let hard_level = ordered
        .iter()
        .find(|trigger| trigger.kind == ExitKind::HardStop)
        .map(|trigger| trigger.level);

    for trigger in ordered {
        let price = match trigger.condition {
            ExitCondition::LowAtOrBelow => {
                if trigger.kind == ExitKind::TrailingStop
                    && hard_level.is_some_and(|hard| trigger.level <= hard + PRICE_EPSILON)
                {
                    continue;
                }
                stop_exit_price(bar, trigger.level)
            }
            ExitCondition::HighAtOrAbove => target_exit_price(bar, trigger.level),
            ExitCondition::BarsHeldAtLeast => {
                if bars_held as f64 >= trigger.level {
                    Some(bar.close)
                } else {
                    None
                }
            }
        };
        if let Some(price) = price {
            return Some(ExitFill {
                kind: trigger.kind,
                price,
            });
        }
    }
    None
}
