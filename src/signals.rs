use crate::config::SignalConfig;
use crate::models::{
    Bar, ExitKind, IndicatorSnapshot, SignalPhase, SignalState, SignalTransition, Timeframe,
};
use crate::trading_rules::{
    base_depth, build_exit_triggers, classify_base, compute_trailing_stop, evaluate_exit,
    initial_stop, prior_resistance, risk_reward, target_price, TrailingStopParams,
};

/// A base that qualified over the trailing window ending at the current bar.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseCandidate {
    pub start_index: usize,
    pub pivot: f64,
    pub low: f64,
    pub depth: f64,
}

/// Checks whether the `min_base_bars` window ending at `index` forms a base:
/// shallow enough, with contracting ranges and declining ATR.
pub fn qualify_base(
    bars: &[Bar],
    snapshots: &[IndicatorSnapshot],
    index: usize,
    config: &SignalConfig,
) -> Option<BaseCandidate> {
    let length = config.min_base_bars.max(2);
    if index >= bars.len() || index >= snapshots.len() || index + 1 < length {
        return None;
    }
    let start = index + 1 - length;
    let window = &bars[start..=index];

    let pivot = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let depth = base_depth(pivot, low)?;
    if depth > config.max_base_depth {
        return None;
    }

    let half = length / 2;
    let first_half = average_range(&snapshots[start..start + half])?;
    let second_half = average_range(&snapshots[start + half..=index])?;
    if second_half >= first_half * config.range_contraction_ratio {
        return None;
    }

    let atr_start = snapshots[start].atr?;
    let atr_end = snapshots[index].atr?;
    if atr_end > atr_start {
        return None;
    }

    Some(BaseCandidate {
        start_index: start,
        pivot,
        low,
        depth,
    })
}

fn average_range(snapshots: &[IndicatorSnapshot]) -> Option<f64> {
    if snapshots.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    for snapshot in snapshots {
        sum += snapshot.range_pct?;
    }
    Some(sum / snapshots.len() as f64)
}

/// Result of replaying a full bar history through the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTrace {
    pub final_state: SignalState,
    pub transitions: Vec<SignalTransition>,
}

/// Per-(symbol, timeframe) signal lifecycle. Feed bars in date order through
/// [`SignalStateMachine::step`]; it emits at most one transition per bar.
#[derive(Debug, Clone)]
pub struct SignalStateMachine {
    config: SignalConfig,
    state: SignalState,
    base_start: Option<usize>,
    pending_bars: usize,
    highest_close: Option<f64>,
    bars_since_exit: usize,
}

impl SignalStateMachine {
    pub fn new(symbol: &str, timeframe: Timeframe, config: SignalConfig) -> Self {
        Self {
            config,
            state: SignalState::empty(symbol, timeframe),
            base_start: None,
            pending_bars: 0,
            highest_close: None,
            bars_since_exit: 0,
        }
    }

    pub fn state(&self) -> &SignalState {
        &self.state
    }

    pub fn into_state(self) -> SignalState {
        self.state
    }

    pub fn step(
        &mut self,
        bars: &[Bar],
        snapshots: &[IndicatorSnapshot],
        index: usize,
    ) -> Option<SignalTransition> {
        let bar = bars.get(index)?;
        let snapshot = snapshots.get(index)?;
        self.state.as_of_date = Some(bar.date);

        let from = self.state.phase;
        let reason = match from {
            SignalPhase::None => self.step_none(bars, snapshots, index),
            SignalPhase::BaseForming => self.step_base_forming(bar, snapshot),
            SignalPhase::BreakoutPending => self.step_pending(bars, snapshot, index),
            SignalPhase::InPosition => self.step_in_position(bar, snapshot),
            SignalPhase::Exited => self.step_exited(),
        }?;

        Some(SignalTransition {
            symbol: self.state.symbol.clone(),
            timeframe: self.state.timeframe,
            date: bar.date,
            bar_index: index,
            from,
            to: self.state.phase,
            reason,
        })
    }

    fn step_none(
        &mut self,
        bars: &[Bar],
        snapshots: &[IndicatorSnapshot],
        index: usize,
    ) -> Option<String> {
        let candidate = qualify_base(bars, snapshots, index, &self.config)?;
        let start_date = bars[candidate.start_index].date;

        self.base_start = Some(candidate.start_index);
        self.state.phase = SignalPhase::BaseForming;
        self.state.pivot_price = Some(candidate.pivot);
        self.state.base_low = Some(candidate.low);
        self.state.base_type = Some(classify_base(candidate.depth, &self.config));
        self.state.base_start_date = Some(start_date);
        self.state.base_length_days = Some((bars[index].date - start_date).num_days());

        Some(format!(
            "base qualified over {} bars: pivot {:.4}, low {:.4}, depth {:.2}%",
            index + 1 - candidate.start_index,
            candidate.pivot,
            candidate.low,
            candidate.depth * 100.0
        ))
    }

    fn step_base_forming(&mut self, bar: &Bar, snapshot: &IndicatorSnapshot) -> Option<String> {
        let (pivot, base_low) = match (self.state.pivot_price, self.state.base_low) {
            (Some(pivot), Some(low)) => (pivot, low.min(bar.low)),
            _ => return Some(self.abandon("base levels missing")),
        };
        self.state.base_low = Some(base_low);
        self.update_base_length(bar);

        let depth = base_depth(pivot, base_low).unwrap_or(f64::INFINITY);
        if depth > self.config.max_base_depth {
            return Some(self.abandon(&format!(
                "base failed: depth {:.2}% exceeds {:.2}%",
                depth * 100.0,
                self.config.max_base_depth * 100.0
            )));
        }
        self.state.base_type = Some(classify_base(depth, &self.config));

        let zone_end = pivot * (1.0 + self.config.buy_zone_tolerance);
        if bar.close > zone_end {
            return Some(self.abandon(&format!(
                "close {:.4} extended past buy zone {:.4} without a setup",
                bar.close, zone_end
            )));
        }

        let approaching = bar.close >= pivot * (1.0 - self.config.pivot_approach_pct);
        let volume_ok = snapshot
            .volume_ratio
            .is_some_and(|ratio| ratio >= self.config.approach_volume_multiple);
        if approaching && volume_ok {
            self.state.phase = SignalPhase::BreakoutPending;
            self.state.buy_zone_start = Some(pivot);
            self.state.buy_zone_end = Some(zone_end);
            self.pending_bars = 0;
            return Some(format!(
                "close {:.4} within {:.1}% of pivot {:.4} on {:.2}x volume",
                bar.close,
                self.config.pivot_approach_pct * 100.0,
                pivot,
                snapshot.volume_ratio.unwrap_or_default()
            ));
        }

        if bar.high > pivot {
            self.state.pivot_price = Some(bar.high);
        }
        None
    }

    fn step_pending(
        &mut self,
        bars: &[Bar],
        snapshot: &IndicatorSnapshot,
        index: usize,
    ) -> Option<String> {
        let bar = &bars[index];
        self.pending_bars += 1;
        self.update_base_length(bar);
        if let Some(low) = self.state.base_low {
            self.state.base_low = Some(low.min(bar.low));
        }

        let (pivot, zone_start, zone_end) = match (
            self.state.pivot_price,
            self.state.buy_zone_start,
            self.state.buy_zone_end,
        ) {
            (Some(pivot), Some(start), Some(end)) => (pivot, start, end),
            _ => return Some(self.abandon("buy zone missing")),
        };

        let in_zone = bar.close >= zone_start && bar.close <= zone_end;
        let surge = snapshot
            .volume_ratio
            .is_some_and(|ratio| ratio >= self.config.breakout_volume_multiple);
        if in_zone && surge {
            return Some(self.enter(bars, snapshot, index));
        }

        if bar.close > zone_end {
            return Some(self.abandon(&format!(
                "close {:.4} ran past buy zone end {:.4}",
                bar.close, zone_end
            )));
        }

        if bar.close < pivot * (1.0 - self.config.pending_failure_pct) {
            self.back_to_base();
            return Some(format!(
                "close {:.4} fell {:.1}% below pivot {:.4}",
                bar.close,
                self.config.pending_failure_pct * 100.0,
                pivot
            ));
        }

        if self.pending_bars > self.config.max_pending_bars {
            self.back_to_base();
            return Some(format!(
                "no breakout within {} bars",
                self.config.max_pending_bars
            ));
        }

        None
    }

    fn enter(&mut self, bars: &[Bar], snapshot: &IndicatorSnapshot, index: usize) -> String {
        let bar = &bars[index];
        let entry = bar.close;
        let base_low = self.state.base_low.unwrap_or(bar.low);
        let stop = initial_stop(base_low, snapshot.atr, &self.config);
        let resistance = self.base_start.and_then(|start| {
            prior_resistance(bars, start, self.config.resistance_lookback_bars)
        });
        let target = target_price(entry, resistance, &self.config);

        self.state.phase = SignalPhase::InPosition;
        self.state.entry_price = Some(entry);
        self.state.entry_date = Some(bar.date);
        self.state.initial_stop = Some(stop);
        self.state.trailing_stop = Some(stop);
        self.state.target_price = Some(target);
        self.state.risk_reward = risk_reward(entry, stop, target);
        self.state.exit_triggers =
            build_exit_triggers(stop, stop, target, self.config.max_holding_bars);
        self.state.days_in_position = Some(0);
        self.state.current_gain_pct = Some(0.0);
        self.highest_close = Some(entry);

        format!(
            "breakout at {:.4} on {:.2}x volume: stop {:.4}, target {:.4}",
            entry,
            snapshot.volume_ratio.unwrap_or_default(),
            stop,
            target
        )
    }

    fn step_in_position(&mut self, bar: &Bar, snapshot: &IndicatorSnapshot) -> Option<String> {
        let entry = match self.state.entry_price {
            Some(entry) if entry > 0.0 => entry,
            _ => return Some(self.abandon("entry price missing")),
        };
        let days = self.state.days_in_position.unwrap_or(0) + 1;
        self.state.days_in_position = Some(days);
        self.state.current_gain_pct = Some((bar.close - entry) / entry * 100.0);

        // Triggers still hold the levels set on the previous bar.
        if let Some(fill) = evaluate_exit(&self.state.exit_triggers, bar, days as usize) {
            self.state.phase = SignalPhase::Exited;
            self.state.exit_reason = Some(fill.kind);
            self.state.exit_date = Some(bar.date);
            self.state.exit_price = Some(fill.price);
            self.state.current_gain_pct = Some((fill.price - entry) / entry * 100.0);
            self.bars_since_exit = 0;
            return Some(format!(
                "{} exit at {:.4} after {} bars",
                fill.kind.as_str(),
                fill.price,
                days
            ));
        }

        let highest_close = self.highest_close.unwrap_or(entry).max(bar.close);
        self.highest_close = Some(highest_close);
        let current_stop = self
            .state
            .trailing_stop
            .or(self.state.initial_stop)
            .unwrap_or(f64::MIN);
        let trailing = compute_trailing_stop(TrailingStopParams {
            current_stop,
            highest_close,
            close: bar.close,
            atr: snapshot.atr,
            trailing_stop_pct: self.config.trailing_stop_pct,
            trailing_atr_multiple: self.config.trailing_atr_multiple,
        });
        self.state.trailing_stop = Some(trailing);
        for trigger in self.state.exit_triggers.iter_mut() {
            if trigger.kind == ExitKind::TrailingStop {
                trigger.level = trailing;
            }
        }
        None
    }

    fn step_exited(&mut self) -> Option<String> {
        self.bars_since_exit += 1;
        if self.bars_since_exit < self.config.cooldown_bars.max(1) {
            return None;
        }
        Some(self.abandon(&format!("cooldown of {} bars elapsed", self.bars_since_exit)))
    }

    fn update_base_length(&mut self, bar: &Bar) {
        if let Some(start) = self.state.base_start_date {
            self.state.base_length_days = Some((bar.date - start).num_days());
        }
    }

    fn back_to_base(&mut self) {
        self.state.phase = SignalPhase::BaseForming;
        self.state.buy_zone_start = None;
        self.state.buy_zone_end = None;
        self.pending_bars = 0;
    }

    /// Returns to NONE, clearing every level of the abandoned setup.
    fn abandon(&mut self, reason: &str) -> String {
        self.state.reset();
        self.base_start = None;
        self.pending_bars = 0;
        self.highest_close = None;
        self.bars_since_exit = 0;
        reason.to_string()
    }
}

/// Replays a validated history from scratch. The output depends only on the
/// inputs, so two replays of the same history produce identical traces.
pub fn replay(
    symbol: &str,
    timeframe: Timeframe,
    bars: &[Bar],
    snapshots: &[IndicatorSnapshot],
    config: &SignalConfig,
) -> SignalTrace {
    let mut machine = SignalStateMachine::new(symbol, timeframe, config.clone());
    let mut transitions = Vec::new();
    let steps = bars.len().min(snapshots.len());
    for index in 0..steps {
        if let Some(transition) = machine.step(bars, snapshots, index) {
            transitions.push(transition);
        }
    }
    SignalTrace {
        final_state: machine.into_state(),
        transitions,
    }
}
