use crate::models::{Category, Timeframe};
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};

/// Lookback windows used by the indicator library for one timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorWindows {
    pub rsi_period: usize,
    pub adx_period: usize,
    pub atr_period: usize,
    pub ma_periods: Vec<usize>,
    pub volume_avg_period: usize,
}

impl IndicatorWindows {
    pub fn for_timeframe(timeframe: Timeframe) -> Self {
        match timeframe {
            Timeframe::Daily => Self {
                rsi_period: 14,
                adx_period: 14,
                atr_period: 14,
                ma_periods: vec![10, 21, 50, 200],
                volume_avg_period: 50,
            },
            Timeframe::Weekly => Self {
                rsi_period: 14,
                adx_period: 14,
                atr_period: 10,
                ma_periods: vec![10, 30, 40],
                volume_avg_period: 10,
            },
            Timeframe::Monthly => Self {
                rsi_period: 14,
                adx_period: 12,
                atr_period: 6,
                ma_periods: vec![6, 10, 12],
                volume_avg_period: 6,
            },
        }
    }
}

/// Thresholds for the signal state machine. Every value is calibratable
/// through `SIGNAL_<TIMEFRAME>_<NAME>` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub min_base_bars: usize,
    pub max_base_depth: f64,
    pub range_contraction_ratio: f64,
    pub tight_range_max_depth: f64,
    pub flat_base_max_depth: f64,
    pub pivot_approach_pct: f64,
    pub approach_volume_multiple: f64,
    pub buy_zone_tolerance: f64,
    pub breakout_volume_multiple: f64,
    pub pending_failure_pct: f64,
    pub max_pending_bars: usize,
    pub stop_buffer_pct: f64,
    pub stop_atr_multiple: f64,
    pub target_gain_pct: f64,
    pub min_target_pct: f64,
    pub resistance_lookback_bars: usize,
    pub trailing_stop_pct: f64,
    pub trailing_atr_multiple: f64,
    pub max_holding_bars: usize,
    pub cooldown_bars: usize,
    /// Daily series may skip this many weekdays (exchange holidays) between bars.
    pub max_missing_sessions: usize,
}

impl SignalConfig {
    pub fn for_timeframe(timeframe: Timeframe) -> Self {
        let daily = Self {
            min_base_bars: 25,
            max_base_depth: 0.25,
            range_contraction_ratio: 1.0,
            tight_range_max_depth: 0.10,
            flat_base_max_depth: 0.15,
            pivot_approach_pct: 0.03,
            approach_volume_multiple: 1.2,
            buy_zone_tolerance: 0.05,
            breakout_volume_multiple: 1.5,
            pending_failure_pct: 0.08,
            max_pending_bars: 10,
            stop_buffer_pct: 0.01,
            stop_atr_multiple: 0.5,
            target_gain_pct: 0.20,
            min_target_pct: 0.10,
            resistance_lookback_bars: 120,
            trailing_stop_pct: 0.10,
            trailing_atr_multiple: 3.0,
            max_holding_bars: 120,
            cooldown_bars: 1,
            max_missing_sessions: 1,
        };
        match timeframe {
            Timeframe::Daily => daily,
            Timeframe::Weekly => Self {
                min_base_bars: 6,
                max_base_depth: 0.33,
                tight_range_max_depth: 0.12,
                flat_base_max_depth: 0.20,
                max_pending_bars: 3,
                resistance_lookback_bars: 52,
                trailing_stop_pct: 0.15,
                trailing_atr_multiple: 2.5,
                max_holding_bars: 52,
                target_gain_pct: 0.25,
                ..daily
            },
            Timeframe::Monthly => Self {
                min_base_bars: 4,
                max_base_depth: 0.40,
                tight_range_max_depth: 0.15,
                flat_base_max_depth: 0.25,
                max_pending_bars: 2,
                resistance_lookback_bars: 24,
                trailing_stop_pct: 0.20,
                trailing_atr_multiple: 2.0,
                max_holding_bars: 24,
                target_gain_pct: 0.35,
                ..daily
            },
        }
    }

    pub fn from_settings_map(
        timeframe: Timeframe,
        settings: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut config = Self::for_timeframe(timeframe);
        let key = |name: &str| format!("SIGNAL_{}_{}", timeframe.as_str().to_uppercase(), name);

        config.min_base_bars =
            optional_setting_usize(settings, &key("MIN_BASE_BARS"), config.min_base_bars, 2)?;
        config.max_base_depth = optional_setting_f64(
            settings,
            &key("MAX_BASE_DEPTH"),
            config.max_base_depth,
            Some(0.0),
            Some(1.0),
        )?;
        config.range_contraction_ratio = optional_setting_f64(
            settings,
            &key("RANGE_CONTRACTION_RATIO"),
            config.range_contraction_ratio,
            Some(0.0),
            None,
        )?;
        config.pivot_approach_pct = optional_setting_f64(
            settings,
            &key("PIVOT_APPROACH_PCT"),
            config.pivot_approach_pct,
            Some(0.0),
            Some(1.0),
        )?;
        config.approach_volume_multiple = optional_setting_f64(
            settings,
            &key("APPROACH_VOLUME_MULTIPLE"),
            config.approach_volume_multiple,
            Some(0.0),
            None,
        )?;
        config.buy_zone_tolerance = optional_setting_f64(
            settings,
            &key("BUY_ZONE_TOLERANCE"),
            config.buy_zone_tolerance,
            Some(0.0),
            Some(1.0),
        )?;
        config.breakout_volume_multiple = optional_setting_f64(
            settings,
            &key("BREAKOUT_VOLUME_MULTIPLE"),
            config.breakout_volume_multiple,
            Some(0.0),
            None,
        )?;
        config.pending_failure_pct = optional_setting_f64(
            settings,
            &key("PENDING_FAILURE_PCT"),
            config.pending_failure_pct,
            Some(0.0),
            Some(1.0),
        )?;
        config.max_pending_bars = optional_setting_usize(
            settings,
            &key("MAX_PENDING_BARS"),
            config.max_pending_bars,
            1,
        )?;
        config.stop_buffer_pct = optional_setting_f64(
            settings,
            &key("STOP_BUFFER_PCT"),
            config.stop_buffer_pct,
            Some(0.0),
            Some(0.5),
        )?;
        config.stop_atr_multiple = optional_setting_f64(
            settings,
            &key("STOP_ATR_MULTIPLE"),
            config.stop_atr_multiple,
            Some(0.0),
            None,
        )?;
        config.target_gain_pct = optional_setting_f64(
            settings,
            &key("TARGET_GAIN_PCT"),
            config.target_gain_pct,
            Some(0.0),
            None,
        )?;
        config.trailing_stop_pct = optional_setting_f64(
            settings,
            &key("TRAILING_STOP_PCT"),
            config.trailing_stop_pct,
            Some(0.0),
            Some(1.0),
        )?;
        config.trailing_atr_multiple = optional_setting_f64(
            settings,
            &key("TRAILING_ATR_MULTIPLE"),
            config.trailing_atr_multiple,
            Some(0.0),
            None,
        )?;
        config.max_holding_bars = optional_setting_usize(
            settings,
            &key("MAX_HOLDING_BARS"),
            config.max_holding_bars,
            1,
        )?;
        config.cooldown_bars =
            optional_setting_usize(settings, &key("COOLDOWN_BARS"), config.cooldown_bars, 0)?;
        config.max_missing_sessions = optional_setting_usize(
            settings,
            &key("MAX_MISSING_SESSIONS"),
            config.max_missing_sessions,
            0,
        )?;

        if config.flat_base_max_depth > config.max_base_depth {
            config.flat_base_max_depth = config.max_base_depth;
        }
        if config.tight_range_max_depth > config.flat_base_max_depth {
            config.tight_range_max_depth = config.flat_base_max_depth;
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Fewer non-null symbols than this on a date/factor yields an all-null cross-section.
    pub min_cross_section: usize,
    pub category_weights: BTreeMap<Category, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let category_weights = BTreeMap::from([
            (Category::Momentum, 0.20),
            (Category::Value, 0.15),
            (Category::Quality, 0.15),
            (Category::Growth, 0.15),
            (Category::Positioning, 0.10),
            (Category::Sentiment, 0.10),
            (Category::Stability, 0.15),
        ]);
        Self {
            min_cross_section: 2,
            category_weights,
        }
    }
}

impl ScoringConfig {
    pub fn category_weight(&self, category: Category) -> f64 {
        self.category_weights.get(&category).copied().unwrap_or(0.0)
    }
}

/// Runtime settings for a batch run, resolved from the `settings` table
/// (or a snapshot's settings map) with defaults for unset keys.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_workers: usize,
    pub symbol_timeout_secs: u64,
    pub provider_retry: RetryPolicy,
    pub scoring: ScoringConfig,
    pub signal_configs: BTreeMap<Timeframe, SignalConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workers: default_worker_count(),
            symbol_timeout_secs: 120,
            provider_retry: RetryPolicy::default(),
            scoring: ScoringConfig::default(),
            signal_configs: Timeframe::ALL
                .iter()
                .map(|tf| (*tf, SignalConfig::for_timeframe(*tf)))
                .collect(),
        }
    }
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let max_workers = optional_setting_usize(settings, "MAX_WORKERS", defaults.max_workers, 1)?;
        let symbol_timeout_secs = optional_setting_usize(
            settings,
            "SYMBOL_TIMEOUT_SECS",
            defaults.symbol_timeout_secs as usize,
            1,
        )? as u64;

        let provider_retry = RetryPolicy {
            max_attempts: optional_setting_usize(
                settings,
                "PROVIDER_MAX_ATTEMPTS",
                defaults.provider_retry.max_attempts as usize,
                1,
            )? as u32,
            base_delay_ms: optional_setting_usize(
                settings,
                "PROVIDER_BASE_DELAY_MS",
                defaults.provider_retry.base_delay_ms as usize,
                0,
            )? as u64,
            max_delay_ms: optional_setting_usize(
                settings,
                "PROVIDER_MAX_DELAY_MS",
                defaults.provider_retry.max_delay_ms as usize,
                0,
            )? as u64,
        };
        if provider_retry.max_delay_ms < provider_retry.base_delay_ms {
            return Err(anyhow!(
                "PROVIDER_MAX_DELAY_MS ({}) must be >= PROVIDER_BASE_DELAY_MS ({})",
                provider_retry.max_delay_ms,
                provider_retry.base_delay_ms
            ));
        }

        let min_cross_section = optional_setting_usize(
            settings,
            "MIN_CROSS_SECTION",
            defaults.scoring.min_cross_section,
            2,
        )?;
        let mut category_weights = BTreeMap::new();
        for category in Category::ALL {
            let key = format!("CATEGORY_WEIGHT_{}", category.as_str().to_uppercase());
            let weight = optional_setting_f64(
                settings,
                &key,
                defaults.scoring.category_weight(category),
                Some(0.0),
                None,
            )?;
            if weight <= 0.0 {
                return Err(anyhow!("Setting {} must be > 0 (value: {})", key, weight));
            }
            category_weights.insert(category, weight);
        }

        let mut signal_configs = BTreeMap::new();
        for timeframe in Timeframe::ALL {
            signal_configs.insert(
                timeframe,
                SignalConfig::from_settings_map(timeframe, settings)?,
            );
        }

        Ok(Self {
            max_workers,
            symbol_timeout_secs,
            provider_retry,
            scoring: ScoringConfig {
                min_cross_section,
                category_weights,
            },
            signal_configs,
        })
    }

    pub fn signal_config(&self, timeframe: Timeframe) -> SignalConfig {
        self.signal_configs
            .get(&timeframe)
            .cloned()
            .unwrap_or_else(|| SignalConfig::for_timeframe(timeframe))
    }
}

pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}
