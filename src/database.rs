use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::providers::{BarHistoryProvider, FactorProvider, OutputSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use log::error;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use tokio_postgres::{Client, NoTls, Row};

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

pub struct Database {
    client: Client,
}

fn parse_column<T: FromStr<Err = anyhow::Error>>(raw: &str, column: &str) -> EngineResult<T> {
    raw.parse::<T>()
        .map_err(|err| EngineError::Storage(format!("bad {} value '{}': {}", column, raw, err)))
}

fn category_weights_json(score: &CompositeScore) -> Value {
    let mut map = Map::new();
    for (category, weight) in &score.category_weights_used {
        map.insert(category.as_str().to_string(), Value::from(*weight));
    }
    Value::Object(map)
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    /// Creates any missing tables. Safe to run on every start.
    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply database schema")
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            settings.insert(row.get::<_, String>(0), row.get::<_, String>(1));
        }
        Ok(settings)
    }

    pub async fn insert_system_log(
        &self,
        source: &str,
        level: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let created_at = Utc::now();
        let metadata_text = metadata.map(|value| value.to_string());

        self.client
            .execute(
                "INSERT INTO system_logs (source, level, message, metadata, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[&source, &level, &message, &metadata_text, &created_at],
            )
            .await?;

        Ok(())
    }

    /// Logs to `system_logs`, downgrading a failed insert to a warning.
    pub async fn persist_system_event(
        &self,
        source: &str,
        level: &str,
        message: impl Into<String>,
        metadata: Value,
    ) {
        let text = message.into();
        if let Err(err) = self
            .insert_system_log(source, level, &text, Some(metadata))
            .await
        {
            log::warn!("Failed to persist system log from {}: {}", source, err);
        }
    }

    pub async fn get_all_bars(&self) -> Result<Vec<Bar>> {
        let rows = self
            .client
            .query(
                "SELECT symbol, timeframe, date, open, high, low, close, volume
                 FROM bars
                 ORDER BY symbol, timeframe, date",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| Self::map_bar_row(row).map_err(anyhow::Error::from))
            .collect()
    }

    pub async fn get_all_raw_factors(&self) -> Result<Vec<RawFactorValue>> {
        let rows = self
            .client
            .query(
                "SELECT symbol, date, factor, value
                 FROM raw_factors
                 ORDER BY date, symbol, factor",
                &[],
            )
            .await?;
        Ok(rows.iter().map(Self::map_raw_factor_row).collect())
    }

    /// Bulk-loads bars, overwriting by (symbol, timeframe, date).
    pub async fn upsert_bars(&self, bars: &[Bar]) -> EngineResult<u64> {
        if bars.is_empty() {
            return Ok(0);
        }
        let symbols: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
        let timeframes: Vec<&str> = bars.iter().map(|b| b.timeframe.as_str()).collect();
        let dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
        let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        Ok(self
            .client
            .execute(
                "INSERT INTO bars (symbol, timeframe, date, open, high, low, close, volume)
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::date[], $4::float8[], $5::float8[], $6::float8[], $7::float8[], $8::float8[])
                 ON CONFLICT (symbol, timeframe, date) DO UPDATE
                 SET open = EXCLUDED.open,
                     high = EXCLUDED.high,
                     low = EXCLUDED.low,
                     close = EXCLUDED.close,
                     volume = EXCLUDED.volume",
                &[
                    &symbols,
                    &timeframes,
                    &dates,
                    &opens,
                    &highs,
                    &lows,
                    &closes,
                    &volumes,
                ],
            )
            .await?)
    }

    pub async fn upsert_raw_factors(&self, values: &[RawFactorValue]) -> EngineResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let symbols: Vec<&str> = values.iter().map(|v| v.symbol.as_str()).collect();
        let dates: Vec<NaiveDate> = values.iter().map(|v| v.date).collect();
        let factors: Vec<&str> = values.iter().map(|v| v.factor.as_str()).collect();
        let readings: Vec<Option<f64>> = values.iter().map(|v| v.value).collect();

        Ok(self
            .client
            .execute(
                "INSERT INTO raw_factors (symbol, date, factor, value)
                 SELECT * FROM UNNEST($1::text[], $2::date[], $3::text[], $4::float8[])
                 ON CONFLICT (symbol, date, factor) DO UPDATE SET value = EXCLUDED.value",
                &[&symbols, &dates, &factors, &readings],
            )
            .await?)
    }

    pub async fn get_signal_state(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> EngineResult<Option<SignalState>> {
        let row = self
            .client
            .query_opt(
                "SELECT symbol, timeframe, phase, as_of_date, pivot_price, buy_zone_start, buy_zone_end,
                        base_low, base_type, base_start_date, base_length_days, entry_price, entry_date,
                        initial_stop, trailing_stop, target_price, risk_reward, exit_triggers,
                        days_in_position, current_gain_pct, exit_reason, exit_date, exit_price
                 FROM signal_states
                 WHERE symbol = $1 AND timeframe = $2",
                &[&symbol, &timeframe.as_str()],
            )
            .await?;
        row.map(|row| Self::map_signal_state_row(&row)).transpose()
    }

    pub async fn get_transitions(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> EngineResult<Vec<SignalTransition>> {
        let rows = self
            .client
            .query(
                "SELECT date, bar_index, from_phase, to_phase, reason
                 FROM signal_transitions
                 WHERE symbol = $1 AND timeframe = $2
                 ORDER BY date",
                &[&symbol, &timeframe.as_str()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SignalTransition {
                    symbol: symbol.to_string(),
                    timeframe,
                    date: row.get(0),
                    bar_index: row.get::<_, i64>(1) as usize,
                    from: parse_column(row.get::<_, &str>(2), "from_phase")?,
                    to: parse_column(row.get::<_, &str>(3), "to_phase")?,
                    reason: row.get(4),
                })
            })
            .collect()
    }

    pub async fn get_overall_score(&self, symbol: &str, date: NaiveDate) -> EngineResult<Option<f64>> {
        let row = self
            .client
            .query_opt(
                "SELECT overall FROM composite_scores WHERE symbol = $1 AND date = $2",
                &[&symbol, &date],
            )
            .await?;
        Ok(row.and_then(|row| row.get::<_, Option<f64>>(0)))
    }

    fn map_bar_row(row: &Row) -> EngineResult<Bar> {
        Ok(Bar {
            symbol: row.get(0),
            timeframe: parse_column(row.get::<_, &str>(1), "timeframe")?,
            date: row.get(2),
            open: row.get(3),
            high: row.get(4),
            low: row.get(5),
            close: row.get(6),
            volume: row.get(7),
        })
    }

    fn map_raw_factor_row(row: &Row) -> RawFactorValue {
        RawFactorValue {
            symbol: row.get(0),
            date: row.get(1),
            factor: row.get(2),
            value: row.get::<_, Option<f64>>(3),
        }
    }

    fn map_signal_state_row(row: &Row) -> EngineResult<SignalState> {
        let exit_triggers: Value = row.get(17);
        let exit_triggers: Vec<ExitTrigger> = serde_json::from_value(exit_triggers)
            .map_err(|err| EngineError::Storage(format!("bad exit_triggers value: {}", err)))?;
        let base_type = row
            .get::<_, Option<&str>>(8)
            .map(|raw| parse_column::<BaseType>(raw, "base_type"))
            .transpose()?;
        let exit_reason = row
            .get::<_, Option<&str>>(20)
            .map(|raw| parse_column::<ExitKind>(raw, "exit_reason"))
            .transpose()?;

        Ok(SignalState {
            symbol: row.get(0),
            timeframe: parse_column(row.get::<_, &str>(1), "timeframe")?,
            phase: parse_column(row.get::<_, &str>(2), "phase")?,
            as_of_date: row.get(3),
            pivot_price: row.get(4),
            buy_zone_start: row.get(5),
            buy_zone_end: row.get(6),
            base_low: row.get(7),
            base_type,
            base_start_date: row.get(9),
            base_length_days: row.get(10),
            entry_price: row.get(11),
            entry_date: row.get(12),
            initial_stop: row.get(13),
            trailing_stop: row.get(14),
            target_price: row.get(15),
            risk_reward: row.get(16),
            exit_triggers,
            days_in_position: row.get(18),
            current_gain_pct: row.get(19),
            exit_reason,
            exit_date: row.get(21),
            exit_price: row.get(22),
        })
    }
}

#[async_trait]
impl BarHistoryProvider for Database {
    async fn list_symbols(&self, timeframe: Timeframe) -> EngineResult<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT symbol FROM bars WHERE timeframe = $1 ORDER BY symbol",
                &[&timeframe.as_str()],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<Bar>> {
        let rows = self
            .client
            .query(
                "SELECT symbol, timeframe, date, open, high, low, close, volume
                 FROM bars
                 WHERE symbol = $1
                   AND timeframe = $2
                   AND ($3::date IS NULL OR date >= $3)
                   AND ($4::date IS NULL OR date <= $4)
                 ORDER BY date",
                &[&symbol, &timeframe.as_str(), &from, &to],
            )
            .await?;
        rows.iter().map(Self::map_bar_row).collect()
    }
}

#[async_trait]
impl FactorProvider for Database {
    async fn get_raw_factor(
        &self,
        symbol: &str,
        date: NaiveDate,
        factor: &str,
    ) -> EngineResult<Option<f64>> {
        let row = self
            .client
            .query_opt(
                "SELECT value FROM raw_factors WHERE symbol = $1 AND date = $2 AND factor = $3",
                &[&symbol, &date, &factor],
            )
            .await?;
        Ok(row.and_then(|row| row.get::<_, Option<f64>>(0)))
    }

    async fn get_raw_factors_for_date(&self, date: NaiveDate) -> EngineResult<Vec<RawFactorValue>> {
        let rows = self
            .client
            .query(
                "SELECT symbol, date, factor, value
                 FROM raw_factors
                 WHERE date = $1
                 ORDER BY symbol, factor",
                &[&date],
            )
            .await?;
        Ok(rows.iter().map(Self::map_raw_factor_row).collect())
    }

    async fn factor_dates(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> EngineResult<Vec<NaiveDate>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT date
                 FROM raw_factors
                 WHERE ($1::date IS NULL OR date >= $1)
                   AND ($2::date IS NULL OR date <= $2)
                 ORDER BY date",
                &[&from, &to],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }
}

#[async_trait]
impl OutputSink for Database {
    // One statement: the state row and its transitions commit together, and
    // transitions the new trace no longer contains are removed.
    async fn upsert_signal_state(
        &self,
        state: &SignalState,
        transitions: &[SignalTransition],
    ) -> EngineResult<()> {
        let exit_triggers = serde_json::to_value(&state.exit_triggers)
            .map_err(|err| EngineError::Storage(format!("failed to encode exit triggers: {}", err)))?;
        let transition_dates: Vec<NaiveDate> = transitions.iter().map(|t| t.date).collect();
        let bar_indexes: Vec<i64> = transitions.iter().map(|t| t.bar_index as i64).collect();
        let from_phases: Vec<&str> = transitions.iter().map(|t| t.from.as_str()).collect();
        let to_phases: Vec<&str> = transitions.iter().map(|t| t.to.as_str()).collect();
        let reasons: Vec<&str> = transitions.iter().map(|t| t.reason.as_str()).collect();

        self.client
            .execute(
                "WITH state AS (
                    INSERT INTO signal_states (
                        symbol, timeframe, phase, as_of_date, pivot_price, buy_zone_start, buy_zone_end,
                        base_low, base_type, base_start_date, base_length_days, entry_price, entry_date,
                        initial_stop, trailing_stop, target_price, risk_reward, exit_triggers,
                        days_in_position, current_gain_pct, exit_reason, exit_date, exit_price, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                            $19, $20, $21, $22, $23, NOW())
                    ON CONFLICT (symbol, timeframe) DO UPDATE
                    SET phase = EXCLUDED.phase,
                        as_of_date = EXCLUDED.as_of_date,
                        pivot_price = EXCLUDED.pivot_price,
                        buy_zone_start = EXCLUDED.buy_zone_start,
                        buy_zone_end = EXCLUDED.buy_zone_end,
                        base_low = EXCLUDED.base_low,
                        base_type = EXCLUDED.base_type,
                        base_start_date = EXCLUDED.base_start_date,
                        base_length_days = EXCLUDED.base_length_days,
                        entry_price = EXCLUDED.entry_price,
                        entry_date = EXCLUDED.entry_date,
                        initial_stop = EXCLUDED.initial_stop,
                        trailing_stop = EXCLUDED.trailing_stop,
                        target_price = EXCLUDED.target_price,
                        risk_reward = EXCLUDED.risk_reward,
                        exit_triggers = EXCLUDED.exit_triggers,
                        days_in_position = EXCLUDED.days_in_position,
                        current_gain_pct = EXCLUDED.current_gain_pct,
                        exit_reason = EXCLUDED.exit_reason,
                        exit_date = EXCLUDED.exit_date,
                        exit_price = EXCLUDED.exit_price,
                        updated_at = NOW()
                    RETURNING symbol
                ),
                cleared AS (
                    DELETE FROM signal_transitions
                    WHERE symbol = $1 AND timeframe = $2 AND NOT (date = ANY($24::date[]))
                )
                INSERT INTO signal_transitions (symbol, timeframe, date, bar_index, from_phase, to_phase, reason)
                SELECT $1::text, $2::text, t.date, t.bar_index, t.from_phase, t.to_phase, t.reason
                FROM UNNEST($24::date[], $25::int8[], $26::text[], $27::text[], $28::text[])
                     AS t(date, bar_index, from_phase, to_phase, reason)
                ON CONFLICT (symbol, timeframe, date) DO UPDATE
                SET bar_index = EXCLUDED.bar_index,
                    from_phase = EXCLUDED.from_phase,
                    to_phase = EXCLUDED.to_phase,
                    reason = EXCLUDED.reason",
                &[
                    &state.symbol,
                    &state.timeframe.as_str(),
                    &state.phase.as_str(),
                    &state.as_of_date,
                    &state.pivot_price,
                    &state.buy_zone_start,
                    &state.buy_zone_end,
                    &state.base_low,
                    &state.base_type.map(|b| b.as_str()),
                    &state.base_start_date,
                    &state.base_length_days,
                    &state.entry_price,
                    &state.entry_date,
                    &state.initial_stop,
                    &state.trailing_stop,
                    &state.target_price,
                    &state.risk_reward,
                    &exit_triggers,
                    &state.days_in_position,
                    &state.current_gain_pct,
                    &state.exit_reason.map(|r| r.as_str()),
                    &state.exit_date,
                    &state.exit_price,
                    &transition_dates,
                    &bar_indexes,
                    &from_phases,
                    &to_phases,
                    &reasons,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_composite_scores(
        &self,
        date: NaiveDate,
        scores: &[CompositeScore],
        normalized: &[NormalizedFactor],
    ) -> EngineResult<()> {
        if scores.is_empty() && normalized.is_empty() {
            return Ok(());
        }
        let symbols: Vec<&str> = scores.iter().map(|s| s.symbol.as_str()).collect();
        let column = |category: Category| -> Vec<Option<f64>> {
            scores.iter().map(|s| s.subscore(category)).collect()
        };
        let momentum = column(Category::Momentum);
        let value = column(Category::Value);
        let quality = column(Category::Quality);
        let growth = column(Category::Growth);
        let positioning = column(Category::Positioning);
        let sentiment = column(Category::Sentiment);
        let stability = column(Category::Stability);
        let overall: Vec<Option<f64>> = scores.iter().map(|s| s.overall).collect();
        let weights: Vec<Value> = scores.iter().map(category_weights_json).collect();
        let contributing: Vec<i32> = scores
            .iter()
            .map(|s| s.contributing_factors as i32)
            .collect();
        let factor_symbols: Vec<&str> = normalized.iter().map(|n| n.symbol.as_str()).collect();
        let factor_names: Vec<&str> = normalized.iter().map(|n| n.factor.as_str()).collect();
        let percentiles: Vec<Option<f64>> = normalized.iter().map(|n| n.percentile).collect();

        self.client
            .execute(
                "WITH scores AS (
                    INSERT INTO composite_scores (
                        symbol, date, momentum, value, quality, growth, positioning, sentiment,
                        stability, overall, category_weights_used, contributing_factors, updated_at
                    )
                    SELECT s.symbol, $1::date, s.momentum, s.value, s.quality, s.growth, s.positioning,
                           s.sentiment, s.stability, s.overall, s.weights, s.contributing, NOW()
                    FROM UNNEST($2::text[], $3::float8[], $4::float8[], $5::float8[], $6::float8[],
                                $7::float8[], $8::float8[], $9::float8[], $10::float8[], $11::jsonb[],
                                $12::int4[])
                         AS s(symbol, momentum, value, quality, growth, positioning, sentiment,
                              stability, overall, weights, contributing)
                    ON CONFLICT (symbol, date) DO UPDATE
                    SET momentum = EXCLUDED.momentum,
                        value = EXCLUDED.value,
                        quality = EXCLUDED.quality,
                        growth = EXCLUDED.growth,
                        positioning = EXCLUDED.positioning,
                        sentiment = EXCLUDED.sentiment,
                        stability = EXCLUDED.stability,
                        overall = EXCLUDED.overall,
                        category_weights_used = EXCLUDED.category_weights_used,
                        contributing_factors = EXCLUDED.contributing_factors,
                        updated_at = NOW()
                    RETURNING symbol
                )
                INSERT INTO normalized_factors (symbol, date, factor, percentile)
                SELECT n.symbol, $1::date, n.factor, n.percentile
                FROM UNNEST($13::text[], $14::text[], $15::float8[]) AS n(symbol, factor, percentile)
                ON CONFLICT (symbol, date, factor) DO UPDATE
                SET percentile = EXCLUDED.percentile",
                &[
                    &date,
                    &symbols,
                    &momentum,
                    &value,
                    &quality,
                    &growth,
                    &positioning,
                    &sentiment,
                    &stability,
                    &overall,
                    &weights,
                    &contributing,
                    &factor_symbols,
                    &factor_names,
                    &percentiles,
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_data_quality(&self, warnings: &[DataQualityWarning]) -> EngineResult<()> {
        if warnings.is_empty() {
            return Ok(());
        }
        let symbols: Vec<&str> = warnings.iter().map(|w| w.symbol.as_str()).collect();
        let timeframes: Vec<&str> = warnings.iter().map(|w| w.timeframe.as_str()).collect();
        let dates: Vec<NaiveDate> = warnings.iter().map(|w| w.date).collect();
        let reasons: Vec<&str> = warnings.iter().map(|w| w.reason.as_str()).collect();

        self.client
            .execute(
                "INSERT INTO data_quality_warnings (symbol, timeframe, date, reason)
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::date[], $4::text[])
                 ON CONFLICT (symbol, timeframe, date) DO UPDATE
                 SET reason = EXCLUDED.reason,
                     recorded_at = NOW()",
                &[&symbols, &timeframes, &dates, &reasons],
            )
            .await?;
        Ok(())
    }
}
