use crate::commands::ensure_snapshot_exists;
use crate::context::AppContext;
use crate::data_context::MarketData;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

const IMPORT_CHUNK_SIZE: usize = 5_000;

/// Loads bars and raw factors from a snapshot file into the database,
/// overwriting existing rows by key.
pub async fn run(app: &AppContext, input_path: &Path) -> Result<()> {
    ensure_snapshot_exists(input_path).await?;
    let market_data = MarketData::load_from_file(input_path)?;

    let db = app.database().await?;
    db.apply_schema().await?;

    let mut bars_written = 0;
    for chunk in market_data.bars().chunks(IMPORT_CHUNK_SIZE) {
        bars_written += db
            .upsert_bars(chunk)
            .await
            .context("Failed to import bars")?;
    }

    let mut factors_written = 0;
    for chunk in market_data.factors().chunks(IMPORT_CHUNK_SIZE) {
        factors_written += db
            .upsert_raw_factors(chunk)
            .await
            .context("Failed to import raw factors")?;
    }

    info!(
        "Imported {} bars and {} raw factor values for {} symbols from {}",
        bars_written,
        factors_written,
        market_data.symbols().len(),
        input_path.display()
    );
    Ok(())
}
