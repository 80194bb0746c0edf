use crate::context::AppContext;
use crate::data_context::MarketData;
use crate::models::Timeframe;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let db = app.database().await?;
    let market_data = MarketData::load(&db).await?;
    for timeframe in Timeframe::ALL {
        info!(
            "Snapshot includes {} {} bars",
            market_data.bar_count(timeframe),
            timeframe
        );
    }

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot successfully written to {}",
        output_path.display()
    );

    Ok(())
}
