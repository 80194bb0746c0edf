use crate::context::AppContext;
use crate::models::Timeframe;
use anyhow::Result;
use chrono::NaiveDate;
use log::info;
use serde_json::json;

/// Prints the stored signal state, its transitions and the overall composite
/// score of one symbol as JSON.
pub async fn run(
    app: &AppContext,
    symbol: &str,
    timeframe: Timeframe,
    score_date: Option<NaiveDate>,
) -> Result<()> {
    let symbol = symbol.trim();
    let db = app.database().await?;

    let state = db.get_signal_state(symbol, timeframe).await?;
    let transitions = db.get_transitions(symbol, timeframe).await?;
    let score_date = score_date.or_else(|| state.as_ref().and_then(|s| s.as_of_date));
    let overall_score = match score_date {
        Some(date) => db.get_overall_score(symbol, date).await?,
        None => None,
    };

    if state.is_none() {
        info!("No {} signal state stored for {}", timeframe, symbol);
    }

    let document = json!({
        "symbol": symbol,
        "timeframe": timeframe.as_str(),
        "state": state,
        "transitions": transitions,
        "scoreDate": score_date,
        "overallScore": overall_score,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
