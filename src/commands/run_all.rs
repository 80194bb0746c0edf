use crate::commands::{log_score_summary, log_signal_summary, open_context, write_output, RunOptions};
use crate::context::AppContext;
use crate::models::Timeframe;
use anyhow::Result;
use log::info;
use serde::Serialize;

#[derive(Serialize)]
struct RunAllSummary<'a> {
    signals: &'a [crate::pipeline::SignalRunSummary],
    scores: &'a crate::pipeline::ScoreRunSummary,
}

pub async fn run(app: &AppContext, timeframes: &[Timeframe], options: &RunOptions) -> Result<()> {
    let window = options.window()?;
    let context = open_context(app, options).await?;
    info!(
        "Running signals for {} timeframe(s) followed by composite scoring",
        timeframes.len()
    );

    let (signals, scores) = context.pipeline().run_all(timeframes, window).await?;
    for summary in &signals {
        log_signal_summary(&context, summary).await;
    }
    log_score_summary(&context, &scores).await;

    if let Some(output) = options.output.as_deref() {
        let summary = RunAllSummary {
            signals: &signals,
            scores: &scores,
        };
        write_output(output, &context, &summary)?;
    }
    Ok(())
}
