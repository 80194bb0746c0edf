use crate::commands::{log_signal_summary, open_context, write_output, RunOptions};
use crate::context::AppContext;
use crate::models::Timeframe;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, timeframes: &[Timeframe], options: &RunOptions) -> Result<()> {
    let window = options.window()?;
    let context = open_context(app, options).await?;
    let pipeline = context.pipeline();

    let mut summaries = Vec::with_capacity(timeframes.len());
    for timeframe in timeframes {
        info!("Generating {} signals", timeframe);
        let summary = pipeline.run_signals(*timeframe, window).await?;
        log_signal_summary(&context, &summary).await;
        summaries.push(summary);
    }

    if let Some(output) = options.output.as_deref() {
        write_output(output, &context, &summaries)?;
    }
    info!("Completed signal generation");
    Ok(())
}
