use crate::commands::{log_score_summary, open_context, write_output, RunOptions};
use crate::context::AppContext;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, options: &RunOptions) -> Result<()> {
    let window = options.window()?;
    let context = open_context(app, options).await?;
    info!(
        "Computing composite scores ({})",
        match (window.from, window.to) {
            (Some(from), Some(to)) => format!("{} - {}", from, to),
            (Some(from), None) => format!("{} onward", from),
            (None, Some(to)) => format!("latest date through {}", to),
            (None, None) => "latest date".to_string(),
        }
    );

    let summary = context.pipeline().run_scores(window).await?;
    log_score_summary(&context, &summary).await;

    if let Some(output) = options.output.as_deref() {
        write_output(output, &context, &summary)?;
    }
    Ok(())
}
