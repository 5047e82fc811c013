use serde_json::json;

use crate::ledger::CheckpointStep;

use super::{staging_reference, DriverError, ExecutionResult, StepContext};

/// Walk the standard checkpoints without touching any site.
pub(crate) async fn simulate(scx: &StepContext<'_>) -> Result<ExecutionResult, DriverError> {
    let target = scx.target;
    let (last, steps) = match CheckpointStep::STANDARD.split_last() {
        Some((last, steps)) => (*last, steps),
        None => return Ok(ExecutionResult::success("Nothing to execute")),
    };

    for step in steps {
        scx.checkpoint(*step, json!({ "simulated": true })).await?;
    }
    scx.checkpoint(last, json!({ "url": target.url })).await?;

    tracing::info!(task_id = scx.task_id, title = %target.title, "simulated run finished");
    Ok(ExecutionResult::success("Execution completed (simulated)")
        .with_confirmation_id(staging_reference("GEN"))
        .with_detail("url", target.url.clone())
        .with_detail("title", target.title.clone())
        .with_detail("simulated", true))
}
