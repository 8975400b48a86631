use async_trait::async_trait;
use flow_graph::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::stages;
use crate::models::PrelimReport;

/// Lifts the diagnosis names out of the preliminary report, in rank order.
pub struct ExtractDiagnosisNamesTask;

#[async_trait]
impl Task for ExtractDiagnosisNamesTask {
    fn id(&self) -> &str {
        stages::EXTRACT_DIAGNOSIS_NAMES
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let prelim: PrelimReport = context.require(stages::PRELIM_DIAGNOSE).await?;
        let names = prelim.names();
        info!(task_id = %self.id(), names = ?names, "Diagnosis names extracted");
        context.set(stages::EXTRACT_DIAGNOSIS_NAMES, &names).await?;

        Ok(TaskResult::new(None, NextAction::ContinueAndExecute))
    }
}
