use async_trait::async_trait;
use flow_graph::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{session_keys, stages};
use crate::models::{ClinicalReport, EvidenceBundle, PatientCase, PrelimReport, ValidatedReport};
use crate::report;

/// Join stage: runs once the validated report, the diagnoses and the
/// evidence are all in the context.
pub struct ReportComposeTask;

#[async_trait]
impl Task for ReportComposeTask {
    fn id(&self) -> &str {
        stages::REPORT_COMPOSE
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: PatientCase = context.require(session_keys::PATIENT_CASE).await?;
        let validated: ValidatedReport = context.require(stages::NER_VALIDATE).await?;
        let prelim: PrelimReport = context.require(stages::PRELIM_DIAGNOSE).await?;
        let evidence: EvidenceBundle = context.require(stages::EVIDENCE_LOOKUP).await?;
        info!(session_id = %case.session_id, task_id = %self.id(), "Composing clinical report");

        let markdown = report::compose(&validated, &prelim.entries, &evidence);
        let clinical_report = ClinicalReport {
            session_id: case.session_id.clone(),
            markdown: markdown.clone(),
        };
        context.set(stages::REPORT_COMPOSE, &clinical_report).await?;

        info!(session_id = %case.session_id, chars = markdown.len(), "Clinical report ready");

        Ok(TaskResult::new_with_status(
            Some(markdown),
            NextAction::End,
            Some("Clinical report composed".to_string()),
        ))
    }
}
