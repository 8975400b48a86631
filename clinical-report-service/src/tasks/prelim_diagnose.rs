use async_trait::async_trait;
use flow_graph::{Context, NextAction, Result, Task, TaskResult};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use super::{record_fallback, session_keys, stages};
use crate::labs::LabValues;
use crate::models::{DiagnosisEntry, DiagnosisSource, PatientCase, PrelimReport, ValidatedReport};
use crate::normalize::normalize;
use crate::rules;
use crate::services::ReasoningService;

/// Produces the ranked differential. This is the re-entry point for
/// clinician feedback, which is forwarded to the diagnosis service.
pub struct PrelimDiagnoseTask {
    diagnoser: Option<Arc<dyn ReasoningService>>,
    min_count: usize,
}

impl PrelimDiagnoseTask {
    pub fn new(diagnoser: Option<Arc<dyn ReasoningService>>, min_count: usize) -> Self {
        Self {
            diagnoser,
            min_count,
        }
    }
}

#[async_trait]
impl Task for PrelimDiagnoseTask {
    fn id(&self) -> &str {
        stages::PRELIM_DIAGNOSE
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: PatientCase = context.require(session_keys::PATIENT_CASE).await?;
        let report: ValidatedReport = context.require(stages::NER_VALIDATE).await?;
        let feedback: Option<String> = context.get(session_keys::HUMAN_FEEDBACK).await;
        info!(
            session_id = %case.session_id,
            task_id = %self.id(),
            with_feedback = feedback.is_some(),
            "Starting preliminary diagnosis"
        );

        let labs = LabValues::from_report(&report);

        let from_service = match &self.diagnoser {
            Some(service) => {
                match diagnose_with(service.as_ref(), &report, feedback.as_deref(), self.min_count)
                    .await
                {
                    Ok(entries) => Some(entries),
                    Err(e) => {
                        record_fallback(&context, &case.session_id, self.id(), e.to_string())
                            .await?;
                        None
                    }
                }
            }
            None => None,
        };

        let prelim = match from_service {
            Some(entries) => PrelimReport {
                entries,
                labs,
                source: DiagnosisSource::Service,
            },
            None => PrelimReport {
                entries: rules::preliminary_diagnoses(&report, &labs, self.min_count),
                labs,
                source: DiagnosisSource::Rules,
            },
        };

        info!(
            session_id = %case.session_id,
            diagnoses = prelim.entries.len(),
            source = ?prelim.source,
            "Preliminary diagnosis completed"
        );
        context.set(stages::PRELIM_DIAGNOSE, &prelim).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("{} preliminary diagnoses", prelim.entries.len())),
        ))
    }
}

async fn diagnose_with(
    service: &dyn ReasoningService,
    report: &ValidatedReport,
    feedback: Option<&str>,
    min_count: usize,
) -> anyhow::Result<Vec<DiagnosisEntry>> {
    let mut inputs = json!({
        "output_count": min_count,
        "post_ner_report": report,
    });
    if let Some(feedback) = feedback {
        inputs["human_feedback"] = Value::String(feedback.to_string());
    }

    let output = normalize(service.invoke(&inputs).await?);
    let mut entries = parse_entries(output)
        .ok_or_else(|| anyhow::anyhow!("{} returned no usable entries", service.name()))?;
    rules::pad_to_minimum(&mut entries, min_count);
    Ok(entries)
}

/// Entries from `{"entries": [...]}` (or a bare list). Items that do not
/// parse, or have a blank name, are dropped; `None` when nothing is left.
fn parse_entries(output: Value) -> Option<Vec<DiagnosisEntry>> {
    let items = match output {
        Value::Object(mut map) => match map.remove("entries") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        Value::Array(items) => items,
        _ => return None,
    };

    let entries: Vec<DiagnosisEntry> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<DiagnosisEntry>(item).ok())
        .filter(|entry| !entry.name.trim().is_empty())
        .map(DiagnosisEntry::normalized)
        .collect();
    (!entries.is_empty()).then_some(entries)
}
