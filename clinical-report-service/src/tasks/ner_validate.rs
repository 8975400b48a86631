use async_trait::async_trait;
use flow_graph::{Context, NextAction, Result, Task, TaskResult};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use super::{record_fallback, session_keys, stages};
use crate::models::{EntityReport, PatientCase, ValidatedReport};
use crate::normalize::normalize;
use crate::services::ReasoningService;

/// Asks the validation service to clean up the raw entity report. Without a
/// usable answer the raw report is reshaped into the validated schema.
pub struct NerValidateTask {
    validator: Option<Arc<dyn ReasoningService>>,
}

impl NerValidateTask {
    pub fn new(validator: Option<Arc<dyn ReasoningService>>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Task for NerValidateTask {
    fn id(&self) -> &str {
        stages::NER_VALIDATE
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: PatientCase = context.require(session_keys::PATIENT_CASE).await?;
        let entities: EntityReport = context.require(stages::NER_EXTRACT).await?;
        info!(session_id = %case.session_id, task_id = %self.id(), "Starting entity validation");

        let validated = match &self.validator {
            Some(service) => match validate_with(service.as_ref(), &entities).await {
                Ok(report) => Some(report),
                Err(e) => {
                    record_fallback(&context, &case.session_id, self.id(), e.to_string()).await?;
                    None
                }
            },
            None => None,
        };

        let (report, status) = match validated {
            Some(report) => (report, "Entities validated by service"),
            None => (
                ValidatedReport::from_entity_report(&entities),
                "Raw entity report used as validated report",
            ),
        };
        context.set(stages::NER_VALIDATE, &report).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(status.to_string()),
        ))
    }
}

async fn validate_with(
    service: &dyn ReasoningService,
    entities: &EntityReport,
) -> anyhow::Result<ValidatedReport> {
    let inputs = json!({
        "input_text": entities.source_text,
        "ner_output": entities.categories(),
    });
    let output = normalize(service.invoke(&inputs).await?);
    if !matches!(output, Value::Object(_)) {
        return Err(anyhow::anyhow!(
            "{} returned a non-object result",
            service.name()
        ));
    }

    let mut report: ValidatedReport = serde_json::from_value(output)
        .map_err(|e| anyhow::anyhow!("{} returned an invalid report: {e}", service.name()))?;
    if report.is_empty() {
        return Err(anyhow::anyhow!("{} returned an empty report", service.name()));
    }

    if report.source_text().is_none() {
        report.sample_text = Some(entities.source_text.clone());
    }
    // keep the tagged spans for the rule engine
    if report.entities.is_empty() {
        report.entities = entities.entities.clone();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Entity;
    use crate::tasks::test_support::ScriptedService;

    async fn context_with_entities() -> Context {
        let context = Context::new();
        let case = PatientCase::new("Patient reports fatigue.");
        let mut entities = EntityReport::new(case.text(), "lexicon");
        entities.push(Entity::new("fatigue", "SIGN_SYMPTOM"));
        context.set(session_keys::PATIENT_CASE, &case).await.unwrap();
        context.set(stages::NER_EXTRACT, &entities).await.unwrap();
        context
    }

    #[tokio::test]
    async fn accepts_service_report_and_fills_gaps() {
        let context = context_with_entities().await;
        let service = Arc::new(ScriptedService::answering(json!({
            "age": "58",
            "signs_and_symptoms": ["fatigue"],
            "vital_signs": {"Pulse": "92 bpm"}
        })));

        NerValidateTask::new(Some(service.clone()))
            .run(context.clone())
            .await
            .unwrap();

        let report: ValidatedReport = context.require(stages::NER_VALIDATE).await.unwrap();
        assert_eq!(report.age.as_deref(), Some("58"));
        assert_eq!(report.source_text(), Some("Patient reports fatigue."));
        assert_eq!(report.entities.len(), 1);

        let call = service.last_call().unwrap();
        assert_eq!(call["ner_output"]["symptom"], json!(["fatigue"]));
        assert_eq!(call["ner_output"]["history"], json!(["Not Provided"]));
    }

    #[tokio::test]
    async fn malformed_answer_falls_back_to_raw_entities() {
        for service in [
            ScriptedService::answering(json!(["not", "an", "object"])),
            ScriptedService::answering(json!({})),
            ScriptedService::failing(),
        ] {
            let context = context_with_entities().await;
            NerValidateTask::new(Some(Arc::new(service)))
                .run(context.clone())
                .await
                .unwrap();

            let entities: EntityReport = context.require(stages::NER_EXTRACT).await.unwrap();
            let report: ValidatedReport = context.require(stages::NER_VALIDATE).await.unwrap();
            assert_eq!(report, ValidatedReport::from_entity_report(&entities));
            assert!(context.contains(session_keys::FALLBACKS));
        }
    }
}
