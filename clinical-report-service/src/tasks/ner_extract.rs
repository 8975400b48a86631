use async_trait::async_trait;
use flow_graph::{Context, GraphError, NextAction, Result, Task, TaskResult};
use std::sync::Arc;
use tracing::info;

use super::{record_fallback, session_keys, stages};
use crate::models::{EntityReport, PatientCase};
use crate::services::{EntityTagger, LexiconTagger};

/// Tags the case text. The preferred tagger is tried first; the bundled
/// lexicon tagger answers when it is absent, fails or finds nothing.
pub struct NerExtractTask {
    preferred: Option<Arc<dyn EntityTagger>>,
    bundled: Arc<dyn EntityTagger>,
}

impl NerExtractTask {
    pub fn new(preferred: Option<Arc<dyn EntityTagger>>) -> Self {
        Self {
            preferred,
            bundled: Arc::new(LexiconTagger::new()),
        }
    }
}

#[async_trait]
impl Task for NerExtractTask {
    fn id(&self) -> &str {
        stages::NER_EXTRACT
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: PatientCase = context.require(session_keys::PATIENT_CASE).await?;
        info!(session_id = %case.session_id, task_id = %self.id(), "Starting entity extraction");

        if let Some(mut report) = context
            .get::<EntityReport>(session_keys::ENTITY_OVERRIDE)
            .await
        {
            // later stages read labs and demographics from the source text
            if report.source_text.trim().is_empty() {
                report.source_text = case.text();
            }
            info!(session_id = %case.session_id, entities = report.entities.len(), "Using supplied entity report");
            context.set(stages::NER_EXTRACT, &report).await?;
            return Ok(TaskResult::new_with_status(
                None,
                NextAction::ContinueAndExecute,
                Some("Entity report supplied by caller".to_string()),
            ));
        }

        let text = case.text();
        let preferred = match &self.preferred {
            Some(tagger) => match tagger.tag(&text).await {
                Ok(report) if report.is_empty() && !text.trim().is_empty() => {
                    record_fallback(
                        &context,
                        &case.session_id,
                        self.id(),
                        format!("{} returned no entities", tagger.name()),
                    )
                    .await?;
                    None
                }
                Ok(report) => Some(report),
                Err(e) => {
                    record_fallback(
                        &context,
                        &case.session_id,
                        self.id(),
                        format!("{} failed: {e}", tagger.name()),
                    )
                    .await?;
                    None
                }
            },
            None => None,
        };

        let report = match preferred {
            Some(report) => report,
            None => self.bundled.tag(&text).await.map_err(|e| {
                GraphError::TaskExecutionFailed(format!("bundled tagger failed: {e}"))
            })?,
        };

        info!(
            session_id = %case.session_id,
            tagger = %report.tagger,
            entities = report.entities.len(),
            "Entity extraction completed"
        );
        context.set(stages::NER_EXTRACT, &report).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("Entities tagged by {}", report.tagger)),
        ))
    }
}
