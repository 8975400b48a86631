pub mod evidence_lookup;
pub mod extract_diagnoses;
pub mod ner_extract;
pub mod ner_validate;
pub mod prelim_diagnose;
pub mod report_compose;

pub use evidence_lookup::EvidenceLookupTask;
pub use extract_diagnoses::ExtractDiagnosisNamesTask;
pub use ner_extract::NerExtractTask;
pub use ner_validate::NerValidateTask;
pub use prelim_diagnose::PrelimDiagnoseTask;
pub use report_compose::ReportComposeTask;

use flow_graph::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Task ids; each stage also stores its output under its own id.
pub mod stages {
    pub const NER_EXTRACT: &str = "ner_extract";
    pub const NER_VALIDATE: &str = "ner_validate";
    pub const PRELIM_DIAGNOSE: &str = "prelim_diagnose";
    pub const EXTRACT_DIAGNOSIS_NAMES: &str = "extract_diagnosis_names";
    pub const EVIDENCE_LOOKUP: &str = "evidence_lookup";
    pub const REPORT_COMPOSE: &str = "report_compose";
}

/// Context keys that are not stage outputs.
pub mod session_keys {
    pub const PATIENT_CASE: &str = "patient_case";
    /// Pre-built entity report; the extraction stage uses it as is.
    pub const ENTITY_OVERRIDE: &str = "entity_override";
    pub const HUMAN_FEEDBACK: &str = "human_feedback";
    pub const FALLBACKS: &str = "fallbacks";
}

/// A stage that answered with its deterministic fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub stage: String,
    pub reason: String,
}

/// Log and remember that `stage` fell back.
pub(crate) async fn record_fallback(
    context: &Context,
    session_id: &str,
    stage: &str,
    reason: impl Into<String>,
) -> Result<()> {
    let reason = reason.into();
    warn!(session_id = %session_id, task_id = %stage, reason = %reason, "using fallback");

    let mut fallbacks: Vec<FallbackRecord> = context
        .get(session_keys::FALLBACKS)
        .await
        .unwrap_or_default();
    fallbacks.push(FallbackRecord {
        stage: stage.to_string(),
        reason,
    });
    context.set(session_keys::FALLBACKS, fallbacks).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    use crate::models::EntityReport;
    use crate::normalize::ExternalValue;
    use crate::services::{EntityTagger, EvidenceSearch, ReasoningService, SearchHit};

    /// Reasoning service that replays a fixed answer and records its inputs.
    pub struct ScriptedService {
        answer: Option<ExternalValue>,
        pub calls: Mutex<Vec<Value>>,
    }

    impl ScriptedService {
        pub fn answering(value: Value) -> Self {
            Self {
                answer: Some(ExternalValue::from_llm_text(&value.to_string())),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn raw(answer: ExternalValue) -> Self {
            Self {
                answer: Some(answer),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                answer: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn last_call(&self) -> Option<Value> {
            self.calls.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ReasoningService for ScriptedService {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(&self, inputs: &Value) -> anyhow::Result<ExternalValue> {
            self.calls.lock().unwrap().push(inputs.clone());
            self.answer
                .clone()
                .ok_or_else(|| anyhow::anyhow!("service unavailable"))
        }
    }

    pub struct FailingTagger;

    #[async_trait]
    impl EntityTagger for FailingTagger {
        fn name(&self) -> &str {
            "failing"
        }

        async fn tag(&self, _text: &str) -> anyhow::Result<EntityReport> {
            Err(anyhow::anyhow!("model is loading"))
        }
    }

    /// Evidence search returning the same hits for every query.
    pub struct FixedSearch {
        pub hits: Vec<SearchHit>,
        pub queries: Mutex<Vec<String>>,
    }

    impl FixedSearch {
        pub fn new(hits: Vec<SearchHit>) -> Self {
            Self {
                hits,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EvidenceSearch for FixedSearch {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.hits.clone())
        }
    }

    pub struct FailingSearch;

    #[async_trait]
    impl EvidenceSearch for FailingSearch {
        fn name(&self) -> &str {
            "failing"
        }

        async fn search(&self, _query: &str) -> anyhow::Result<Vec<SearchHit>> {
            Err(anyhow::anyhow!("rate limited"))
        }
    }
}
