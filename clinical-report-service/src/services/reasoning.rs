use async_trait::async_trait;
use rig::{agent::Agent, client::CompletionClient, completion::Prompt, providers::openrouter};
use serde_json::Value;
use tracing::debug;

use crate::normalize::ExternalValue;

/// An LLM-backed service that takes a mapping of named inputs.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, inputs: &Value) -> anyhow::Result<ExternalValue>;
}

const ENTITY_VALIDATION_PREAMBLE: &str =
    "You are a clinical documentation specialist who validates medical entity extraction.";

const ENTITY_VALIDATION_INSTRUCTIONS: &str = r#"Review the free-text patient note (`input_text`) together with the entities a
named-entity tagger extracted from it (`ner_output`). Correct mis-labelled
entities, drop duplicates and fill in anything the tagger missed.

Return a single JSON object with exactly these keys:
- "age": string or null
- "sex": string or null
- "history": array of strings
- "presenting_complaint": string or null
- "signs_and_symptoms": array of strings
- "examinations_before_checkup": array of strings
- "vital_signs": object mapping vital name to value
- "laboratory_values": object mapping test name to value with unit
- "extra_summary": string or null
- "sample_text": the original note, unchanged

Use only facts present in the note. Return the JSON object only."#;

const DIAGNOSIS_PREAMBLE: &str = "You are an experienced physician producing a ranked preliminary differential diagnosis for clinician review.";

const DIAGNOSIS_INSTRUCTIONS: &str = r#"Using the validated patient report (`post_ner_report`), produce exactly
`output_count` preliminary diagnoses ranked from most to least likely.
When `human_feedback` is present it comes from the reviewing clinician:
take it into account and revise the differential accordingly.

Return a single JSON object of the form:
{"entries": [{"preliminary_diagnosis": "...", "confidence": 0.0,
  "reasoning": "...", "recommendations": ["..."]}]}

`confidence` is a number between 0 and 1. Reasoning must cite the findings
from the report that support the diagnosis. Return the JSON object only."#;

/// rig-core OpenRouter agent with one fixed role.
pub struct RigReasoningService {
    role: &'static str,
    agent: Agent<openrouter::CompletionModel>,
    instructions: &'static str,
}

fn get_llm_agent(api_key: &str, model: &str, preamble: &str) -> Agent<openrouter::CompletionModel> {
    let client = openrouter::Client::new(api_key);
    client.agent(model).preamble(preamble).build()
}

impl RigReasoningService {
    /// Validates and restructures tagger output.
    pub fn entity_validator(api_key: &str, model: &str) -> Self {
        Self {
            role: "entity_validation",
            agent: get_llm_agent(api_key, model, ENTITY_VALIDATION_PREAMBLE),
            instructions: ENTITY_VALIDATION_INSTRUCTIONS,
        }
    }

    /// Produces the ranked differential.
    pub fn diagnostician(api_key: &str, model: &str) -> Self {
        Self {
            role: "diagnosis",
            agent: get_llm_agent(api_key, model, DIAGNOSIS_PREAMBLE),
            instructions: DIAGNOSIS_INSTRUCTIONS,
        }
    }
}

#[async_trait]
impl ReasoningService for RigReasoningService {
    fn name(&self) -> &str {
        self.role
    }

    async fn invoke(&self, inputs: &Value) -> anyhow::Result<ExternalValue> {
        let prompt = format!(
            "{}\n\nInputs:\n{}",
            self.instructions,
            serde_json::to_string_pretty(inputs)?
        );
        let response = self.agent.prompt(&prompt).await?;
        debug!(role = self.role, chars = response.len(), "llm response received");
        Ok(ExternalValue::from_llm_text(&response))
    }
}
