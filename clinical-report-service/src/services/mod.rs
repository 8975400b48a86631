//! Narrow interfaces to the external collaborators and their adapters.

pub mod document;
pub mod evidence;
pub mod reasoning;
pub mod tagger;

pub use document::{DocumentTextExtractor, PlainTextExtractor};
pub use evidence::{EvidenceSearch, SearchHit, TavilySearch};
pub use reasoning::{ReasoningService, RigReasoningService};
pub use tagger::{EntityTagger, HuggingFaceTagger, LexiconTagger};

use std::sync::Arc;

use crate::config::{CdssConfig, ServiceCredentials};

/// The external services one pipeline run may call. `None` disables a
/// service and sends its stage straight to the fallback.
#[derive(Clone, Default)]
pub struct PipelineServices {
    pub tagger: Option<Arc<dyn EntityTagger>>,
    pub validator: Option<Arc<dyn ReasoningService>>,
    pub diagnoser: Option<Arc<dyn ReasoningService>>,
    pub evidence: Option<Arc<dyn EvidenceSearch>>,
}

impl PipelineServices {
    /// Every stage uses its deterministic fallback.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build adapters for whichever credentials are present.
    pub fn from_credentials(config: &CdssConfig, credentials: &ServiceCredentials) -> Self {
        let tagger = credentials.tagger_api_token.as_deref().map(|token| {
            Arc::new(HuggingFaceTagger::new(&config.ner_model, token)) as Arc<dyn EntityTagger>
        });
        let (validator, diagnoser) = match credentials.llm_api_key.as_deref() {
            Some(key) => (
                Some(Arc::new(RigReasoningService::entity_validator(key, &config.llm_model))
                    as Arc<dyn ReasoningService>),
                Some(Arc::new(RigReasoningService::diagnostician(key, &config.llm_model))
                    as Arc<dyn ReasoningService>),
            ),
            None => (None, None),
        };
        let evidence = credentials
            .evidence_api_key
            .as_deref()
            .map(|key| Arc::new(TavilySearch::new(key)) as Arc<dyn EvidenceSearch>);

        Self {
            tagger,
            validator,
            diagnoser,
            evidence,
        }
    }

    pub fn with_tagger(mut self, tagger: Arc<dyn EntityTagger>) -> Self {
        self.tagger = Some(tagger);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ReasoningService>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_diagnoser(mut self, diagnoser: Arc<dyn ReasoningService>) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    pub fn with_evidence(mut self, evidence: Arc<dyn EvidenceSearch>) -> Self {
        self.evidence = Some(evidence);
        self
    }
}
