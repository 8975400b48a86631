//! Runtime configuration, read once from the environment and passed to the
//! pipeline explicitly.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{PipelineError, Result};

pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_NER_MODEL: &str = "Clinical-AI-Apollo/Medical-NER";
pub const DEFAULT_CACHE_DIR: &str = "cache";
pub const DEFAULT_MIN_DIAGNOSES: usize = 3;
pub const DEFAULT_EVIDENCE_MIN_SCORE: f64 = 0.4;
pub const DEFAULT_MAX_FEEDBACK_ROUNDS: u32 = 3;

/// Which stage graph to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineKind {
    /// Single pass, no feedback.
    #[default]
    Standard,
    /// Accepts clinician feedback that re-runs the diagnosis stage.
    Interactive,
}

impl PipelineKind {
    pub fn graph_id(&self) -> &'static str {
        match self {
            PipelineKind::Standard => "clinical_report",
            PipelineKind::Interactive => "clinical_report_interactive",
        }
    }
}

impl FromStr for PipelineKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(PipelineKind::Standard),
            "interactive" => Ok(PipelineKind::Interactive),
            other => Err(PipelineError::Configuration(format!(
                "CDSS_PIPELINE must be 'standard' or 'interactive', got '{other}'"
            ))),
        }
    }
}

/// API keys for the external services. A missing key disables the service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceCredentials {
    pub llm_api_key: Option<String>,
    pub evidence_api_key: Option<String>,
    pub tagger_api_token: Option<String>,
}

impl ServiceCredentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            llm_api_key: non_blank(lookup("OPENROUTER_API_KEY")),
            evidence_api_key: non_blank(lookup("TAVILY_API_KEY")),
            tagger_api_token: non_blank(lookup("HF_API_TOKEN")),
        }
    }

    /// Keys present in `overrides` replace ours.
    pub fn merged_with(&self, overrides: &ServiceCredentials) -> Self {
        Self {
            llm_api_key: overrides
                .llm_api_key
                .clone()
                .or_else(|| self.llm_api_key.clone()),
            evidence_api_key: overrides
                .evidence_api_key
                .clone()
                .or_else(|| self.evidence_api_key.clone()),
            tagger_api_token: overrides
                .tagger_api_token
                .clone()
                .or_else(|| self.tagger_api_token.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CdssConfig {
    pub credentials: ServiceCredentials,
    pub llm_model: String,
    pub ner_model: String,
    pub cache_dir: PathBuf,
    /// Minimum number of preliminary diagnoses in every report.
    pub min_diagnoses: usize,
    /// Evidence hits must score strictly above this.
    pub evidence_min_score: f64,
    pub pipeline: PipelineKind,
    pub max_feedback_rounds: u32,
    /// Refuse to run without an LLM key instead of falling back to rules.
    pub require_llm: bool,
}

impl Default for CdssConfig {
    fn default() -> Self {
        Self {
            credentials: ServiceCredentials::default(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            ner_model: DEFAULT_NER_MODEL.to_string(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            min_diagnoses: DEFAULT_MIN_DIAGNOSES,
            evidence_min_score: DEFAULT_EVIDENCE_MIN_SCORE,
            pipeline: PipelineKind::Standard,
            max_feedback_rounds: DEFAULT_MAX_FEEDBACK_ROUNDS,
            require_llm: false,
        }
    }
}

impl CdssConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| non_blank(lookup(key));

        let config = Self {
            credentials: ServiceCredentials::from_lookup(&lookup),
            llm_model: var("CDSS_LLM_MODEL").unwrap_or(defaults.llm_model),
            ner_model: var("CDSS_NER_MODEL").unwrap_or(defaults.ner_model),
            cache_dir: var("CDSS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            min_diagnoses: parse_or(
                var("CDSS_MIN_DIAGNOSES"),
                "CDSS_MIN_DIAGNOSES",
                defaults.min_diagnoses,
            )?,
            evidence_min_score: parse_or(
                var("CDSS_EVIDENCE_MIN_SCORE"),
                "CDSS_EVIDENCE_MIN_SCORE",
                defaults.evidence_min_score,
            )?,
            pipeline: var("CDSS_PIPELINE")
                .map(|v| v.parse::<PipelineKind>())
                .transpose()?
                .unwrap_or(defaults.pipeline),
            max_feedback_rounds: parse_or(
                var("CDSS_MAX_FEEDBACK_ROUNDS"),
                "CDSS_MAX_FEEDBACK_ROUNDS",
                defaults.max_feedback_rounds,
            )?,
            require_llm: var("CDSS_REQUIRE_LLM")
                .map(|v| parse_flag(&v))
                .transpose()?
                .unwrap_or(defaults.require_llm),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_pipeline(mut self, pipeline: PipelineKind) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_credentials(mut self, credentials: ServiceCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_diagnoses == 0 {
            return Err(PipelineError::Configuration(
                "CDSS_MIN_DIAGNOSES must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.evidence_min_score) {
            return Err(PipelineError::Configuration(format!(
                "CDSS_EVIDENCE_MIN_SCORE must be within [0, 1], got {}",
                self.evidence_min_score
            )));
        }
        Ok(())
    }

    /// Checked before any stage runs.
    pub fn check_credentials(&self, credentials: &ServiceCredentials) -> Result<()> {
        if self.require_llm && credentials.llm_api_key.is_none() {
            return Err(PipelineError::Configuration(
                "OPENROUTER_API_KEY is required when CDSS_REQUIRE_LLM is set".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| PipelineError::Configuration(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PipelineError::Configuration(format!(
            "CDSS_REQUIRE_LLM has invalid value '{other}'"
        ))),
    }
}
