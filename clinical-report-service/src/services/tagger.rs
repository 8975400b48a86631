use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::LazyLock;
use tracing::debug;

use crate::models::{Entity, EntityReport};

/// Turns free text into labelled entity spans.
#[async_trait]
pub trait EntityTagger: Send + Sync {
    fn name(&self) -> &str;

    async fn tag(&self, text: &str) -> anyhow::Result<EntityReport>;
}

const HF_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";

/// Token-classification model behind the Hugging Face inference API.
pub struct HuggingFaceTagger {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct EntityGroup {
    #[serde(alias = "entity")]
    entity_group: String,
    word: String,
    start: Option<usize>,
    end: Option<usize>,
    score: Option<f64>,
}

impl HuggingFaceTagger {
    pub fn new(model: &str, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{HF_INFERENCE_URL}/{model}"),
            token: token.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EntityTagger for HuggingFaceTagger {
    fn name(&self) -> &str {
        "huggingface"
    }

    async fn tag(&self, text: &str) -> anyhow::Result<EntityReport> {
        let groups: Vec<EntityGroup> = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({
                "inputs": text,
                "parameters": {"aggregation_strategy": "simple"}
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(groups = groups.len(), "token classification returned");

        let mut report = EntityReport::new(text, self.name());
        for group in groups {
            let label = group
                .entity_group
                .trim_start_matches("B-")
                .trim_start_matches("I-")
                .to_string();
            // severity qualifiers carry no value of their own
            if label.eq_ignore_ascii_case("SEVERITY") {
                continue;
            }
            let word = group.word.replace("##", "").trim().to_string();
            let mut entity = Entity::new(word, label);
            if let (Some(start), Some(end)) = (group.start, group.end) {
                entity = entity.with_span(start, end);
            }
            entity.score = group.score;
            report.push(entity);
        }
        Ok(report)
    }
}

/// Term lists matched as whole words, case-insensitively.
const LEXICON: &[(&str, &[&str])] = &[
    (
        "SIGN_SYMPTOM",
        &[
            "polyuria",
            "polydipsia",
            "polyphagia",
            "blurred vision",
            "fatigue",
            "headache",
            "chest pain",
            "shortness of breath",
            "nausea",
            "vomiting",
            "dizziness",
            "weight loss",
            "fever",
            "cough",
            "palpitations",
            "numbness",
            "tingling",
        ],
    ),
    (
        "FUNDOSCOPIC_FINDING",
        &[
            "microaneurysms",
            "microaneurysm",
            "cotton wool spots",
            "cotton-wool spots",
            "hard exudates",
            "retinal hemorrhages",
        ],
    ),
    (
        "DIAGNOSTIC_PROCEDURE",
        &[
            "fundoscopic examination",
            "physical examination",
            "electrocardiogram",
            "ecg",
        ],
    ),
];

/// Patterns whose first capture group (or whole match) becomes the entity.
const PATTERNS: &[(&str, &str)] = &[
    ("AGE", r"(?i)\b\d{1,3}\s*-?\s*years?\s*-?\s*old\b"),
    ("AGE", r"(?i)\bage[:\s]+\d{1,3}\b"),
    ("SEX", r"(?i)\b(?:male|female)\b"),
    ("HISTORY", r"(?i)\bhistory of ([^.,;\n]+)"),
    ("COMPLAINT", r"(?i)\bcomplains? of ([^.\n]+)"),
    (
        "LAB_VALUE",
        r"(?i)\b(?:random blood sugar|blood glucose|hba1c)\s*[:\s]\s*[0-9]+(?:\.[0-9]+)?\s*(?:mg/dl|%)?",
    ),
    (
        "VITAL_SIGN",
        r"(?i)\bblood pressure\s*[:\s]?\s*\d{2,3}\s*/\s*\d{2,3}\s*(?:mmhg)?",
    ),
    (
        "VITAL_SIGN",
        r"(?i)\b(?:heart rate|pulse)\s*[:\s]?\s*\d{2,3}\s*(?:bpm)?",
    ),
];

static COMPILED: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let terms = LEXICON.iter().flat_map(|(label, terms)| {
        terms.iter().map(move |term| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(term));
            (*label, Regex::new(&pattern).expect("valid regex"))
        })
    });
    let patterns = PATTERNS
        .iter()
        .map(|(label, pattern)| (*label, Regex::new(pattern).expect("valid regex")));
    terms.chain(patterns).collect()
});

/// Bundled keyword tagger. Deterministic and offline, so the extraction
/// stage always has something to fall back to.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconTagger;

impl LexiconTagger {
    pub fn new() -> Self {
        Self
    }

    /// Tag synchronously; entities are reported in text order.
    pub fn tag_text(&self, text: &str) -> EntityReport {
        let mut found: Vec<(usize, usize, &str)> = Vec::new();
        for (label, regex) in COMPILED.iter() {
            for captures in regex.captures_iter(text) {
                let Some(span) = captures.get(1).or_else(|| captures.get(0)) else {
                    continue;
                };
                found.push((span.start(), span.end(), *label));
            }
        }
        // earliest first; the longer span wins at the same offset
        found.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut report = EntityReport::new(text, "lexicon");
        for (start, end, label) in found {
            let span = text[start..end].trim();
            report.push(Entity::new(span, label).with_span(start, end));
        }
        report
    }
}

#[async_trait]
impl EntityTagger for LexiconTagger {
    fn name(&self) -> &str {
        "lexicon"
    }

    async fn tag(&self, text: &str) -> anyhow::Result<EntityReport> {
        Ok(self.tag_text(text))
    }
}
