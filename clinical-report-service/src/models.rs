use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::labs::LabValues;

/// Placeholder rendered for anything the pipeline could not resolve.
pub const NOT_PROVIDED: &str = "Not Provided";

/// One unit of work: the text to analyse and the session it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientCase {
    pub session_id: String,
    pub input_text: String,
    pub document_text: Option<String>,
}

impl PatientCase {
    pub fn new(input_text: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            input_text: input_text.into(),
            document_text: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_document_text(mut self, document_text: impl Into<String>) -> Self {
        self.document_text = Some(document_text.into());
        self
    }

    /// Input text followed by the document text, when there is any.
    pub fn text(&self) -> String {
        match self.document_text.as_deref().map(str::trim) {
            Some(document) if !document.is_empty() => {
                format!("{}\n\n{}", self.input_text.trim_end(), document)
            }
            _ => self.input_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Symptom,
    Sign,
    LabValue,
    Vital,
    Age,
    Sex,
    History,
    Complaint,
    Examination,
    Other,
}

impl EntityCategory {
    pub const ALL: [EntityCategory; 10] = [
        EntityCategory::Symptom,
        EntityCategory::Sign,
        EntityCategory::LabValue,
        EntityCategory::Vital,
        EntityCategory::Age,
        EntityCategory::Sex,
        EntityCategory::History,
        EntityCategory::Complaint,
        EntityCategory::Examination,
        EntityCategory::Other,
    ];

    /// Map a tagger label (bundled, model or LLM vocabulary) onto a category.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match label.as_str() {
            "symptom" | "symptoms" | "sign_symptom" => Self::Symptom,
            "sign" | "signs" | "fundoscopic_finding" | "finding" => Self::Sign,
            "lab_value" | "laboratory_value" | "lab" => Self::LabValue,
            "vital" | "vital_sign" => Self::Vital,
            "age" | "years" | "age_years" => Self::Age,
            "sex" | "gender" => Self::Sex,
            "history" | "hpi" | "medical_history" | "disease_disorder" => Self::History,
            "complaint" | "presenting_complaint" | "chief_complaint" => Self::Complaint,
            "examination" | "procedure" | "diagnostic_procedure" => Self::Examination,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Symptom => "symptom",
            Self::Sign => "sign",
            Self::LabValue => "lab_value",
            Self::Vital => "vital",
            Self::Age => "age",
            Self::Sex => "sex",
            Self::History => "history",
            Self::Complaint => "complaint",
            Self::Examination => "examination",
            Self::Other => "other",
        }
    }
}

/// A tagged text span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    #[serde(default, alias = "type", alias = "entity_group")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Entity {
    pub fn new(text: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
            start: None,
            end: None,
            score: None,
        }
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn category(&self) -> EntityCategory {
        EntityCategory::from_label(&self.label)
    }
}

/// Output of the entity-extraction stage.
///
/// A value is filed under at most one category: the first entity carrying a
/// given text (case-insensitive) wins and later duplicates are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub source_text: String,
    pub tagger: String,
    pub entities: Vec<Entity>,
}

impl EntityReport {
    pub fn new(source_text: impl Into<String>, tagger: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            tagger: tagger.into(),
            entities: Vec::new(),
        }
    }

    /// Add an entity; returns false when the text is empty or already filed.
    pub fn push(&mut self, entity: Entity) -> bool {
        let key = entity.text.trim().to_lowercase();
        if key.is_empty()
            || self
                .entities
                .iter()
                .any(|e| e.text.trim().to_lowercase() == key)
        {
            return false;
        }
        self.entities.push(entity);
        true
    }

    pub fn texts(&self, category: EntityCategory) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|e| e.category() == category)
            .map(|e| e.text.as_str())
            .collect()
    }

    /// Every category mapped to its spans, `Not Provided` for empty ones.
    pub fn categories(&self) -> BTreeMap<EntityCategory, Vec<String>> {
        EntityCategory::ALL
            .iter()
            .map(|category| {
                let texts: Vec<String> = self
                    .texts(*category)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let texts = if texts.is_empty() {
                    vec![NOT_PROVIDED.to_string()]
                } else {
                    texts
                };
                (*category, texts)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Entity report after validation, in the schema the composer reads.
///
/// The service may answer in several dialects, hence the aliases and the
/// lenient field parsers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatedReport {
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub age: Option<String>,
    #[serde(default, alias = "gender", deserialize_with = "lenient::opt_text")]
    pub sex: Option<String>,
    #[serde(default, alias = "medical_history", deserialize_with = "lenient::text_list")]
    pub history: Vec<String>,
    #[serde(default, alias = "chief_complaint", deserialize_with = "lenient::opt_text")]
    pub presenting_complaint: Option<String>,
    #[serde(default, alias = "signs", deserialize_with = "lenient::text_list")]
    pub signs_and_symptoms: Vec<String>,
    #[serde(
        default,
        alias = "examinations_before_checkup",
        deserialize_with = "lenient::text_list"
    )]
    pub examinations: Vec<String>,
    #[serde(default, deserialize_with = "lenient::text_map")]
    pub vital_signs: BTreeMap<String, String>,
    #[serde(default, alias = "labs", deserialize_with = "lenient::text_map")]
    pub laboratory_values: BTreeMap<String, String>,
    #[serde(default, alias = "summary", deserialize_with = "lenient::opt_text")]
    pub extra_summary: Option<String>,
    #[serde(default, deserialize_with = "lenient::entities")]
    pub entities: Vec<Entity>,
    #[serde(default, alias = "raw_text", deserialize_with = "lenient::opt_text")]
    pub sample_text: Option<String>,
}

impl ValidatedReport {
    /// Reshape a raw entity report into the validated schema.
    pub fn from_entity_report(report: &EntityReport) -> Self {
        Self {
            entities: report.entities.clone(),
            sample_text: Some(report.source_text.clone()),
            ..Self::default()
        }
    }

    pub fn source_text(&self) -> Option<&str> {
        self.sample_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Lower-cased texts the rule engine scans for symptom keywords.
    pub fn symptom_texts(&self) -> Vec<String> {
        self.entities
            .iter()
            .map(|e| e.text.as_str())
            .chain(self.signs_and_symptoms.iter().map(String::as_str))
            .chain(self.examinations.iter().map(String::as_str))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn has_label_containing(&self, needle: &str) -> bool {
        self.entities
            .iter()
            .any(|e| e.label.to_lowercase().contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn default_confidence() -> f64 {
    0.5
}

/// One ranked preliminary diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisEntry {
    #[serde(rename = "preliminary_diagnosis", alias = "name", alias = "diagnosis")]
    pub name: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient::text")]
    pub reasoning: String,
    #[serde(default, deserialize_with = "lenient::text_list")]
    pub recommendations: Vec<String>,
}

impl DiagnosisEntry {
    pub fn new(
        name: impl Into<String>,
        confidence: f64,
        reasoning: impl Into<String>,
        recommendations: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            confidence: round_confidence(confidence),
            reasoning: reasoning.into(),
            recommendations,
        }
    }

    /// Clamp the confidence into [0, 1] and round it to two decimals.
    pub fn normalized(mut self) -> Self {
        self.confidence = round_confidence(self.confidence);
        self
    }
}

fn round_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    (confidence.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisSource {
    Service,
    #[default]
    Rules,
}

/// Output of the preliminary-diagnosis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrelimReport {
    pub entries: Vec<DiagnosisEntry>,
    #[serde(default)]
    pub labs: LabValues,
    #[serde(default)]
    pub source: DiagnosisSource,
}

impl PrelimReport {
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub title: String,
    pub url: String,
    pub summary: String,
}

/// Evidence found for one diagnosis; `practices` may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceGroup {
    pub best_practices_for: String,
    pub practices: Vec<EvidenceItem>,
}

/// Evidence groups in diagnosis order.
pub type EvidenceBundle = Vec<EvidenceGroup>;

/// Final rendered report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalReport {
    pub session_id: String,
    pub markdown: String,
}

impl ClinicalReport {
    pub fn as_str(&self) -> &str {
        &self.markdown
    }
}

impl fmt::Display for ClinicalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.markdown)
    }
}

/// Field parsers that accept the loose shapes LLM services return.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::BTreeMap;

    use super::Entity;

    fn scalar_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(scalar_text(&Value::deserialize(d)?))
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(scalar_text(&Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn text_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
            other => scalar_text(&other).into_iter().collect(),
        })
    }

    pub fn text_map<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Object(map) => map
                .iter()
                .filter_map(|(k, v)| scalar_text(v).map(|v| (k.clone(), v)))
                .collect(),
            _ => BTreeMap::new(),
        })
    }

    pub fn entities<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Entity>, D::Error> {
        let Value::Array(items) = Value::deserialize(d)? else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(Entity::new(text, "")),
                object @ Value::Object(_) => serde_json::from_value(object).ok(),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_report_keeps_categories_exclusive() {
        let mut report = EntityReport::new("text", "test");
        assert!(report.push(Entity::new("Fatigue", "SIGN_SYMPTOM")));
        assert!(!report.push(Entity::new("fatigue", "HISTORY")));
        assert!(!report.push(Entity::new("  ", "AGE")));

        let categories = report.categories();
        assert_eq!(categories[&EntityCategory::Symptom], vec!["Fatigue"]);
        assert_eq!(categories[&EntityCategory::History], vec![NOT_PROVIDED]);
        assert_eq!(categories.len(), EntityCategory::ALL.len());
    }

    #[test]
    fn validated_report_accepts_loose_service_output() {
        let report: ValidatedReport = serde_json::from_value(json!({
            "age": 42,
            "gender": "Male",
            "medical_history": "type 2 diabetes",
            "examinations_before_checkup": ["Fundoscopy"],
            "vital_signs": {"Blood pressure": "140/90", "Pulse": 88},
            "entities": ["polyuria", {"text": "microaneurysms", "type": "FUNDOSCOPIC_FINDING"}, 7]
        }))
        .unwrap();

        assert_eq!(report.age.as_deref(), Some("42"));
        assert_eq!(report.sex.as_deref(), Some("Male"));
        assert_eq!(report.history, vec!["type 2 diabetes"]);
        assert_eq!(report.vital_signs["Pulse"], "88");
        assert_eq!(report.entities.len(), 2);
        assert!(report.has_label_containing("fundoscopic"));
    }

    #[test]
    fn raw_text_is_read_as_sample_text() {
        let report: ValidatedReport = serde_json::from_value(json!({
            "age": "61",
            "raw_text": "Random blood sugar 410 mg/dl."
        }))
        .unwrap();

        assert_eq!(report.source_text(), Some("Random blood sugar 410 mg/dl."));
    }

    #[test]
    fn diagnosis_confidence_is_clamped() {
        let entry: DiagnosisEntry = serde_json::from_value(json!({
            "preliminary_diagnosis": "X",
            "confidence": 1.7,
            "recommendations": "rest"
        }))
        .unwrap();
        let entry = entry.normalized();
        assert_eq!(entry.confidence, 1.0);
        assert_eq!(entry.recommendations, vec!["rest"]);
        assert_eq!(DiagnosisEntry::new("Y", 0.456, "", vec![]).confidence, 0.46);
    }

    #[test]
    fn case_text_appends_document() {
        let case = PatientCase::new("note").with_document_text("lab sheet");
        assert_eq!(case.text(), "note\n\nlab sheet");
        assert_eq!(PatientCase::new("only").with_document_text("  ").text(), "only");
    }
}
