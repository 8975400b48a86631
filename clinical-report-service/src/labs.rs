//! Regex heuristics for the handful of numeric values the rules care about.
//!
//! Every key is extracted independently and best-effort: a value that cannot
//! be found is simply absent. The proximity windows keep unrelated numbers
//! (ages, durations) from being read as lab values, but the heuristics stay
//! approximate.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use crate::models::ValidatedReport;

/// The fixed key vocabulary, in serialization order.
pub const LAB_KEYS: [&str; 4] = ["RBS", "HbA1c", "BP_systolic", "BP_diastolic"];

/// Characters inspected on each side of a candidate number.
const PROXIMITY_WINDOW: usize = 40;

/// Fields of a structured record that may carry the source text, by preference.
const TEXT_FIELDS: [&str; 5] = ["raw_text", "sample_text", "text", "report", "raw_report"];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static LABELED_RBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)random\s*blood\s*sugar[:\s]*(?:of|is|was)?\s*([0-9]{2,4}(?:\.[0-9]+)?)")
        .expect("valid regex")
});

static NUMBER_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{2,4}(?:\.[0-9]+)?)\s*(mg/dl|mg dl|mgdl)?").expect("valid regex")
});

static LABELED_HBA1C: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)hb\s?[a\-]?1c[^\d]{0,6}([0-9]{1,2}(?:\.[0-9]+)?)").expect("valid regex")
});

static BARE_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([0-9]{1,2}(?:\.[0-9]+)?)\s*%").expect("valid regex")
});

static BLOOD_PRESSURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{2,3})\s*/\s*([0-9]{2,3})\s*(?:mmhg)?").expect("valid regex")
});

/// Numeric lab and vital values; `None` means "not detected", never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LabValues {
    #[serde(rename = "RBS", default, skip_serializing_if = "Option::is_none")]
    pub rbs: Option<f64>,
    #[serde(rename = "HbA1c", default, skip_serializing_if = "Option::is_none")]
    pub hba1c: Option<f64>,
    #[serde(rename = "BP_systolic", default, skip_serializing_if = "Option::is_none")]
    pub bp_systolic: Option<u32>,
    #[serde(rename = "BP_diastolic", default, skip_serializing_if = "Option::is_none")]
    pub bp_diastolic: Option<u32>,
}

impl LabValues {
    pub fn from_text(text: &str) -> Self {
        extract_lab_values(text)
    }

    /// Extract from a structured record: the first non-empty text-bearing
    /// field is scanned, or the whole record serialized when there is none.
    pub fn from_record(record: &Value) -> Self {
        let text = match record {
            Value::String(text) => text.clone(),
            Value::Object(map) => TEXT_FIELDS
                .iter()
                .filter_map(|field| map.get(*field))
                .find_map(|value| match value {
                    Value::Null => None,
                    Value::String(s) if s.trim().is_empty() => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .unwrap_or_else(|| record.to_string()),
            other => other.to_string(),
        };
        extract_lab_values(&text)
    }

    pub fn from_report(report: &ValidatedReport) -> Self {
        Self::from_record(&serde_json::to_value(report).unwrap_or(Value::Null))
    }

    /// Detected keys, always a subset of [`LAB_KEYS`].
    pub fn keys(&self) -> Vec<&'static str> {
        let present = [
            self.rbs.is_some(),
            self.hba1c.is_some(),
            self.bp_systolic.is_some(),
            self.bp_diastolic.is_some(),
        ];
        LAB_KEYS
            .iter()
            .zip(present)
            .filter_map(|(key, present)| present.then_some(*key))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

/// Pull random blood sugar, HbA1c and blood pressure out of free text.
pub fn extract_lab_values(text: &str) -> LabValues {
    let text = WHITESPACE.replace_all(text, " ");
    let (bp_systolic, bp_diastolic) = match extract_blood_pressure(&text) {
        Some((systolic, diastolic)) => (Some(systolic), Some(diastolic)),
        None => (None, None),
    };
    LabValues {
        rbs: extract_random_blood_sugar(&text),
        hba1c: extract_hba1c(&text),
        bp_systolic,
        bp_diastolic,
    }
}

fn extract_random_blood_sugar(text: &str) -> Option<f64> {
    if let Some(value) = LABELED_RBS
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
    {
        return Some(value);
    }

    NUMBER_WITH_UNIT.captures_iter(text).find_map(|captures| {
        let number = captures.get(1)?;
        let has_unit = captures.get(2).is_some();
        let whole = captures.get(0)?;
        let nearby = window(text, whole.start(), whole.end()).to_lowercase();
        if has_unit || nearby.contains("sugar") || nearby.contains("random") {
            number.as_str().parse().ok()
        } else {
            None
        }
    })
}

fn extract_hba1c(text: &str) -> Option<f64> {
    if let Some(captures) = LABELED_HBA1C.captures(text) {
        return captures.get(1).and_then(|m| m.as_str().parse().ok());
    }

    BARE_PERCENT.captures_iter(text).find_map(|captures| {
        let whole = captures.get(0)?;
        let nearby = window(text, whole.start(), whole.end()).to_lowercase();
        if nearby.contains("hba1c") || nearby.contains("a1c") {
            captures.get(1)?.as_str().parse().ok()
        } else {
            None
        }
    })
}

fn extract_blood_pressure(text: &str) -> Option<(u32, u32)> {
    let captures = BLOOD_PRESSURE.captures(text)?;
    let systolic = captures.get(1)?.as_str().parse().ok()?;
    let diastolic = captures.get(2)?.as_str().parse().ok()?;
    Some((systolic, diastolic))
}

/// Up to PROXIMITY_WINDOW bytes on each side of `start..end`, widened to
/// char boundaries.
fn window(text: &str, start: usize, end: usize) -> &str {
    let mut from = start.saturating_sub(PROXIMITY_WINDOW);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + PROXIMITY_WINDOW).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CASE: &str = "42-year-old male presenting with a history of type 2 diabetes diagnosed 10 years ago.
Physical Examination revealed Blood pressure 140/90 mmHg. Fundoscopic examination reveals microaneurysms.
Investigations reported Random blood sugar 350 mg/dl, HbA1c 10.5%.";

    #[test]
    fn empty_text_yields_nothing() {
        let labs = extract_lab_values("");
        assert!(labs.is_empty());
        assert_eq!(serde_json::to_value(labs).unwrap(), json!({}));
    }

    #[test]
    fn extracts_all_values_from_case_text() {
        let labs = extract_lab_values(CASE);
        assert_eq!(labs.rbs, Some(350.0));
        assert_eq!(labs.hba1c, Some(10.5));
        assert_eq!(labs.bp_systolic, Some(140));
        assert_eq!(labs.bp_diastolic, Some(90));
        assert_eq!(labs.keys(), LAB_KEYS.to_vec());
    }

    #[test]
    fn ignores_numbers_without_glucose_context() {
        let labs = extract_lab_values("A 42 year old presenting after 10 days of cough.");
        assert_eq!(labs.rbs, None);
        assert!(labs.keys().iter().all(|k| LAB_KEYS.contains(k)));
    }

    #[test]
    fn accepts_unit_or_nearby_keyword_for_glucose() {
        assert_eq!(extract_lab_values("glucose 212 mg/dl").rbs, Some(212.0));
        assert_eq!(extract_lab_values("sugar level was 180").rbs, Some(180.0));
    }

    #[test]
    fn bare_percent_needs_a1c_nearby() {
        assert_eq!(extract_lab_values("Saturation 97% on room air").hba1c, None);
        assert_eq!(extract_lab_values("A1C result: 8.2 %").hba1c, Some(8.2));
        assert_eq!(extract_lab_values("last a1c came back at 7.4%").hba1c, Some(7.4));
    }

    #[test]
    fn record_prefers_text_fields() {
        let record = json!({
            "entities": [{"text": "BP 200/120"}],
            "sample_text": "Blood pressure 150/95 mmHg"
        });
        let labs = LabValues::from_record(&record);
        assert_eq!(labs.bp_systolic, Some(150));

        let record = json!({"entities": [{"text": "BP 200/120"}]});
        assert_eq!(LabValues::from_record(&record).bp_systolic, Some(200));
    }

    #[test]
    fn window_respects_char_boundaries() {
        let text = "é".repeat(30) + " sugar 250 " + &"ü".repeat(30);
        assert_eq!(extract_lab_values(&text).rbs, Some(250.0));
    }
}
