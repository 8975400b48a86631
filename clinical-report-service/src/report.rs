//! Deterministic Markdown rendering of the clinical report.
//!
//! Sections always appear in the same order. Each patient field resolves
//! from the structured report first, then from entity labels, then from
//! regexes over the source text; anything left over renders as
//! `Not Provided`.

use regex::Regex;
use std::fmt::Write;
use std::sync::LazyLock;

use crate::labs::LabValues;
use crate::models::{
    DiagnosisEntry, EntityCategory, EvidenceGroup, NOT_PROVIDED, ValidatedReport,
};

pub const DISCLAIMER: &str = "*This is an automated preliminary report. Human clinician review is REQUIRED before any clinical action.*";

pub const RBS_RED_FLAG: f64 = 400.0;
pub const SYSTOLIC_RED_FLAG: u32 = 180;

static AGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3})\s*-\s*years?\s*-\s*old\b|\b(\d{1,3})\s*years?\s*old\b|\bage[:\s]+(\d{1,3})\b")
        .expect("valid regex")
});

static MALE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bmale\b").expect("valid regex"));

static FEMALE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfemale\b").expect("valid regex"));

static COMPLAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(?:complains? of|presenting with)\s+(.*?)(?:\.|$)").expect("valid regex")
});

static KEY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^:]+?)\s*:\s*(.+?)\s*$").expect("valid regex"));

static NAME_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 ]*?[A-Za-z])\s+(\d.*?)\s*$").expect("valid regex")
});

/// Patient fields after resolution, in rendering order.
#[derive(Debug, Default)]
struct PatientDetails {
    age: Option<String>,
    sex: Option<String>,
    history: Vec<String>,
    complaint: Option<String>,
    signs: Vec<String>,
    examinations: Vec<String>,
    vitals: Vec<(String, String)>,
    labs: Vec<(String, String)>,
    extra_summary: Option<String>,
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !list.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        list.push(value.to_string());
    }
}

fn insert_absent(pairs: &mut Vec<(String, String)>, key: &str, value: String) {
    if !pairs.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) {
        pairs.push((key.to_string(), value));
    }
}

/// Split "Pulse: 88 bpm" or "HbA1c 10.5%" into a labelled pair.
fn labelled(text: &str) -> Option<(String, String)> {
    let captures = KEY_VALUE
        .captures(text)
        .or_else(|| NAME_NUMBER.captures(text))?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

impl PatientDetails {
    fn resolve(report: &ValidatedReport, labs: &LabValues) -> Self {
        let mut details = PatientDetails {
            age: report.age.clone(),
            sex: report.sex.clone(),
            complaint: report.presenting_complaint.clone(),
            extra_summary: report.extra_summary.clone(),
            vitals: report
                .vital_signs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            labs: report
                .laboratory_values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..PatientDetails::default()
        };
        for value in &report.history {
            push_unique(&mut details.history, value);
        }
        for value in &report.signs_and_symptoms {
            push_unique(&mut details.signs, value);
        }
        for value in &report.examinations {
            push_unique(&mut details.examinations, value);
        }

        details.apply_entities(report);
        if let Some(text) = report.source_text() {
            details.apply_source_text(text);
        }
        details.apply_labs(labs);
        details
    }

    fn apply_entities(&mut self, report: &ValidatedReport) {
        for entity in &report.entities {
            let text = entity.text.trim();
            match entity.category() {
                EntityCategory::Age => {
                    self.age.get_or_insert_with(|| text.to_string());
                }
                EntityCategory::Sex => {
                    self.sex.get_or_insert_with(|| text.to_string());
                }
                EntityCategory::Complaint => {
                    self.complaint.get_or_insert_with(|| text.to_string());
                }
                EntityCategory::History => push_unique(&mut self.history, text),
                EntityCategory::Symptom | EntityCategory::Sign => {
                    push_unique(&mut self.signs, text)
                }
                EntityCategory::Examination => push_unique(&mut self.examinations, text),
                EntityCategory::Vital => {
                    let (key, value) =
                        labelled(text).unwrap_or_else(|| ("Vital".to_string(), text.to_string()));
                    insert_absent(&mut self.vitals, &key, value);
                }
                EntityCategory::LabValue => {
                    let (key, value) =
                        labelled(text).unwrap_or_else(|| ("Lab".to_string(), text.to_string()));
                    insert_absent(&mut self.labs, &key, value);
                }
                EntityCategory::Other => {}
            }
        }
    }

    fn apply_source_text(&mut self, text: &str) {
        if self.age.is_none() {
            self.age = AGE.captures(text).and_then(|c| {
                let years = c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3))?;
                Some(format!("{}-year-old", years.as_str()))
            });
        }
        if self.sex.is_none() {
            self.sex = if FEMALE.is_match(text) {
                Some("Female".to_string())
            } else if MALE.is_match(text) {
                Some("Male".to_string())
            } else {
                None
            };
        }
        if self.complaint.is_none() {
            self.complaint = COMPLAINT
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|c| !c.is_empty());
        }
    }

    fn apply_labs(&mut self, labs: &LabValues) {
        let has_glucose = self
            .labs
            .iter()
            .any(|(k, _)| k.to_lowercase().contains("sugar") || k.eq_ignore_ascii_case("rbs"));
        if let (Some(rbs), false) = (labs.rbs, has_glucose) {
            insert_absent(&mut self.labs, "Random blood sugar", format!("{rbs} mg/dl"));
        }
        let has_hba1c = self
            .labs
            .iter()
            .any(|(k, _)| k.to_lowercase().contains("a1c"));
        if let (Some(hba1c), false) = (labs.hba1c, has_hba1c) {
            insert_absent(&mut self.labs, "HbA1c", format!("{hba1c}%"));
        }
        let has_bp = self.vitals.iter().any(|(k, _)| {
            let k = k.to_lowercase();
            k.contains("blood pressure") || k == "bp"
        });
        if let (Some(systolic), Some(diastolic), false) =
            (labs.bp_systolic, labs.bp_diastolic, has_bp)
        {
            insert_absent(
                &mut self.vitals,
                "Blood pressure",
                format!("{systolic}/{diastolic} mmHg"),
            );
        }
    }
}

/// Red-flag lines for the given values; empty when nothing fires.
pub fn red_flags(labs: &LabValues) -> Vec<String> {
    let mut flags = Vec::new();
    if let Some(rbs) = labs.rbs.filter(|v| *v >= RBS_RED_FLAG) {
        flags.push(format!(
            "Severely elevated random blood sugar ({rbs} mg/dl, threshold {RBS_RED_FLAG}). Consider urgent escalation."
        ));
    }
    if let Some(systolic) = labs.bp_systolic.filter(|v| *v >= SYSTOLIC_RED_FLAG) {
        flags.push(format!(
            "Hypertensive-range systolic blood pressure ({systolic} mmHg, threshold {SYSTOLIC_RED_FLAG}). Consider urgent escalation."
        ));
    }
    flags
}

fn or_not_provided(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or(NOT_PROVIDED)
}

fn bullet_list(out: &mut String, items: &[String]) {
    if items.is_empty() {
        let _ = writeln!(out, "*   {NOT_PROVIDED}");
    }
    for item in items {
        let _ = writeln!(out, "*   {item}");
    }
}

fn pair_list(out: &mut String, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        let _ = writeln!(out, "*   {NOT_PROVIDED}");
    }
    for (key, value) in pairs {
        let _ = writeln!(out, "*   **{key}:** {value}");
    }
}

/// Render the report. Pure: the same inputs always give the same text.
pub fn compose(
    report: &ValidatedReport,
    diagnoses: &[DiagnosisEntry],
    evidence: &[EvidenceGroup],
) -> String {
    let labs = LabValues::from_report(report);
    let details = PatientDetails::resolve(report, &labs);
    let mut out = String::new();

    let _ = writeln!(out, "{DISCLAIMER}\n");
    let _ = writeln!(out, "# Clinical Report\n");

    let _ = writeln!(out, "## Patient Information\n");
    let _ = writeln!(out, "*   **Age:** {}", or_not_provided(details.age.as_deref()));
    let _ = writeln!(out, "*   **Sex:** {}\n", or_not_provided(details.sex.as_deref()));

    let _ = writeln!(out, "## History\n");
    bullet_list(&mut out, &details.history);

    let _ = writeln!(out, "\n## Presenting Complaint\n");
    let _ = writeln!(out, "{}", or_not_provided(details.complaint.as_deref()));

    let _ = writeln!(out, "\n## Signs and Symptoms\n");
    bullet_list(&mut out, &details.signs);

    let _ = writeln!(out, "\n## Examinations\n");
    bullet_list(&mut out, &details.examinations);

    let _ = writeln!(out, "\n## Vital Signs\n");
    pair_list(&mut out, &details.vitals);

    let _ = writeln!(out, "\n## Laboratory Values\n");
    pair_list(&mut out, &details.labs);

    let _ = writeln!(out, "\n## Extra Summary\n");
    let _ = writeln!(out, "{}", or_not_provided(details.extra_summary.as_deref()));

    let _ = writeln!(out, "\n## Preliminary Diagnoses\n");
    if diagnoses.is_empty() {
        let _ = writeln!(out, "{NOT_PROVIDED}");
    }
    for (idx, entry) in diagnoses.iter().enumerate() {
        let _ = writeln!(out, "### {}. {}\n", idx + 1, entry.name);
        let _ = writeln!(out, "*   **Confidence:** {:.2}", entry.confidence);
        let _ = writeln!(
            out,
            "*   **Reasoning:** {}",
            or_not_provided(Some(entry.reasoning.as_str()))
        );
        let _ = writeln!(out, "*   **Recommendations:**");
        if entry.recommendations.is_empty() {
            let _ = writeln!(out, "    *   {NOT_PROVIDED}");
        }
        for recommendation in &entry.recommendations {
            let _ = writeln!(out, "    *   {recommendation}");
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "\n## Best Practices & References\n");
    if evidence.is_empty() {
        let _ = writeln!(out, "{NOT_PROVIDED}");
    }
    for group in evidence {
        let _ = writeln!(out, "### For: {}\n", group.best_practices_for);
        if group.practices.is_empty() {
            let _ = writeln!(out, "*   No best-practice content found.");
        }
        for item in &group.practices {
            let _ = writeln!(out, "*   **{}**: {} ({})", item.title, item.summary, item.url);
        }
        let _ = writeln!(out);
    }

    let flags = red_flags(&labs);
    if !flags.is_empty() {
        let _ = writeln!(out, "\n## Red Flags\n");
        for flag in &flags {
            let _ = writeln!(out, "*   {flag}");
        }
    }

    let _ = writeln!(out, "\n---\n\n{DISCLAIMER}");
    out
}
