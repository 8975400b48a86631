//! Deterministic differential used when the diagnosis service is unavailable.
//!
//! Rules run in a fixed order, most specific first, and the result is padded
//! with low-confidence placeholders so it never falls below `min_count`.

use crate::labs::LabValues;
use crate::models::{DiagnosisEntry, ValidatedReport};

const HYPERGLYCEMIA_KEYWORDS: [&str; 5] = [
    "polyuria",
    "polydipsia",
    "polyphagia",
    "blurred vision",
    "fatigue",
];

const FUNDOSCOPIC_KEYWORDS: [&str; 4] = [
    "microaneurysm",
    "cotton wool",
    "cotton-wool",
    "retinopathy",
];

/// Symptom keyword → candidate conditions, consulted only when no rule fired.
const SYMPTOM_ASSOCIATIONS: [(&str, [&str; 3]); 4] = [
    ("fatigue", ["Anemia", "Thyroid disorder", "Chronic disease"]),
    (
        "blurred vision",
        ["Refractive error", "Diabetic retinopathy", "Hypertensive retinopathy"],
    ),
    ("headache", ["Tension-type headache", "Migraine", "Hypertension"]),
    (
        "chest pain",
        ["Stable angina", "Gastroesophageal reflux disease", "Musculoskeletal chest pain"],
    ),
];

const MAX_ASSOCIATION_CANDIDATES: usize = 3;
const PLACEHOLDER_CONFIDENCE: f64 = 0.2;

/// Ranked preliminary diagnoses for a validated report and its lab values.
pub fn preliminary_diagnoses(
    report: &ValidatedReport,
    labs: &LabValues,
    min_count: usize,
) -> Vec<DiagnosisEntry> {
    let symptoms = report.symptom_texts();
    let mut diagnoses = Vec::new();

    diagnoses.extend(hyperglycemia_rule(&symptoms, labs));
    diagnoses.extend(retinopathy_rule(&symptoms, report));
    diagnoses.extend(hypertension_rule(labs));

    if diagnoses.is_empty() {
        diagnoses.extend(symptom_association(&symptoms));
    }

    pad_to_minimum(&mut diagnoses, min_count);
    diagnoses
}

/// Append "insufficient evidence" placeholders until `min_count` is reached.
pub fn pad_to_minimum(diagnoses: &mut Vec<DiagnosisEntry>, min_count: usize) {
    let mut index = 0;
    while diagnoses.len() < min_count {
        index += 1;
        diagnoses.push(DiagnosisEntry::new(
            format!("No strong diagnosis available (fallback {index})"),
            PLACEHOLDER_CONFIDENCE,
            "Insufficient structured evidence from NER/labs to provide a higher-confidence diagnosis.",
            vec!["Obtain further history, vitals, and targeted laboratory tests.".to_string()],
        ));
    }
}

fn matching<'a>(symptoms: &'a [String], keywords: &[&str]) -> Vec<&'a str> {
    symptoms
        .iter()
        .filter(|s| keywords.iter().any(|k| s.contains(k)))
        .map(String::as_str)
        .collect()
}

fn hyperglycemia_rule(symptoms: &[String], labs: &LabValues) -> Option<DiagnosisEntry> {
    let rbs = labs.rbs;
    let hba1c = labs.hba1c;
    let supporting = matching(symptoms, &HYPERGLYCEMIA_KEYWORDS);

    let lab_trigger = rbs.is_some_and(|v| v >= 200.0) || hba1c.is_some_and(|v| v >= 6.5);
    if !lab_trigger && supporting.is_empty() {
        return None;
    }

    let confidence = if rbs.is_some_and(|v| v >= 300.0) || hba1c.is_some_and(|v| v >= 10.0) {
        0.95
    } else if rbs.is_some_and(|v| v >= 200.0) || hba1c.is_some_and(|v| v >= 7.0) {
        0.85
    } else {
        0.65
    };

    let mut reasoning = Vec::new();
    if let Some(rbs) = rbs {
        reasoning.push(format!("Random blood sugar {rbs} mg/dl"));
    }
    if let Some(hba1c) = hba1c {
        reasoning.push(format!("HbA1c {hba1c}%"));
    }
    if !supporting.is_empty() {
        reasoning.push(format!(
            "Classic hyperglycemia symptoms: {}",
            supporting.join(", ")
        ));
    }

    Some(DiagnosisEntry::new(
        "Uncontrolled Type 2 Diabetes Mellitus with Acute Hyperglycemia",
        confidence,
        reasoning.join("; "),
        vec![
            "Continue close monitoring of blood glucose, fluid balance, and electrolytes.".to_string(),
            "Stabilize acute hyperglycemia (IV fluids, insulin infusion) as clinically indicated and monitor electrolytes.".to_string(),
            "Once stable, review outpatient diabetes regimen, adherence, and lifestyle factors; consider endocrinology referral.".to_string(),
        ],
    ))
}

fn retinopathy_rule(symptoms: &[String], report: &ValidatedReport) -> Option<DiagnosisEntry> {
    let findings = matching(symptoms, &FUNDOSCOPIC_KEYWORDS);
    if findings.is_empty() && !report.has_label_containing("fundoscopic") {
        return None;
    }

    let confidence = if findings.is_empty() { 0.6 } else { 0.8 };
    let reasoning = if findings.is_empty() {
        "Fundoscopic finding recorded; retinal involvement should be excluded.".to_string()
    } else {
        format!(
            "Fundoscopic signs ({}) consistent with diabetic retinal microvascular damage.",
            findings.join(", ")
        )
    };

    Some(DiagnosisEntry::new(
        "Diabetic Retinopathy (likely non-proliferative)",
        confidence,
        reasoning,
        vec![
            "Immediate referral to ophthalmology for comprehensive dilated fundoscopic exam and OCT if indicated.".to_string(),
            "Optimize glycemic and blood pressure control to slow progression.".to_string(),
        ],
    ))
}

fn hypertension_rule(labs: &LabValues) -> Option<DiagnosisEntry> {
    let systolic = labs.bp_systolic;
    let diastolic = labs.bp_diastolic;
    if !(systolic.is_some_and(|v| v >= 140) || diastolic.is_some_and(|v| v >= 90)) {
        return None;
    }

    let show = |v: Option<u32>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
    Some(DiagnosisEntry::new(
        "Hypertension (elevated blood pressure)",
        0.7,
        format!(
            "Recorded blood pressure {}/{} mmHg, which is elevated and commonly comorbid with diabetes.",
            show(systolic),
            show(diastolic)
        ),
        vec![
            "Initiate or optimize antihypertensive therapy to achieve target BP (typically <130/80 mmHg for patients with diabetes).".to_string(),
            "Lifestyle modification: low-sodium diet, regular exercise, weight management; monitor blood pressure regularly.".to_string(),
        ],
    ))
}

fn symptom_association(symptoms: &[String]) -> Vec<DiagnosisEntry> {
    // (condition, hits) in first-discovery order
    let mut candidates: Vec<(&str, u32)> = Vec::new();
    for symptom in symptoms {
        for (keyword, conditions) in SYMPTOM_ASSOCIATIONS {
            if !symptom.contains(keyword) {
                continue;
            }
            for condition in conditions {
                match candidates.iter_mut().find(|(name, _)| *name == condition) {
                    Some((_, hits)) => *hits += 1,
                    None => candidates.push((condition, 1)),
                }
            }
        }
    }

    // stable sort keeps discovery order among equal scores
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    candidates
        .into_iter()
        .take(MAX_ASSOCIATION_CANDIDATES)
        .map(|(name, hits)| {
            DiagnosisEntry::new(
                name,
                0.45 + 0.1 * f64::from(hits),
                format!("Symptom match count: {hits}"),
                vec![
                    "Consider targeted laboratory testing and specialist referral as appropriate."
                        .to_string(),
                ],
            )
        })
        .collect()
}
