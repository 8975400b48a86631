use flow_graph::{Graph, GraphBuilder, Session};
use std::sync::Arc;

use crate::config::{CdssConfig, PipelineKind};
use crate::models::{EntityReport, PatientCase};
use crate::services::PipelineServices;
use crate::tasks::*;

/// ner_extract → ner_validate → prelim_diagnose → extract_diagnosis_names →
/// evidence_lookup, with report_compose joined on {ner_validate,
/// prelim_diagnose, evidence_lookup}.
pub fn build_clinical_workflow(services: &PipelineServices, config: &CdssConfig) -> Graph {
    let ner_extract_task = Arc::new(NerExtractTask::new(services.tagger.clone()));
    let ner_validate_task = Arc::new(NerValidateTask::new(services.validator.clone()));
    let prelim_diagnose_task = Arc::new(PrelimDiagnoseTask::new(
        services.diagnoser.clone(),
        config.min_diagnoses,
    ));
    let extract_names_task = Arc::new(ExtractDiagnosisNamesTask);
    let evidence_lookup_task = Arc::new(EvidenceLookupTask::new(
        services.evidence.clone(),
        config.evidence_min_score,
    ));
    let report_compose_task = Arc::new(ReportComposeTask);

    let builder = GraphBuilder::new(config.pipeline.graph_id())
        .add_task(ner_extract_task)
        .add_task(ner_validate_task)
        .add_task(prelim_diagnose_task)
        .add_task(extract_names_task)
        .add_task(evidence_lookup_task)
        .add_task(report_compose_task)
        .add_edge(stages::NER_EXTRACT, stages::NER_VALIDATE)
        .add_edge(stages::NER_VALIDATE, stages::PRELIM_DIAGNOSE)
        .add_edge(stages::PRELIM_DIAGNOSE, stages::EXTRACT_DIAGNOSIS_NAMES)
        .add_edge(stages::EXTRACT_DIAGNOSIS_NAMES, stages::EVIDENCE_LOOKUP)
        .add_join(
            stages::REPORT_COMPOSE,
            [
                stages::NER_VALIDATE,
                stages::PRELIM_DIAGNOSE,
                stages::EVIDENCE_LOOKUP,
            ],
        );

    match config.pipeline {
        PipelineKind::Standard => builder.max_rounds(0).build(),
        PipelineKind::Interactive => builder
            .allow_reentry(stages::PRELIM_DIAGNOSE)
            .max_rounds(config.max_feedback_rounds)
            .build(),
    }
}

/// Session positioned at the first stage, holding the case (and the
/// pre-built entity report when resuming).
pub async fn create_clinical_session(
    case: &PatientCase,
    entities: Option<&EntityReport>,
    graph_id: &str,
) -> flow_graph::Result<Session> {
    let session = Session::new_from_task(case.session_id.clone(), stages::NER_EXTRACT)
        .with_graph_id(graph_id);
    session.context.set(session_keys::PATIENT_CASE, case).await?;
    if let Some(entities) = entities {
        session
            .context
            .set(session_keys::ENTITY_OVERRIDE, entities)
            .await?;
    }
    Ok(session)
}
