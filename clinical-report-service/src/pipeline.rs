//! Entry points: run a case through the stage graph, resume with a supplied
//! entity report, or feed clinician feedback back into an interactive run.

use chrono::Utc;
use dashmap::DashMap;
use flow_graph::{
    Context, ExecutionResult, FlowRunner, GraphStorage, InMemoryGraphStorage,
    InMemorySessionStorage, SessionStorage,
};
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cache::{FileSessionCache, SessionCache};
use crate::config::{CdssConfig, PipelineKind, ServiceCredentials};
use crate::error::{PipelineError, Result};
use crate::models::{ClinicalReport, EntityReport, PatientCase, PrelimReport};
use crate::services::PipelineServices;
use crate::tasks::{FallbackRecord, session_keys, stages};
use crate::workflow::{build_clinical_workflow, create_clinical_session};

/// Owns the per-session state of every run it started. Sessions live until
/// the run finishes (standard pipeline) or until [`ClinicalPipeline::release`]
/// (interactive pipeline).
pub struct ClinicalPipeline {
    config: CdssConfig,
    services: Option<PipelineServices>,
    cache: Arc<dyn SessionCache>,
    sessions: Arc<dyn SessionStorage>,
    graphs: Arc<dyn GraphStorage>,
    /// Held while a run or a feedback round is working on the session.
    guards: DashMap<String, Arc<Mutex<()>>>,
}

impl ClinicalPipeline {
    /// Pipeline writing its session cache under `config.cache_dir`.
    pub fn new(config: CdssConfig) -> Result<Self> {
        let cache = Arc::new(FileSessionCache::new(config.cache_dir.clone()));
        Self::with_cache(config, cache)
    }

    pub fn with_cache(config: CdssConfig, cache: Arc<dyn SessionCache>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            services: None,
            cache,
            sessions: Arc::new(InMemorySessionStorage::new()),
            graphs: Arc::new(InMemoryGraphStorage::new()),
            guards: DashMap::new(),
        })
    }

    /// Use these services for every run instead of building them from
    /// credentials.
    pub fn with_services(mut self, services: PipelineServices) -> Self {
        self.services = Some(services);
        self
    }

    pub fn config(&self) -> &CdssConfig {
        &self.config
    }

    /// Run free text with per-request credentials layered over the
    /// configured ones.
    pub async fn run(&self, text: &str, credentials: &ServiceCredentials) -> Result<ClinicalReport> {
        let credentials = self.config.credentials.merged_with(credentials);
        self.execute(PatientCase::new(text), None, &credentials).await
    }

    pub async fn run_case(&self, case: PatientCase) -> Result<ClinicalReport> {
        self.execute(case, None, &self.config.credentials).await
    }

    /// Resume from a pre-built entity report; the tagging stage is skipped.
    pub async fn run_with_entities(
        &self,
        case: PatientCase,
        entities: EntityReport,
    ) -> Result<ClinicalReport> {
        self.execute(case, Some(entities), &self.config.credentials)
            .await
    }

    /// Re-run the diagnosis stage and everything after it with clinician
    /// feedback. Only the interactive pipeline accepts feedback.
    pub async fn submit_feedback(&self, session_id: &str, feedback: &str) -> Result<ClinicalReport> {
        if self.config.pipeline != PipelineKind::Interactive {
            return Err(PipelineError::ReentryNotSupported(
                "the standard pipeline does not accept feedback".to_string(),
            ));
        }
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(PipelineError::ReentryNotSupported(
                "feedback text is empty".to_string(),
            ));
        }

        // rounds are counted on the stored session, so rounds must not overlap
        let guard = self
            .guards
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        let _round = guard.lock().await;

        let graph = self
            .graphs
            .get(session_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;

        session
            .context
            .set(session_keys::HUMAN_FEEDBACK, feedback)
            .await?;
        self.sessions.save(session).await?;
        self.cache
            .append(
                session_id,
                &format!("\n## Human Feedback ({})\n\n{feedback}\n", Utc::now().to_rfc3339()),
            )
            .await?;

        info!(session_id = %session_id, "Re-running diagnosis with clinician feedback");
        let runner = FlowRunner::new(graph, self.sessions.clone());
        let result = runner.resume_at(session_id, stages::PRELIM_DIAGNOSE).await;
        self.finish(session_id, result).await
    }

    /// Everything the session cache holds for a session.
    pub async fn session_log(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.cache.read(session_id).await?)
    }

    /// Drop the state of an interactive session.
    pub async fn release(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id).await?;
        self.graphs.delete(session_id).await?;
        self.guards.remove(session_id);
        self.cache.forget(session_id);
        Ok(())
    }

    fn guard_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn execute(
        &self,
        case: PatientCase,
        entities: Option<EntityReport>,
        credentials: &ServiceCredentials,
    ) -> Result<ClinicalReport> {
        self.config.check_credentials(credentials)?;
        let guard = self.guard_for(&case.session_id);
        let Ok(_running) = guard.try_lock() else {
            return Err(already_running(&case.session_id));
        };
        if self.sessions.get(&case.session_id).await?.is_some() {
            return Err(already_running(&case.session_id));
        }

        let services = self
            .services
            .clone()
            .unwrap_or_else(|| PipelineServices::from_credentials(&self.config, credentials));
        let graph = Arc::new(build_clinical_workflow(&services, &self.config));
        graph.validate()?;

        let session_id = case.session_id.clone();
        info!(
            session_id = %session_id,
            pipeline = ?self.config.pipeline,
            resumed = entities.is_some(),
            "Starting clinical pipeline"
        );
        let session =
            create_clinical_session(&case, entities.as_ref(), self.config.pipeline.graph_id())
                .await?;
        self.sessions.save(session).await?;
        self.graphs.save(session_id.clone(), graph.clone()).await?;

        let runner = FlowRunner::new(graph, self.sessions.clone());
        let result = runner.run(&session_id).await;
        let outcome = self.finish(&session_id, result).await;

        if self.config.pipeline == PipelineKind::Standard {
            self.release(&session_id).await?;
        }
        outcome
    }

    /// Turn a graph outcome into the report and record it in the cache.
    async fn finish(
        &self,
        session_id: &str,
        result: flow_graph::Result<ExecutionResult>,
    ) -> Result<ClinicalReport> {
        if let Err(e) = result {
            let error = PipelineError::from(e);
            error!(session_id = %session_id, error = %error, "Clinical pipeline failed");
            if let Err(cache_error) = self
                .cache
                .append(session_id, &format!("\n## Pipeline Error\n\n{error}\n"))
                .await
            {
                warn!(session_id = %session_id, error = %cache_error, "Could not record pipeline error");
            }
            return Err(error);
        }

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        let report: ClinicalReport = session
            .context
            .get(stages::REPORT_COMPOSE)
            .await
            .ok_or_else(|| PipelineError::Fatal {
                stage: stages::REPORT_COMPOSE.to_string(),
                message: "the run finished without a report".to_string(),
            })?;

        self.cache
            .append(session_id, &cache_entry(&session.context, &report))
            .await?;
        info!(session_id = %session_id, round = session.rounds, "Clinical pipeline completed");
        Ok(report)
    }
}

fn already_running(session_id: &str) -> PipelineError {
    PipelineError::Configuration(format!("session {session_id} is already running"))
}

/// Stage summaries followed by the rendered report.
fn cache_entry(context: &Context, report: &ClinicalReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n## Run ({})\n", Utc::now().to_rfc3339());

    if let Some(entities) = context.get_sync::<EntityReport>(stages::NER_EXTRACT) {
        let _ = writeln!(
            out,
            "*   Entities: {} (tagger: {})",
            entities.entities.len(),
            entities.tagger
        );
    }
    if let Some(prelim) = context.get_sync::<PrelimReport>(stages::PRELIM_DIAGNOSE) {
        let _ = writeln!(out, "*   Diagnoses ({:?}):", prelim.source);
        for entry in &prelim.entries {
            let _ = writeln!(out, "    *   {} ({:.2})", entry.name, entry.confidence);
        }
    }
    let fallbacks: Vec<FallbackRecord> = context
        .get_sync(session_keys::FALLBACKS)
        .unwrap_or_default();
    for fallback in &fallbacks {
        let _ = writeln!(out, "*   Fallback at {}: {}", fallback.stage, fallback.reason);
    }

    let _ = writeln!(out, "\n## Clinical Report\n\n{}", report.markdown);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySessionCache;
    use crate::labs::LabValues;
    use crate::models::{Entity, ValidatedReport};
    use crate::rules;
    use crate::services::LexiconTagger;
    use crate::tasks::test_support::{FailingSearch, FailingTagger, ScriptedService};
    use async_trait::async_trait;
    use serde_json::json;
    use std::io;

    const CASE: &str = "42-year-old male presenting with a history of type 2 diabetes diagnosed 10 years ago. \
He complains of polyuria, polydipsia, blurred vision, and fatigue for the past 2 weeks. \
Random blood sugar 350 mg/dl, HbA1c 10.5%. Blood pressure 140/90 mmHg. \
Fundoscopic examination reveals microaneurysms and cotton wool spots.";

    fn pipeline(kind: PipelineKind, services: PipelineServices) -> (ClinicalPipeline, Arc<InMemorySessionCache>) {
        let cache = Arc::new(InMemorySessionCache::new());
        let config = CdssConfig::default().with_pipeline(kind);
        let pipeline = ClinicalPipeline::with_cache(config, cache.clone())
            .unwrap()
            .with_services(services);
        (pipeline, cache)
    }

    fn interactive(max_feedback_rounds: u32, cache: Arc<dyn SessionCache>) -> ClinicalPipeline {
        let config = CdssConfig {
            max_feedback_rounds,
            ..CdssConfig::default().with_pipeline(PipelineKind::Interactive)
        };
        ClinicalPipeline::with_cache(config, cache)
            .unwrap()
            .with_services(PipelineServices::disabled())
    }

    /// Refuses to record pipeline errors; everything else goes through.
    #[derive(Default)]
    struct ErrorRejectingCache {
        inner: InMemorySessionCache,
    }

    #[async_trait]
    impl SessionCache for ErrorRejectingCache {
        async fn append(&self, session_id: &str, text: &str) -> io::Result<()> {
            if text.contains("## Pipeline Error") {
                return Err(io::Error::other("disk full"));
            }
            self.inner.append(session_id, text).await
        }

        async fn read(&self, session_id: &str) -> io::Result<Option<String>> {
            self.inner.read(session_id).await
        }
    }

    fn confidence_of(markdown: &str, heading: &str) -> String {
        let start = markdown.find(heading).unwrap();
        let line = markdown[start..]
            .lines()
            .find(|l| l.contains("**Confidence:**"))
            .unwrap();
        line.rsplit(' ').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn end_to_end_with_every_service_disabled() {
        let (pipeline, cache) = pipeline(PipelineKind::Standard, PipelineServices::disabled());

        let report = pipeline
            .run(CASE, &ServiceCredentials::none())
            .await
            .unwrap();
        let markdown = report.as_str();

        assert_eq!(confidence_of(markdown, "### 1. Uncontrolled Type 2 Diabetes"), "0.95");
        assert_eq!(confidence_of(markdown, "### 2. Diabetic Retinopathy"), "0.80");
        assert_eq!(confidence_of(markdown, "### 3. Hypertension"), "0.70");
        assert!(!markdown.contains("## Red Flags"));
        assert!(markdown.contains("*   **Age:** 42-year-old"));
        assert!(markdown.contains("*   **Sex:** male"));
        assert!(markdown.contains("*   microaneurysms"));
        assert!(markdown.contains("### For: Hypertension (elevated blood pressure)"));

        let log = cache.read(&report.session_id).await.unwrap().unwrap();
        assert!(log.contains("## Clinical Report"));
        assert!(log.contains("tagger: lexicon"));
    }

    #[tokio::test]
    async fn failing_services_still_produce_rule_based_report() {
        let services = PipelineServices::disabled()
            .with_tagger(Arc::new(FailingTagger))
            .with_validator(Arc::new(ScriptedService::failing()))
            .with_diagnoser(Arc::new(ScriptedService::answering(json!({"entries": []}))))
            .with_evidence(Arc::new(FailingSearch));
        let (failing, cache) = pipeline(PipelineKind::Standard, services);
        let (disabled, _) = pipeline(PipelineKind::Standard, PipelineServices::disabled());

        let case = PatientCase::new(CASE);
        let report = failing.run_case(case.clone()).await.unwrap();
        let baseline = disabled.run_case(case.clone()).await.unwrap();
        assert_eq!(report.markdown, baseline.markdown);

        let entities = LexiconTagger::new().tag_text(CASE);
        let validated = ValidatedReport::from_entity_report(&entities);
        let expected = rules::preliminary_diagnoses(&validated, &LabValues::from_report(&validated), 3);
        for (idx, entry) in expected.iter().enumerate() {
            assert!(report.markdown.contains(&format!("### {}. {}", idx + 1, entry.name)));
        }

        let log = cache.read(&case.session_id).await.unwrap().unwrap();
        for stage in [stages::NER_EXTRACT, stages::NER_VALIDATE, stages::PRELIM_DIAGNOSE, stages::EVIDENCE_LOOKUP] {
            assert!(log.contains(&format!("Fallback at {stage}")), "no fallback logged for {stage}");
        }
    }

    #[tokio::test]
    async fn supplied_entities_skip_the_tagger() {
        let (pipeline, _) = pipeline(
            PipelineKind::Standard,
            PipelineServices::disabled().with_tagger(Arc::new(FailingTagger)),
        );
        let case = PatientCase::new("Seen in clinic.");
        let mut entities = EntityReport::new(case.text(), "upstream");
        entities.push(Entity::new("headache", "SIGN_SYMPTOM"));
        entities.push(Entity::new("chest pain", "SIGN_SYMPTOM"));

        let report = pipeline.run_with_entities(case, entities).await.unwrap();

        assert!(report.markdown.contains("### 1. Tension-type headache"));
        assert!(report.markdown.contains("### 3. Hypertension"));
    }

    #[tokio::test]
    async fn concurrent_sessions_stay_isolated() {
        let (pipeline, _) = pipeline(PipelineKind::Standard, PipelineServices::disabled());
        let pipeline = Arc::new(pipeline);

        let high = PatientCase::new("Random blood sugar 450 mg/dl.");
        let normal = PatientCase::new("Complains of headache.");
        let (a, b) = tokio::join!(pipeline.run_case(high.clone()), pipeline.run_case(normal.clone()));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.session_id, high.session_id);
        assert_eq!(b.session_id, normal.session_id);
        assert!(a.markdown.contains("## Red Flags"));
        assert!(!b.markdown.contains("## Red Flags"));
        assert!(!b.markdown.contains("450"));
    }

    #[tokio::test]
    async fn required_llm_without_key_is_a_configuration_error() {
        let cache = Arc::new(InMemorySessionCache::new());
        let config = CdssConfig {
            require_llm: true,
            ..CdssConfig::default()
        };
        let pipeline = ClinicalPipeline::with_cache(config, cache.clone()).unwrap();

        let err = pipeline.run(CASE, &ServiceCredentials::none()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn feedback_reruns_diagnosis_and_evidence() {
        let diagnoser = Arc::new(ScriptedService::answering(json!({
            "entries": [{"preliminary_diagnosis": "Diabetic ketoacidosis", "confidence": 0.6}]
        })));
        let (pipeline, cache) = pipeline(
            PipelineKind::Interactive,
            PipelineServices::disabled().with_diagnoser(diagnoser.clone()),
        );
        let case = PatientCase::new(CASE);
        let session_id = case.session_id.clone();

        let first = pipeline.run_case(case).await.unwrap();
        assert!(diagnoser.last_call().unwrap().get("human_feedback").is_none());

        let second = pipeline
            .submit_feedback(&session_id, "Ketones were negative")
            .await
            .unwrap();

        assert_eq!(second.session_id, session_id);
        assert_eq!(first.markdown, second.markdown);
        assert_eq!(
            diagnoser.last_call().unwrap()["human_feedback"],
            json!("Ketones were negative")
        );
        let log = cache.read(&session_id).await.unwrap().unwrap();
        assert!(log.contains("## Human Feedback"));
        assert_eq!(log.matches("## Clinical Report\n").count(), 2);
    }

    #[tokio::test]
    async fn feedback_rounds_are_bounded() {
        let cache = Arc::new(InMemorySessionCache::new());
        let config = CdssConfig {
            max_feedback_rounds: 1,
            ..CdssConfig::default().with_pipeline(PipelineKind::Interactive)
        };
        let pipeline = ClinicalPipeline::with_cache(config, cache)
            .unwrap()
            .with_services(PipelineServices::disabled());
        let case = PatientCase::new(CASE);
        let session_id = case.session_id.clone();
        pipeline.run_case(case).await.unwrap();

        pipeline.submit_feedback(&session_id, "first").await.unwrap();
        assert!(matches!(
            pipeline.submit_feedback(&session_id, "second").await,
            Err(PipelineError::ReentryNotSupported(_))
        ));

        pipeline.release(&session_id).await.unwrap();
        assert!(matches!(
            pipeline.submit_feedback(&session_id, "third").await,
            Err(PipelineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn standard_pipeline_rejects_feedback() {
        let (pipeline, _) = pipeline(PipelineKind::Standard, PipelineServices::disabled());
        let report = pipeline.run(CASE, &ServiceCredentials::none()).await.unwrap();

        assert!(matches!(
            pipeline.submit_feedback(&report.session_id, "more").await,
            Err(PipelineError::ReentryNotSupported(_))
        ));
    }

    #[tokio::test]
    async fn supplied_empty_report_keeps_case_text() {
        let (pipeline, _) = pipeline(PipelineKind::Standard, PipelineServices::disabled());
        let case = PatientCase::new(
            "Random blood sugar 450 mg/dl. Blood pressure 190/100 mmHg. 42-year-old male.",
        );

        let report = pipeline
            .run_with_entities(case, EntityReport::default())
            .await
            .unwrap();

        assert!(report.markdown.contains("## Red Flags"));
        assert_eq!(report.markdown.matches("Consider urgent escalation").count(), 2);
        assert!(report.markdown.contains("*   **Age:** 42-year-old"));
    }

    #[tokio::test]
    async fn same_session_id_runs_once() {
        let pipeline = interactive(3, Arc::new(InMemorySessionCache::new()));
        let case = PatientCase::new(CASE);

        let (a, b) = tokio::join!(pipeline.run_case(case.clone()), pipeline.run_case(case.clone()));

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(PipelineError::Configuration(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_feedback_respects_round_limit() {
        let pipeline = interactive(1, Arc::new(InMemorySessionCache::new()));
        let case = PatientCase::new(CASE);
        let session_id = case.session_id.clone();
        pipeline.run_case(case).await.unwrap();

        let (a, b) = tokio::join!(
            pipeline.submit_feedback(&session_id, "first"),
            pipeline.submit_feedback(&session_id, "second"),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(PipelineError::ReentryNotSupported(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn release_drops_session_guard() {
        let pipeline = interactive(1, Arc::new(InMemorySessionCache::new()));
        let case = PatientCase::new(CASE);
        let session_id = case.session_id.clone();
        pipeline.run_case(case).await.unwrap();
        assert!(pipeline.guards.contains_key(&session_id));

        pipeline.release(&session_id).await.unwrap();

        assert!(pipeline.guards.is_empty());
    }

    #[tokio::test]
    async fn cache_failure_does_not_mask_stage_error() {
        let cache = Arc::new(ErrorRejectingCache::default());
        let pipeline = interactive(1, cache.clone());
        let case = PatientCase::new(CASE);
        let session_id = case.session_id.clone();
        pipeline.run_case(case).await.unwrap();
        pipeline.submit_feedback(&session_id, "first").await.unwrap();

        let err = pipeline.submit_feedback(&session_id, "second").await.unwrap_err();

        assert!(matches!(err, PipelineError::ReentryNotSupported(_)));
        let log = cache.read(&session_id).await.unwrap().unwrap();
        assert!(!log.contains("## Pipeline Error"));
    }
}
