use async_trait::async_trait;
use flow_graph::{Context, NextAction, Result, Task, TaskResult};
use std::sync::Arc;
use tracing::info;

use super::{record_fallback, session_keys, stages};
use crate::models::{EvidenceBundle, EvidenceGroup, EvidenceItem, PatientCase};
use crate::services::{EvidenceSearch, SearchHit};

/// Looks up best-practice material for every diagnosis, one query each, in
/// diagnosis order. A failed or missing search leaves the group empty.
pub struct EvidenceLookupTask {
    search: Option<Arc<dyn EvidenceSearch>>,
    min_score: f64,
}

impl EvidenceLookupTask {
    pub fn new(search: Option<Arc<dyn EvidenceSearch>>, min_score: f64) -> Self {
        Self { search, min_score }
    }

    fn keep(&self, hits: Vec<SearchHit>) -> Vec<EvidenceItem> {
        hits.into_iter()
            .filter(|hit| hit.score > self.min_score)
            .map(|hit| EvidenceItem {
                title: hit.title,
                url: hit.url,
                summary: hit.content,
            })
            .collect()
    }
}

pub fn best_practice_query(diagnosis: &str) -> String {
    format!("Best practices for {diagnosis}")
}

#[async_trait]
impl Task for EvidenceLookupTask {
    fn id(&self) -> &str {
        stages::EVIDENCE_LOOKUP
    }

    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: PatientCase = context.require(session_keys::PATIENT_CASE).await?;
        let names: Vec<String> = context.require(stages::EXTRACT_DIAGNOSIS_NAMES).await?;
        info!(
            session_id = %case.session_id,
            task_id = %self.id(),
            queries = names.len(),
            "Starting evidence lookup"
        );

        let mut bundle: EvidenceBundle = Vec::with_capacity(names.len());
        for name in names {
            let practices = match &self.search {
                Some(search) => match search.search(&best_practice_query(&name)).await {
                    Ok(hits) => self.keep(hits),
                    Err(e) => {
                        record_fallback(
                            &context,
                            &case.session_id,
                            self.id(),
                            format!("{} failed for '{name}': {e}", search.name()),
                        )
                        .await?;
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            bundle.push(EvidenceGroup {
                best_practices_for: name,
                practices,
            });
        }

        if self.search.is_none() {
            info!(session_id = %case.session_id, "No evidence service configured");
        }
        context.set(stages::EVIDENCE_LOOKUP, &bundle).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!(
                "{} evidence items found",
                bundle.iter().map(|g| g.practices.len()).sum::<usize>()
            )),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::test_support::{FailingSearch, FixedSearch};

    fn hit(title: &str, score: f64) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: format!("https://example.org/{title}"),
            content: "guidance".to_string(),
            score,
        }
    }

    async fn context_with_names(names: &[&str]) -> Context {
        let context = Context::new();
        context
            .set(session_keys::PATIENT_CASE, PatientCase::new("note"))
            .await
            .unwrap();
        context
            .set(stages::EXTRACT_DIAGNOSIS_NAMES, names)
            .await
            .unwrap();
        context
    }

    #[tokio::test]
    async fn filters_by_score_and_keeps_order() {
        let context = context_with_names(&["Hypertension", "Anemia"]).await;
        let search = Arc::new(FixedSearch::new(vec![hit("low", 0.4), hit("high", 0.41)]));

        EvidenceLookupTask::new(Some(search.clone()), 0.4)
            .run(context.clone())
            .await
            .unwrap();

        let bundle: EvidenceBundle = context.require(stages::EVIDENCE_LOOKUP).await.unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle[0].best_practices_for, "Hypertension");
        assert_eq!(bundle[1].best_practices_for, "Anemia");
        assert_eq!(bundle[0].practices.len(), 1);
        assert_eq!(bundle[0].practices[0].title, "high");
        assert_eq!(
            *search.queries.lock().unwrap(),
            vec!["Best practices for Hypertension", "Best practices for Anemia"]
        );
    }

    #[tokio::test]
    async fn missing_or_failing_search_gives_empty_groups() {
        for search in [None, Some(Arc::new(FailingSearch) as Arc<dyn EvidenceSearch>)] {
            let context = context_with_names(&["Anemia"]).await;
            EvidenceLookupTask::new(search, 0.4)
                .run(context.clone())
                .await
                .unwrap();

            let bundle: EvidenceBundle = context.require(stages::EVIDENCE_LOOKUP).await.unwrap();
            assert_eq!(bundle.len(), 1);
            assert!(bundle[0].practices.is_empty());
        }
    }
}
