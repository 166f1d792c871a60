//! Bounded scorer sub-pool: runs every configured scorer for a case,
//! enforcing the run-case-failed and hard-timeout sentinels before ever
//! touching the evaluator backend.

pub mod backend;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::EvaluatorSettings;
use crate::domain::{Scorer, ScorerResult};
use crate::error::ScoreSentinelReason;

use backend::{EvaluatorClient, ScoreOutcome, ScoreRequest};

pub struct ScorerPool {
    client: Arc<EvaluatorClient>,
    semaphore: Arc<Semaphore>,
    hard_timeout: Duration,
}

/// Phase callback contract for the scheduler's refcounted status transitions:
/// the first `on_score_start` flips a case to `scoring`, the last
/// `on_score_done` flips it back to `trajectory`.
pub trait ScorerPhaseObserver: Send + Sync {
    fn on_score_start(&self);
    fn on_score_done(&self);
}

impl ScorerPool {
    pub fn new(settings: EvaluatorSettings, concurrency: usize) -> anyhow::Result<Self> {
        Ok(Self {
            hard_timeout: Duration::from_secs_f64(settings.scorer_hard_timeout_seconds),
            client: Arc::new(EvaluatorClient::new(settings)?),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    pub async fn score_all(
        &self,
        case_failed: bool,
        scorers: &[Scorer],
        user_input: &Value,
        trajectory: &Value,
        agent_output: &Value,
        reference_output: &Value,
        observer: &dyn ScorerPhaseObserver,
    ) -> Vec<ScorerResult> {
        if scorers.is_empty() {
            return vec![];
        }

        observer.on_score_start();
        let mut handles = Vec::with_capacity(scorers.len());
        for scorer in scorers {
            let permit = self.semaphore.clone();
            let client = self.client.clone();
            let scorer = scorer.clone();
            let hard_timeout = self.hard_timeout;
            let request = ScoreRequest {
                base_url: scorer.base_url.clone(),
                api_key: scorer.api_key.clone().unwrap_or_default(),
                model: scorer.model.clone(),
                prompt_template: scorer.prompt_template.clone().unwrap_or_default(),
                user_input: user_input.clone(),
                trajectory: trajectory.clone(),
                agent_output: agent_output.clone(),
                reference_output: reference_output.clone(),
                tools: scorer.scorer_config.get("tools").cloned().unwrap_or(Value::Null),
            };

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let outcome = score_one(case_failed, &client, &scorer, request, hard_timeout).await;
                ScorerResult { scorer_name: scorer.name, score: outcome.score, reason: outcome.reason }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }
        observer.on_score_done();
        results
    }
}

async fn score_one(
    case_failed: bool,
    client: &EvaluatorClient,
    scorer: &Scorer,
    request: ScoreRequest,
    hard_timeout: Duration,
) -> ScoreOutcome {
    if case_failed {
        return ScoreOutcome { score: -1.0, reason: ScoreSentinelReason::RunCaseFailed.to_string() };
    }

    match tokio::time::timeout(hard_timeout, client.score(scorer.api_style, &request)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => ScoreOutcome { score: -1.0, reason: format!("{}", e) },
        Err(_) => ScoreOutcome { score: -1.0, reason: ScoreSentinelReason::ScorerTimeout.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingObserver {
        starts: AtomicU32,
        dones: AtomicU32,
    }

    impl ScorerPhaseObserver for CountingObserver {
        fn on_score_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_score_done(&self) {
            self.dones.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn score_all_returns_empty_without_observer_calls_when_no_scorers() {
        let observer = CountingObserver { starts: AtomicU32::new(0), dones: AtomicU32::new(0) };
        let settings = crate::config::EvaluatorSettings {
            timeout_seconds: 1.0,
            connect_timeout_seconds: 1.0,
            read_timeout_seconds: 1.0,
            max_retries: 0,
            retry_backoff_seconds: 0.1,
            scorer_hard_timeout_seconds: 1.0,
        };
        let pool = ScorerPool::new(settings, 1).unwrap();
        let results = pool
            .score_all(false, &[], &Value::Null, &Value::Null, &Value::Null, &Value::Null, &observer)
            .await;
        assert!(results.is_empty());
        assert_eq!(observer.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sentinel_reasons_render_expected_codes() {
        assert_eq!(ScoreSentinelReason::RunCaseFailed.to_string(), "E_SCORE_DEFAULT_RUN_CASE_FAILED");
        assert_eq!(ScoreSentinelReason::ScorerTimeout.to_string(), "E_SCORE_DEFAULT_SCORER_TIMEOUT");
    }
}
