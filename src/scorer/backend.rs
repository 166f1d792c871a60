//! HTTP client for one evaluator backend, openai/anthropic API styles with
//! retry-with-backoff over transient failures.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::warn;

use crate::config::EvaluatorSettings;
use crate::domain::message::ScorerApiStyle;
use crate::error::{ScoreSentinelReason, WorkerError, WorkerResult};

const SYSTEM_PROMPT: &str = r#"Return JSON only: {"score":0|0.5|1,"reason":"..."}"#;
const RETRYABLE_STATUSES: &[u16] = &[408, 409, 425, 429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub prompt_template: String,
    pub user_input: Value,
    pub trajectory: Value,
    pub agent_output: Value,
    pub reference_output: Value,
    pub tools: Value,
}

#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub score: f64,
    pub reason: String,
}

pub struct EvaluatorClient {
    http: Client,
    settings: EvaluatorSettings,
}

impl EvaluatorClient {
    pub fn new(settings: EvaluatorSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs_f64(settings.connect_timeout_seconds))
            .timeout(Duration::from_secs_f64(settings.timeout_seconds))
            .build()?;
        Ok(Self { http, settings })
    }

    pub async fn score(&self, style: ScorerApiStyle, request: &ScoreRequest) -> WorkerResult<ScoreOutcome> {
        let result = match style {
            ScorerApiStyle::Openai => self.call_with_retry(|| self.call_openai(request)).await,
            ScorerApiStyle::Anthropic => {
                match self.call_with_retry(|| self.call_anthropic(request)).await {
                    Ok(outcome) => Ok(outcome),
                    Err(_) => self.call_with_retry(|| self.call_openai(request)).await,
                }
            }
        };

        match result {
            Ok(raw) if raw.trim().is_empty() => {
                Ok(ScoreOutcome { score: -1.0, reason: ScoreSentinelReason::EmptyContent.to_string() })
            }
            Ok(raw) => Ok(parse_score_response(&raw)),
            Err(e) => Err(e),
        }
    }

    async fn call_with_retry<'a, F, Fut>(&'a self, call: F) -> WorkerResult<String>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = WorkerResult<String>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.settings.max_retries && is_retryable(&e) => {
                    let backoff = self.settings.retry_backoff_seconds * 2f64.powi(attempt as i32);
                    warn!(attempt, backoff, error = %e, "evaluator call failed, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_openai(&self, request: &ScoreRequest) -> WorkerResult<String> {
        let user_message = substitute_template(&request.prompt_template, request);
        let body = json!({
            "model": request.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_message},
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", request.base_url))
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(connection_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(status.as_u16()));
        }
        let value: Value = response.json().await.map_err(connection_error)?;
        extract_message_content(&value)
    }

    async fn call_anthropic(&self, request: &ScoreRequest) -> WorkerResult<String> {
        let user_message = substitute_template(&request.prompt_template, request);
        let body = json!({
            "model": request.model,
            "max_tokens": 256,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": user_message}],
        });

        let response = self
            .http
            .post(format!("{}/messages", request.base_url))
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(connection_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(status.as_u16()));
        }
        let value: Value = response.json().await.map_err(connection_error)?;
        value
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| WorkerError::Other(anyhow::anyhow!("anthropic response missing content text")))
    }
}

fn extract_message_content(value: &Value) -> WorkerResult<String> {
    value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| WorkerError::Other(anyhow::anyhow!("openai response missing message content")))
}

fn substitute_template(template: &str, request: &ScoreRequest) -> String {
    let mut placeholders: HashMap<&str, String> = HashMap::new();
    placeholders.insert("user_input", to_template_string(&request.user_input));
    placeholders.insert("trajectory", to_template_string(&request.trajectory));
    placeholders.insert("agent_output", to_template_string(&request.agent_output));
    placeholders.insert("reference_output", to_template_string(&request.reference_output));
    placeholders.insert("tools", to_template_string(&request.tools));

    let mut out = template.to_string();
    for (key, value) in placeholders {
        out = out.replace(&format!("{{{{{key}}}}}"), &value);
    }
    out
}

fn to_template_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Bucketizes a raw numeric score onto the `{0, 0.5, 1}` staircase. Anything
/// unparsable (including a missing `score` field upstream) must instead
/// produce a sentinel before reaching this function.
fn bucketize(raw: f64) -> f64 {
    if raw >= 0.9 {
        1.0
    } else if raw >= 0.6 {
        0.5
    } else {
        0.0
    }
}

fn parse_score_response(raw: &str) -> ScoreOutcome {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return ScoreOutcome { score: -1.0, reason: ScoreSentinelReason::InvalidJson.to_string() };
    };
    let Some(score) = value.get("score").and_then(Value::as_f64) else {
        return ScoreOutcome { score: -1.0, reason: ScoreSentinelReason::ScoreInvalid.to_string() };
    };
    let reason = value.get("reason").and_then(Value::as_str).unwrap_or("").to_string();
    let bucketed = if score == 0.0 || score == 0.5 || score == 1.0 { score } else { bucketize(score) };
    ScoreOutcome { score: bucketed, reason }
}

fn connection_error(e: reqwest::Error) -> WorkerError {
    WorkerError::Other(anyhow::anyhow!("evaluator connection error: {e}"))
}

fn http_error(status: u16) -> WorkerError {
    WorkerError::Other(anyhow::anyhow!("evaluator returned HTTP {status}"))
}

/// Connection errors and timeouts are always retryable; HTTP status errors
/// only for the documented transient set. Matched against the error's
/// rendered message since reqwest errors are consumed before reaching here.
fn is_retryable(error: &WorkerError) -> bool {
    let message = error.to_string();
    if message.contains("connection error") || message.contains("timed out") || message.contains("timeout") {
        return true;
    }
    RETRYABLE_STATUSES
        .iter()
        .any(|status| message.contains(&format!("HTTP {status}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketize_staircase_matches_thresholds() {
        assert_eq!(bucketize(1.0), 1.0);
        assert_eq!(bucketize(0.9), 1.0);
        assert_eq!(bucketize(0.89), 0.5);
        assert_eq!(bucketize(0.6), 0.5);
        assert_eq!(bucketize(0.59), 0.0);
        assert_eq!(bucketize(0.0), 0.0);
    }

    #[test]
    fn parse_score_response_sentinels_on_bad_json() {
        let outcome = parse_score_response("not json");
        assert_eq!(outcome.score, -1.0);
        assert_eq!(outcome.reason, "E_EVALUATOR_INVALID_JSON");
    }

    #[test]
    fn parse_score_response_sentinels_on_missing_score() {
        let outcome = parse_score_response(r#"{"reason":"ok"}"#);
        assert_eq!(outcome.score, -1.0);
        assert_eq!(outcome.reason, "E_EVALUATOR_SCORE_INVALID");
    }

    #[test]
    fn parse_score_response_bucketizes_valid_score() {
        let outcome = parse_score_response(r#"{"score":0.95,"reason":"good"}"#);
        assert_eq!(outcome.score, 1.0);
        assert_eq!(outcome.reason, "good");
    }

    #[test]
    fn template_substitution_fills_all_placeholders() {
        let request = ScoreRequest {
            base_url: "http://evaluator".into(),
            api_key: "key".into(),
            model: "gpt".into(),
            prompt_template: "input={{user_input}} output={{agent_output}}".into(),
            user_input: json!("hello"),
            trajectory: json!([]),
            agent_output: json!({"text": "hi"}),
            reference_output: Value::Null,
            tools: json!([]),
        };
        let rendered = substitute_template(&request.prompt_template, &request);
        assert_eq!(rendered, r#"input=hello output={"text":"hi"}"#);
    }

    #[test]
    fn retryable_statuses_match_documented_set() {
        assert!(is_retryable(&http_error(429)));
        assert!(is_retryable(&http_error(503)));
        assert!(!is_retryable(&http_error(404)));
    }
}
