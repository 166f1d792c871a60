//! Rule matching and response execution for the mock sidecar's `mock_config`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::Command;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MockConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rule {
    pub method: String,
    /// A glob pattern matched against the request path (`*` and `**` only).
    pub path: String,
    #[serde(default)]
    pub query_contains: Option<String>,
    #[serde(default)]
    pub body_contains: Option<String>,
    pub response: ResponseSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResponseSpec {
    Json { status: u16, #[serde(default)] headers: std::collections::HashMap<String, String>, body: serde_json::Value },
    Text { status: u16, #[serde(default)] headers: std::collections::HashMap<String, String>, body: String },
    Python { status: u16, #[serde(default)] headers: std::collections::HashMap<String, String>, script: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: std::collections::HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct PythonResponse {
    status: u16,
    #[serde(default)]
    headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    json: Option<serde_json::Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    let regex_source = format!(
        "^{}$",
        regex::escape(pattern).replace(r"\*\*", ".*").replace(r"\*", "[^/]*")
    );
    regex::Regex::new(&regex_source).map(|re| re.is_match(path)).unwrap_or(false)
}

impl Rule {
    pub fn matches(&self, request: &MockRequest) -> bool {
        if !self.method.eq_ignore_ascii_case(&request.method) {
            return false;
        }
        if !glob_matches(&self.path, &request.path) {
            return false;
        }
        if let Some(needle) = &self.query_contains {
            if !request.query.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.body_contains {
            if !request.body.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// First-match-wins over the ordered rule list.
pub fn first_match<'a>(rules: &'a [Rule], request: &MockRequest) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.matches(request))
}

pub async fn execute_response(spec: &ResponseSpec, request: &MockRequest) -> WorkerResult<MockResponse> {
    match spec {
        ResponseSpec::Json { status, headers, body } => Ok(MockResponse {
            status: *status,
            headers: headers.clone(),
            body: serde_json::to_vec(body).unwrap_or_default(),
        }),
        ResponseSpec::Text { status, headers, body } => {
            Ok(MockResponse { status: *status, headers: headers.clone(), body: body.clone().into_bytes() })
        }
        ResponseSpec::Python { status, headers, script } => {
            execute_python_response(script, request, *status, headers.clone()).await
        }
    }
}

/// Writes `script` to a temp file and runs `python3 <file> <request-json>`,
/// parsing its single-line stdout JSON response. No interpreter state
/// persists across requests — each invocation is a fresh process.
async fn execute_python_response(
    script: &str,
    request: &MockRequest,
    default_status: u16,
    default_headers: std::collections::HashMap<String, String>,
) -> WorkerResult<MockResponse> {
    let mut file = tempfile::Builder::new()
        .suffix(".py")
        .tempfile()
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to create mock script temp file: {e}")))?;
    file.write_all(script.as_bytes())
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to write mock script: {e}")))?;
    file.flush().ok();

    let request_json = serde_json::to_string(request)
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to encode mock request: {e}")))?;
    let path = file.path().to_path_buf();

    let output = tokio::task::spawn_blocking(move || {
        Command::new("python3").arg(&path).arg(&request_json).output()
    })
    .await
    .map_err(|e| WorkerError::Other(anyhow::anyhow!("mock script task join failed: {e}")))?
    .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to spawn python3: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next_back().unwrap_or("").trim();
    if line.is_empty() {
        return Err(WorkerError::Other(anyhow::anyhow!(
            "mock python response produced no output (stderr: {})",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let parsed: PythonResponse = serde_json::from_str(line)
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("mock python response was not valid JSON: {e}")))?;

    let body = if let Some(json) = parsed.json {
        serde_json::to_vec(&json).unwrap_or_default()
    } else if let Some(text) = parsed.text {
        text.into_bytes()
    } else if let Some(encoded) = parsed.body_base64 {
        BASE64
            .decode(encoded)
            .map_err(|e| WorkerError::Other(anyhow::anyhow!("invalid body_base64: {e}")))?
    } else {
        Vec::new()
    };

    let headers = if parsed.headers.is_empty() { default_headers } else { parsed.headers };
    let status = if parsed.status == 0 { default_status } else { parsed.status };
    Ok(MockResponse { status, headers, body })
}

/// Canonical-JSON signature (sorted keys, no insignificant whitespace) used
/// to reference-count sidecars across cases requesting identical configs.
pub fn canonical_signature(config: &MockConfig) -> WorkerResult<String> {
    let value = serde_json::to_value(config)
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to serialize mock_config: {e}")))?;
    Ok(canonicalize(&value))
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(map.get(k.as_str()).unwrap())))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        serde_json::Value::Array(items) => {
            format!("[{}]", items.iter().map(canonicalize).collect::<Vec<_>>().join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_rule(method: &str, path: &str) -> Rule {
        Rule {
            method: method.to_string(),
            path: path.to_string(),
            query_contains: None,
            body_contains: None,
            response: ResponseSpec::Json {
                status: 200,
                headers: Default::default(),
                body: serde_json::json!({"ok": true}),
            },
        }
    }

    fn request(method: &str, path: &str) -> MockRequest {
        MockRequest { method: method.to_string(), path: path.to_string(), query: String::new(), body: String::new() }
    }

    #[test]
    fn glob_star_matches_single_segment() {
        assert!(glob_matches("/v1/*/tools", "/v1/abc/tools"));
        assert!(!glob_matches("/v1/*/tools", "/v1/abc/def/tools"));
    }

    #[test]
    fn glob_double_star_matches_multiple_segments() {
        assert!(glob_matches("/v1/**", "/v1/abc/def/tools"));
    }

    #[test]
    fn first_match_wins_is_order_preserving() {
        let rules = vec![json_rule("GET", "/health"), json_rule("GET", "/**")];
        let matched = first_match(&rules, &request("GET", "/health")).unwrap();
        assert_eq!(matched.path, "/health");
    }

    #[test]
    fn canonical_signature_sorts_object_keys() {
        let a = MockConfig { rules: vec![], passthrough: true };
        let sig = canonical_signature(&a).unwrap();
        assert!(sig.contains(r#""passthrough":true"#));
        assert!(!sig.contains(' '));
    }
}
