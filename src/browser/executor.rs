//! In-page request execution
//!
//! Runs caller-described HTTP requests inside a session's page so the
//! site's signing script decorates them exactly as it would for a real
//! visitor. Executions against one session are serialized on the
//! session's mutex; different sessions proceed in parallel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::browser::session::short;
use crate::browser::{BrowserSession, RelayError};
use crate::config::RelayConfig;

/// Caller-supplied description of one upstream request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct RequestExecutor;

impl RequestExecutor {
    /// Performs `spec` inside the session page and returns the parsed JSON
    /// response. Waits for any execution already running on this session.
    /// Failures propagate without retrying and without touching the
    /// session's lifetime.
    pub async fn execute(
        session: &BrowserSession,
        spec: &RequestSpec,
        config: &RelayConfig,
    ) -> Result<Value, RelayError> {
        Self::validate_url(&spec.url)?;
        let expression = Self::fetch_expression(spec)?;

        let _guard = session.serialize_guard().lock().await;
        debug!(
            "Executing {} {} on session {}",
            spec.method,
            spec.url,
            short(session.id())
        );
        match tokio::time::timeout(config.request_timeout(), session.page().evaluate(&expression))
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RelayError::RequestFailed(message))) => {
                Err(RelayError::RequestFailed(message))
            }
            Ok(Err(other)) => Err(RelayError::RequestFailed(other.to_string())),
            Err(_) => Err(RelayError::RequestFailed(format!(
                "request timed out after {:?}",
                config.request_timeout()
            ))),
        }
    }

    fn validate_url(raw: &str) -> Result<(), RelayError> {
        let parsed = Url::parse(raw)
            .map_err(|e| RelayError::RequestFailed(format!("invalid url {raw}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(RelayError::RequestFailed(format!(
                "unsupported url scheme: {other}"
            ))),
        }
    }

    /// Builds the async expression evaluated in the page. The request
    /// rides in as one JSON literal; the page's own fetch carries cookies
    /// and lets the signing interceptor do its work.
    fn fetch_expression(spec: &RequestSpec) -> Result<String, RelayError> {
        let payload = serde_json::json!({
            "method": spec.method,
            "url": spec.url,
            "headers": spec.headers,
            "body": spec.body,
        });
        let args = serde_json::to_string(&payload)
            .map_err(|e| RelayError::RequestFailed(format!("unencodable request spec: {e}")))?;
        Ok(format!(
            r#"(async () => {{
    const spec = {args};
    const options = {{
        method: spec.method,
        headers: spec.headers,
        credentials: 'include',
    }};
    if (spec.body !== null && spec.body !== undefined) {{
        options.body = JSON.stringify(spec.body);
    }}
    const response = await fetch(spec.url, options);
    return await response.json();
}})()"#
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn urls_must_be_parseable_http() {
        assert!(RequestExecutor::validate_url("https://jimeng.jianying.com/api/v1").is_ok());
        assert!(RequestExecutor::validate_url("http://localhost:8080/x").is_ok());
        assert!(RequestExecutor::validate_url("ftp://example.com/file").is_err());
        assert!(RequestExecutor::validate_url("not a url at all").is_err());
    }

    #[test]
    fn method_defaults_to_get() {
        let spec: RequestSpec = serde_json::from_value(json!({
            "url": "https://jimeng.jianying.com/api/v1/ping"
        }))
        .unwrap();
        assert_eq!(spec.method, "GET");
        assert!(spec.headers.is_empty());
        assert!(spec.body.is_none());
    }

    #[test]
    fn expression_embeds_the_spec_and_includes_credentials() {
        let spec = RequestSpec {
            method: "POST".to_string(),
            url: "https://jimeng.jianying.com/api/generate".to_string(),
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: Some(json!({"prompt": "a red fox"})),
        };
        let expr = RequestExecutor::fetch_expression(&spec).unwrap();
        assert!(expr.contains(r#""method":"POST""#));
        assert!(expr.contains("https://jimeng.jianying.com/api/generate"));
        assert!(expr.contains("credentials: 'include'"));
        assert!(expr.contains("a red fox"));
    }

    #[test]
    fn absent_body_rides_as_null() {
        let spec = RequestSpec {
            method: "GET".to_string(),
            url: "https://jimeng.jianying.com/api/v1/ping".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        let expr = RequestExecutor::fetch_expression(&spec).unwrap();
        assert!(expr.contains(r#""body":null"#));
    }
}
