//! Reqwest-backed [`ActionExecutor`] implementation.

use super::{ActionExecutor, ExecutionOptions, HttpExecutionResult};
use crate::models::workflow_definition::HttpRequestSpec;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
}

impl HttpActionExecutor {
    pub fn new() -> Self {
        // Timeouts are per-request (step.timeoutMs), not per-client.
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(
        &self,
        request: &HttpRequestSpec,
        options: &ExecutionOptions,
    ) -> HttpExecutionResult {
        let started = Instant::now();

        let method = match Method::from_bytes(request.method.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return HttpExecutionResult {
                    network_error: true,
                    error_message: Some(format!("invalid HTTP method: {}", request.method)),
                    duration_ms: elapsed_ms(started),
                    ..Default::default()
                }
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(spec_headers) = &request.headers {
            merge_headers(&mut headers, spec_headers.iter());
        }
        // Engine-injected headers win over rendered spec headers.
        merge_headers(
            &mut headers,
            options.extra_headers.iter().map(|(k, v)| (k, v)),
        );

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .timeout(Duration::from_millis(options.timeout_ms.max(1)));

        if let Some(body) = &request.body {
            match serde_json::to_vec(body) {
                Ok(bytes) => builder = builder.body(bytes),
                Err(e) => {
                    return HttpExecutionResult {
                        network_error: true,
                        error_message: Some(format!("body serialization failed: {e}")),
                        duration_ms: elapsed_ms(started),
                        ..Default::default()
                    }
                }
            }
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let body = match response.text().await {
                    Ok(text) => parse_body(&content_type, text),
                    Err(_) => None,
                };

                debug!(
                    url = %request.url,
                    status = status.as_u16(),
                    ok = status.is_success(),
                    "downstream responded"
                );

                HttpExecutionResult {
                    ok: status.is_success(),
                    status_code: Some(status.as_u16()),
                    body,
                    duration_ms: elapsed_ms(started),
                    timed_out: false,
                    network_error: false,
                    error_message: None,
                }
            }
            Err(error) => {
                let timed_out = error.is_timeout();
                debug!(url = %request.url, timed_out, error = %error, "downstream request failed");
                HttpExecutionResult {
                    ok: false,
                    status_code: None,
                    body: None,
                    duration_ms: elapsed_ms(started),
                    timed_out,
                    network_error: !timed_out,
                    error_message: Some(error.to_string()),
                }
            }
        }
    }
}

fn merge_headers<'a>(
    headers: &mut HeaderMap,
    entries: impl Iterator<Item = (&'a String, &'a String)>,
) {
    for (key, value) in entries {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(_) => continue,
        };
        let value = match HeaderValue::from_str(value) {
            Ok(value) => value,
            Err(_) => continue,
        };
        headers.insert(name, value);
    }
}

fn parse_body(content_type: &str, text: String) -> Option<serde_json::Value> {
    if text.is_empty() {
        return None;
    }
    if content_type.contains("application/json") {
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(_) => Some(serde_json::Value::String(text)),
        }
    } else {
        Some(serde_json::Value::String(text))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }

    fn spec(method: &str, url: String) -> HttpRequestSpec {
        HttpRequestSpec {
            method: method.to_string(),
            url,
            headers: None,
            body: None,
        }
    }

    #[tokio::test]
    async fn classifies_success_and_parses_json() {
        let base = serve(Router::new().route(
            "/ok",
            post(|| async { Json(json!({"charged": true})) }),
        ))
        .await;

        let executor = HttpActionExecutor::new();
        let result = executor
            .execute(
                &spec("POST", format!("{base}/ok")),
                &ExecutionOptions {
                    timeout_ms: 2_000,
                    extra_headers: vec![],
                },
            )
            .await;

        assert!(result.ok);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.body, Some(json!({"charged": true})));
        assert!(!result.timed_out);
        assert!(!result.network_error);
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn non_2xx_is_not_ok_but_not_an_error() {
        let base = serve(Router::new().route(
            "/missing",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, "nope") }),
        ))
        .await;

        let executor = HttpActionExecutor::new();
        let result = executor
            .execute(
                &spec("GET", format!("{base}/missing")),
                &ExecutionOptions {
                    timeout_ms: 2_000,
                    extra_headers: vec![],
                },
            )
            .await;

        assert!(!result.ok);
        assert_eq!(result.status_code, Some(404));
        assert_eq!(result.body, Some(json!("nope")));
        assert!(!result.network_error);
    }

    #[tokio::test]
    async fn timeout_is_flagged() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "late"
            }),
        ))
        .await;

        let executor = HttpActionExecutor::new();
        let result = executor
            .execute(
                &spec("GET", format!("{base}/slow")),
                &ExecutionOptions {
                    timeout_ms: 50,
                    extra_headers: vec![],
                },
            )
            .await;

        assert!(!result.ok);
        assert!(result.timed_out);
        assert!(!result.network_error);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let executor = HttpActionExecutor::new();
        // Port 9 on localhost is the discard port and is expected closed.
        let result = executor
            .execute(
                &spec("GET", "http://127.0.0.1:9/unreachable".to_string()),
                &ExecutionOptions {
                    timeout_ms: 1_000,
                    extra_headers: vec![],
                },
            )
            .await;

        assert!(!result.ok);
        assert!(result.network_error);
        assert!(!result.timed_out);
        assert!(result.status_code.is_none());
    }

    #[tokio::test]
    async fn engine_headers_win_over_spec_headers() {
        let base = serve(Router::new().route(
            "/echo",
            post(|headers: axum::http::HeaderMap| async move {
                let key = headers
                    .get("x-idempotency-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({ "key": key }))
            }),
        ))
        .await;

        let mut spec_headers = std::collections::HashMap::new();
        spec_headers.insert("x-idempotency-key".to_string(), "from-spec".to_string());
        let request = HttpRequestSpec {
            method: "POST".to_string(),
            url: format!("{base}/echo"),
            headers: Some(spec_headers),
            body: Some(json!({})),
        };

        let executor = HttpActionExecutor::new();
        let result = executor
            .execute(
                &request,
                &ExecutionOptions {
                    timeout_ms: 2_000,
                    extra_headers: vec![(
                        "x-idempotency-key".to_string(),
                        "from-engine".to_string(),
                    )],
                },
            )
            .await;

        assert!(result.ok);
        assert_eq!(result.body, Some(json!({"key": "from-engine"})));
    }
}
