use crate::config::{UpstreamAuthConfig, UpstreamAuthType, UpstreamConfig};
use crate::provider::{FragmentStream, ModelProvider};
use crate::schema::{CanonicalRequest, ChatCompletion, EmbeddingRequest, ResponseFragment};
use async_trait::async_trait;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Timeout,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            UpstreamErrorKind::Timeout,
            None,
            format!("downstream call timed out after {}s", after.as_secs_f64()),
        )
    }

    fn from_reqwest(err: reqwest::Error, status: Option<StatusCode>) -> Self {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Network
        };
        Self::new(kind, status, err.to_string())
    }
}

/// OpenAI-compatible HTTP upstream.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    config: UpstreamConfig,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, config: UpstreamConfig, timeout: Duration) -> Self {
        Self {
            client,
            config,
            timeout,
        }
    }

    async fn post_raw(
        &self,
        path: &str,
        body: &Value,
        total_timeout: Option<Duration>,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let url = join_url(&self.config.base_url, path);
        let mut req = self.client.post(url).json(body);
        if let Some(timeout) = total_timeout {
            req = req.timeout(timeout);
        }
        if let Some(auth) = &self.config.auth {
            req = apply_auth(req, auth);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| UpstreamCallError::from_reqwest(err, None))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let code = extract_error_code(&text);
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(status),
                format!("upstream status {}: {}", status, text),
            )
            .with_code(code));
        }
        Ok(resp)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, UpstreamCallError> {
        let resp = self.post_raw(path, body, Some(self.timeout)).await?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| UpstreamCallError::from_reqwest(err, Some(status)))?;
        serde_json::from_str(&text).map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
        })
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn chat(&self, req: &CanonicalRequest) -> Result<ChatCompletion, UpstreamCallError> {
        let mut body = req.downstream_payload();
        body["stream"] = Value::Bool(false);
        let value = self.post_json("/v1/chat/completions", &body).await?;
        serde_json::from_value(value).map_err(|err| {
            UpstreamCallError::new(
                UpstreamErrorKind::Http,
                None,
                format!("invalid chat completion: {err}"),
            )
        })
    }

    async fn chat_stream(
        &self,
        req: &CanonicalRequest,
    ) -> Result<FragmentStream, UpstreamCallError> {
        let mut body = req.downstream_payload();
        body["stream"] = Value::Bool(true);
        if let Some(obj) = body.as_object_mut() {
            obj.entry("stream_options")
                .or_insert_with(|| serde_json::json!({ "include_usage": true }));
        }
        // Streams are bounded per fragment by the caller, not as a whole.
        let resp = self.post_raw("/v1/chat/completions", &body, None).await?;
        let events = resp.bytes_stream().eventsource();
        let fragments = events
            .take_while(|ev| {
                let done = matches!(ev, Ok(ev) if ev.data.trim() == "[DONE]");
                futures_util::future::ready(!done)
            })
            .filter_map(|ev| {
                let item = match ev {
                    Err(err) => Some(Err(UpstreamCallError::new(
                        UpstreamErrorKind::Network,
                        None,
                        err.to_string(),
                    ))),
                    Ok(ev) if ev.data.trim().is_empty() => None,
                    Ok(ev) => Some(decode_chunk(&ev.data)),
                };
                futures_util::future::ready(item)
            });
        Ok(Box::pin(fragments))
    }

    async fn embeddings(&self, req: &EmbeddingRequest) -> Result<Value, UpstreamCallError> {
        let body = serde_json::to_value(req).map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Http, None, err.to_string())
        })?;
        self.post_json("/v1/embeddings", &body).await
    }
}

fn decode_chunk(data: &str) -> Result<ResponseFragment, UpstreamCallError> {
    let value: Value = serde_json::from_str(data).map_err(|err| {
        UpstreamCallError::new(
            UpstreamErrorKind::Http,
            None,
            format!("invalid stream chunk: {err}"),
        )
    })?;
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("upstream stream error")
            .to_string();
        let code = err.get("code").and_then(|v| v.as_str()).map(|s| s.to_string());
        return Err(UpstreamCallError::new(UpstreamErrorKind::Http, None, message).with_code(code));
    }
    ResponseFragment::from_openai_chunk(&value)
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Http, None, err))
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &UpstreamAuthConfig) -> reqwest::RequestBuilder {
    match auth.auth_type {
        UpstreamAuthType::Bearer => req.bearer_auth(&auth.value),
        UpstreamAuthType::Header => {
            let header_name = auth
                .header_name
                .clone()
                .unwrap_or_else(|| "x-api-key".to_string());
            req.header(header_name, &auth.value)
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_collapses_duplicate_version_segment() {
        assert_eq!(
            join_url("http://h/v1/", "/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
        assert_eq!(join_url("http://h", "/v1/embeddings"), "http://h/v1/embeddings");
    }

    #[test]
    fn stream_error_chunk_becomes_call_error() {
        let err = decode_chunk(r#"{"error":{"message":"overloaded","code":"busy"}}"#)
            .expect_err("error chunk");
        assert_eq!(err.message, "overloaded");
        assert_eq!(err.code.as_deref(), Some("busy"));
    }

    #[test]
    fn error_code_is_read_from_openai_envelope() {
        assert_eq!(
            extract_error_code(r#"{"error":{"code":"rate_limited"}}"#),
            Some("rate_limited".to_string())
        );
        assert_eq!(extract_error_code("not json"), None);
    }
}
