use crate::app::{AppState, SERVICE_NAME, SERVICE_VERSION};
use crate::error::{AppError, AppResult, GatewayError};
use crate::metrics::{RequestDescriptor, RequestType};
use crate::normalize::{
    normalize_chat_request, normalize_embedding_request, parse_invocations, request_input_text,
};
use crate::schema::{CanonicalRequest, ChatCompletion, Usage, write_invocations};
use crate::stream::{STREAM_CHANNEL_CAPACITY, relay_stream};
use crate::tokens::estimate_tokens;
use crate::tracker::RequestTracker;
use crate::upstream::UpstreamCallError;
use axum::Json;
use axum::extract::{FromRequest, FromRequestParts, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const USER_ID_PREFIX_LEN: usize = 16;
const DEFAULT_TREND_HOURS: u32 = 24;
const MAX_TREND_HOURS: u32 = 168;
const DEFAULT_RECENT_LIMIT: usize = 100;
const MAX_RECENT_LIMIT: usize = 1000;

/// `Json` whose rejections render as the standard error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// `Query` whose rejections render as the standard error envelope.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

pub async fn root() -> impl IntoResponse {
    Json(service_status("running", "OpenAI-compatible LLM gateway"))
}

pub async fn health() -> impl IntoResponse {
    Json(service_status("healthy", "all systems operational"))
}

fn service_status(status: &str, description: &str) -> Value {
    json!({
        "service": SERVICE_NAME,
        "status": status,
        "version": SERVICE_VERSION,
        "description": description,
        "timestamp": chrono::Utc::now().timestamp(),
    })
}

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .runtime
        .models
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": SERVICE_NAME
            })
        })
        .collect();
    tracing::debug!(count = data.len(), "listing models");
    Json(json!({ "object": "list", "data": data }))
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<HashMap<String, String>>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<Value>,
) -> AppResult<Response> {
    let req = normalize_chat_request(&body, state.runtime.unknown_fields)?;
    let request_id = new_request_id();
    let correlation_id = extract_correlation_id(&headers);
    let user_id = extract_user_id(&headers, &params).or_else(|| req.sampling.user.clone());
    tracing::info!(
        request_id = %request_id,
        correlation_id = correlation_id.as_deref().unwrap_or("-"),
        model = %req.model,
        stream = req.stream,
        user = user_id.as_deref().unwrap_or("anonymous"),
        messages = req.messages.len(),
        legacy_functions = req.legacy_functions_mapped,
        "chat completion"
    );

    let tracker = RequestTracker::begin(
        &state.metrics,
        &state.interactions,
        RequestDescriptor {
            request_id,
            correlation_id,
            model: req.model.clone(),
            user_id,
            stream: req.stream,
            request_type: RequestType::Chat,
        },
        state.provider.name(),
        req.downstream_payload(),
    );

    if req.stream {
        let (tx, rx) = mpsc::channel::<Event>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(relay_stream(
            state.provider.clone(),
            req,
            tracker,
            state.runtime.request_timeout,
            tx,
        ));
        let events = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
        return Ok(Sse::new(events).into_response());
    }

    let timeout = state.runtime.request_timeout;
    let completion = match call_with_timeout(timeout, state.provider.chat(&req)).await {
        Ok(completion) => completion,
        Err(err) => {
            tracker.fail(&err.message, "non_stream_completion");
            return Err(GatewayError::Downstream(err).into());
        }
    };
    let (response, usage, estimated) = build_chat_response(&req, completion);
    if estimated {
        tracing::debug!(request_id = %tracker.request_id(), "provider omitted usage; estimated");
    }
    tracker.succeed(usage, response.clone());
    Ok(Json(response).into_response())
}

pub async fn create_embeddings(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<HashMap<String, String>>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<Value>,
) -> AppResult<Response> {
    let req = normalize_embedding_request(&body)?;
    let request_id = new_request_id();
    let correlation_id = extract_correlation_id(&headers);
    let user_id = extract_user_id(&headers, &params).or_else(|| req.user.clone());
    tracing::info!(
        request_id = %request_id,
        correlation_id = correlation_id.as_deref().unwrap_or("-"),
        model = %req.model,
        decoded_with = req.decoded_with.unwrap_or("none"),
        "embeddings"
    );

    let payload = serde_json::to_value(&req)
        .map_err(|err| GatewayError::Internal(format!("encode embedding request: {err}")))?;
    let tracker = RequestTracker::begin(
        &state.metrics,
        &state.interactions,
        RequestDescriptor {
            request_id,
            correlation_id,
            model: req.model.clone(),
            user_id,
            stream: false,
            request_type: RequestType::Embedding,
        },
        state.provider.name(),
        payload,
    );

    let timeout = state.runtime.request_timeout;
    let response = match call_with_timeout(timeout, state.provider.embeddings(&req)).await {
        Ok(response) => response,
        Err(err) => {
            tracker.fail(&err.message, "embedding");
            return Err(GatewayError::Downstream(err).into());
        }
    };
    let usage = response
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        .map(Usage::normalized)
        .filter(|u| u.total_tokens > 0)
        .unwrap_or_else(|| Usage::new(estimate_tokens(&req.input.joined_text()), 0));
    tracker.succeed(usage, response.clone());
    Ok(Json(response).into_response())
}

async fn call_with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, UpstreamCallError>>,
) -> Result<T, UpstreamCallError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(UpstreamCallError::timeout(timeout)))
}

/// Shapes a provider completion into the public response. Tool calls in the
/// answer go through the same normalization as inbound ones. Returns the body,
/// the usage to record and whether that usage was estimated.
fn build_chat_response(req: &CanonicalRequest, completion: ChatCompletion) -> (Value, Usage, bool) {
    let mut completion_text = String::new();
    let choices: Vec<Value> = completion
        .choices
        .into_iter()
        .map(|choice| {
            let message = choice.message;
            let mut obj = Map::new();
            obj.insert(
                "role".to_string(),
                Value::String(message.role.unwrap_or_else(|| "assistant".to_string())),
            );
            let calls =
                parse_invocations(message.tool_calls.as_ref(), message.function_call.as_ref());
            let has_calls = match &calls {
                Ok(calls) => !calls.is_empty(),
                Err(_) => message.tool_calls.is_some() || message.function_call.is_some(),
            };
            let content = match message.content {
                Some(Value::Null) | None if has_calls => Value::Null,
                Some(Value::Null) | None => Value::String(String::new()),
                Some(content) => content,
            };
            if let Some(text) = content.as_str() {
                completion_text.push_str(text);
            }
            obj.insert("content".to_string(), content);
            match calls {
                Ok(calls) => write_invocations(&mut obj, &calls),
                Err(err) => {
                    tracing::warn!("passing through unparsable tool calls: {err}");
                    if let Some(raw) = message.tool_calls {
                        obj.insert("tool_calls".to_string(), raw);
                    }
                    if let Some(raw) = message.function_call {
                        obj.insert("function_call".to_string(), raw);
                    }
                }
            }
            json!({
                "index": choice.index,
                "message": Value::Object(obj),
                "finish_reason": choice.finish_reason,
            })
        })
        .collect();

    let (usage, estimated) = match completion.usage.map(Usage::normalized) {
        Some(usage) if usage.total_tokens > 0 => (usage, false),
        _ => (
            Usage::new(
                estimate_tokens(&request_input_text(req)),
                estimate_tokens(&completion_text),
            ),
            true,
        ),
    };

    let id = if completion.id.is_empty() {
        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
    } else {
        completion.id
    };
    let model = if completion.model.is_empty() {
        req.model.clone()
    } else {
        completion.model
    };
    let body = json!({
        "id": id,
        "object": "chat.completion",
        "created": completion.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        "model": model,
        "choices": choices,
        "usage": usage,
    });
    (body, usage, estimated)
}

pub async fn current_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.current_stats())
}

pub async fn model_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.model_stats())
}

#[derive(Debug, Deserialize)]
pub struct TrendsQuery {
    hours: Option<i64>,
}

pub async fn metric_trends(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<TrendsQuery>,
) -> impl IntoResponse {
    let hours = query
        .hours
        .map(|h| h.clamp(1, MAX_TREND_HOURS as i64) as u32)
        .unwrap_or(DEFAULT_TREND_HOURS);
    Json(state.metrics.hourly_trends(hours))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    limit: Option<i64>,
}

pub async fn recent_requests(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<RecentQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_RECENT_LIMIT as i64) as usize)
        .unwrap_or(DEFAULT_RECENT_LIMIT);
    Json(json!({ "object": "list", "data": state.metrics.recent(limit) }))
}

pub async fn reset_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.reset();
    Json(json!({
        "message": "metrics reset",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

/// Keys the metrics and interaction entries. Caller-supplied ids can repeat,
/// so the gateway always mints its own.
fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

fn extract_correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Attribution only; nothing here is verified.
fn extract_user_id(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| token.chars().take(USER_ID_PREFIX_LEN).collect::<String>());
    bearer
        .or_else(|| {
            headers
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.to_string())
        })
        .or_else(|| params.get("user_id").filter(|v| !v.is_empty()).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnknownFieldPolicy;
    use crate::schema::{CompletionChoice, ResponseMessage};
    use axum::http::HeaderValue;

    #[test]
    fn user_id_prefers_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-abcdefghijklmnopqrstuvwxyz"),
        );
        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        let params = HashMap::from([("user_id".to_string(), "bob".to_string())]);
        assert_eq!(
            extract_user_id(&headers, &params).as_deref(),
            Some("sk-abcdefghijklm")
        );
        headers.remove(AUTHORIZATION);
        assert_eq!(extract_user_id(&headers, &params).as_deref(), Some("alice"));
        headers.remove("x-user-id");
        assert_eq!(extract_user_id(&headers, &params).as_deref(), Some("bob"));
        assert_eq!(extract_user_id(&headers, &HashMap::new()), None);
    }

    #[test]
    fn response_tool_calls_are_normalized_and_content_kept_null() {
        let req = normalize_chat_request(
            &json!({"model": "m", "messages": [{"role": "user", "content": "weather?"}]}),
            UnknownFieldPolicy::Preserve,
        )
        .expect("request");
        let completion = ChatCompletion {
            id: "chatcmpl-1".to_string(),
            model: "m".to_string(),
            created: Some(1),
            choices: vec![CompletionChoice {
                index: 0,
                message: ResponseMessage {
                    role: Some("assistant".to_string()),
                    content: None,
                    tool_calls: Some(json!([{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": {"city": "Paris"}}
                    }])),
                    function_call: None,
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };
        let (body, usage, estimated) = build_chat_response(&req, completion);
        let message = &body["choices"][0]["message"];
        assert!(message["content"].is_null());
        assert_eq!(message["tool_calls"][0]["function"]["arguments"], "{\"city\":\"Paris\"}");
        assert!(estimated);
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(body["usage"]["total_tokens"], usage.total_tokens);
    }
}
