//! Streamed chat completions.
//!
//! [`StreamAggregator`] folds provider fragments into a final summary while
//! turning each one into a public `chat.completion.chunk`. [`relay_stream`]
//! drives it on its own task and forwards the chunks over a bounded channel
//! to the SSE response.

use crate::error::{AppError, GatewayError};
use crate::normalize::request_input_text;
use crate::provider::ModelProvider;
use crate::schema::{
    CanonicalRequest, FunctionCall, FunctionCallDelta, ResponseFragment, ToolCall, ToolCallDelta,
    Usage,
};
use crate::tokens::estimate_tokens;
use crate::tracker::RequestTracker;
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::response::sse::Event;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Completed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    #[error("stream already finished as {0:?}")]
    AlreadyFinished(StreamState),
}

#[derive(Debug, Clone, PartialEq)]
struct AccumulatedToolCall {
    id: String,
    /// Made up locally until the provider sends a real id.
    synthetic_id: bool,
    call_type: String,
    function_name: String,
    arguments: String,
    finalized: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AccumulatedFunctionCall {
    name: String,
    arguments: String,
    finalized: bool,
}

/// Final view of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub id: String,
    pub model: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub fragment_count: usize,
    pub usage: Usage,
    pub usage_estimated: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

pub struct StreamAggregator {
    state: StreamState,
    id: String,
    model: String,
    created: i64,
    content: String,
    finish_reason: Option<String>,
    fragment_count: usize,
    tool_calls: Vec<AccumulatedToolCall>,
    calls_by_id: HashMap<String, usize>,
    calls_by_index: HashMap<u32, usize>,
    function_call: Option<AccumulatedFunctionCall>,
    usage: Option<Usage>,
}

impl StreamAggregator {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::Idle,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            content: String::new(),
            finish_reason: None,
            fragment_count: 0,
            tool_calls: Vec::new(),
            calls_by_id: HashMap::new(),
            calls_by_index: HashMap::new(),
            function_call: None,
            usage: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn ensure_open(&self) -> Result<(), AggregatorError> {
        match self.state {
            StreamState::Completed | StreamState::Errored => {
                Err(AggregatorError::AlreadyFinished(self.state))
            }
            StreamState::Idle | StreamState::Streaming => Ok(()),
        }
    }

    /// Folds one fragment in and returns the chunk to send to the client.
    pub fn ingest(&mut self, fragment: ResponseFragment) -> Result<Value, AggregatorError> {
        self.ensure_open()?;
        if self.state == StreamState::Idle && !fragment.id.is_empty() {
            self.id = fragment.id.clone();
        }
        self.state = StreamState::Streaming;
        self.fragment_count += 1;
        if !fragment.model.is_empty() {
            self.model = fragment.model.clone();
        }

        let mut delta = Map::new();
        if let Some(role) = &fragment.delta.role {
            delta.insert("role".to_string(), Value::String(role.clone()));
        }
        if let Some(content) = &fragment.delta.content {
            self.content.push_str(content);
            delta.insert("content".to_string(), Value::String(content.clone()));
        }
        if !fragment.delta.tool_calls.is_empty() {
            let projected: Vec<Value> = fragment
                .delta
                .tool_calls
                .iter()
                .map(|call| {
                    let slot = self.apply_tool_delta(call);
                    let mut public = call.clone();
                    public.index = Some(call.index.unwrap_or(slot as u32));
                    public.id = Some(self.tool_calls[slot].id.clone());
                    public.to_value()
                })
                .collect();
            delta.insert("tool_calls".to_string(), Value::Array(projected));
        }
        if let Some(fc) = &fragment.delta.function_call {
            self.apply_function_delta(fc);
            let mut public = Map::new();
            if let Some(name) = &fc.name {
                public.insert("name".to_string(), Value::String(name.clone()));
            }
            if let Some(arguments) = &fc.arguments {
                public.insert("arguments".to_string(), Value::String(arguments.clone()));
            }
            delta.insert("function_call".to_string(), Value::Object(public));
        }

        if let Some(reason) = fragment.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            self.finish_reason = Some(reason.to_string());
            self.finalize_calls();
        }
        if let Some(usage) = fragment.usage {
            self.usage = Some(usage);
        }

        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": fragment.index,
                "delta": Value::Object(delta),
                "finish_reason": fragment.finish_reason,
            }]
        });
        if let Some(usage) = fragment.usage {
            chunk["usage"] = json!(usage);
        }
        Ok(chunk)
    }

    fn apply_tool_delta(&mut self, delta: &ToolCallDelta) -> usize {
        let id = delta.id.as_deref().filter(|id| !id.is_empty());
        let by_index = delta.index.and_then(|i| self.calls_by_index.get(&i).copied());
        let existing = match id {
            Some(id) => self.calls_by_id.get(id).copied().or_else(|| {
                // The real id may arrive after an id-less first delta.
                by_index.filter(|slot| self.tool_calls[*slot].synthetic_id)
            }),
            // Providers send the id once; later deltas refer back by index.
            None => by_index,
        };
        let slot = match existing {
            Some(slot) => {
                if let Some(id) = id {
                    let call = &mut self.tool_calls[slot];
                    if call.synthetic_id {
                        call.id = id.to_string();
                        call.synthetic_id = false;
                        self.calls_by_id.insert(id.to_string(), slot);
                    }
                }
                slot
            }
            None => {
                let slot = self.tool_calls.len();
                let synthetic_id = id.is_none();
                let id = id
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("call_{}", delta.index.unwrap_or(slot as u32)));
                self.calls_by_id.insert(id.clone(), slot);
                self.tool_calls.push(AccumulatedToolCall {
                    id,
                    synthetic_id,
                    call_type: "function".to_string(),
                    function_name: String::new(),
                    arguments: String::new(),
                    finalized: false,
                });
                slot
            }
        };
        if let Some(index) = delta.index {
            self.calls_by_index.insert(index, slot);
        }

        let call = &mut self.tool_calls[slot];
        if call.finalized {
            tracing::warn!(call_id = %call.id, "delta for finalized tool call ignored");
            return slot;
        }
        if let Some(call_type) = delta.call_type.as_deref().filter(|t| !t.is_empty()) {
            call.call_type = call_type.to_string();
        }
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            call.function_name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            call.arguments.push_str(arguments);
        }
        slot
    }

    fn apply_function_delta(&mut self, delta: &FunctionCallDelta) {
        let call = self.function_call.get_or_insert_with(Default::default);
        if call.finalized {
            tracing::warn!("delta for finalized function call ignored");
            return;
        }
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            call.name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            call.arguments.push_str(arguments);
        }
    }

    fn finalize_calls(&mut self) {
        for call in &mut self.tool_calls {
            call.finalized = true;
        }
        if let Some(call) = &mut self.function_call {
            call.finalized = true;
        }
    }

    /// Completes the stream. Usage the provider never reported is estimated
    /// from `prompt_text` and the accumulated content.
    pub fn finish(&mut self, prompt_text: &str) -> Result<StreamSummary, AggregatorError> {
        self.ensure_open()?;
        self.state = StreamState::Completed;
        self.finalize_calls();

        let (usage, usage_estimated) = match self.usage {
            Some(usage) if usage.total_tokens > 0 => (usage, false),
            _ => (
                Usage::new(estimate_tokens(prompt_text), estimate_tokens(&self.content)),
                true,
            ),
        };
        Ok(StreamSummary {
            id: self.id.clone(),
            model: self.model.clone(),
            content: self.content.clone(),
            finish_reason: self.finish_reason.clone(),
            fragment_count: self.fragment_count,
            usage,
            usage_estimated,
            tool_calls: self
                .tool_calls
                .iter()
                .map(|call| ToolCall {
                    id: call.id.clone(),
                    call_type: call.call_type.clone(),
                    function: FunctionCall {
                        name: call.function_name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
            function_call: self.function_call.as_ref().map(|call| FunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            }),
        })
    }

    pub fn fail(&mut self) -> Result<(), AggregatorError> {
        self.ensure_open()?;
        self.state = StreamState::Errored;
        Ok(())
    }
}

enum RelayFailure {
    Downstream(UpstreamCallError),
    ClientGone,
}

impl RelayFailure {
    fn message(&self) -> String {
        match self {
            RelayFailure::Downstream(err) => err.message.clone(),
            RelayFailure::ClientGone => "client disconnected".to_string(),
        }
    }
}

/// Runs one streamed completion to its end: opens the provider stream,
/// forwards every chunk, and finalizes the tracker exactly once. Waiting on
/// the provider is bounded by `idle_timeout` per step.
pub async fn relay_stream(
    provider: Arc<dyn ModelProvider>,
    request: CanonicalRequest,
    tracker: RequestTracker,
    idle_timeout: Duration,
    tx: mpsc::Sender<Event>,
) {
    let mut aggregator = StreamAggregator::new(&request.model);
    match pump(&*provider, &request, &mut aggregator, idle_timeout, &tx).await {
        Ok(()) => {
            let summary = match aggregator.finish(&request_input_text(&request)) {
                Ok(summary) => summary,
                Err(err) => {
                    tracing::error!(request_id = %tracker.request_id(), "{err}");
                    tracker.fail(&err.to_string(), "stream_completion");
                    return;
                }
            };
            if summary.usage_estimated {
                tracing::debug!(request_id = %tracker.request_id(), "stream usage estimated");
            }
            let _ = tx.send(Event::default().data("[DONE]")).await;
            let response = serde_json::to_value(&summary).unwrap_or(Value::Null);
            tracker.succeed(summary.usage, response);
        }
        Err(failure) => {
            if let Err(err) = aggregator.fail() {
                tracing::error!(request_id = %tracker.request_id(), "{err}");
            }
            let message = failure.message();
            tracing::warn!(request_id = %tracker.request_id(), "stream failed: {message}");
            tracker.fail(&message, "stream_completion");
            if let RelayFailure::Downstream(err) = failure {
                let app: AppError = GatewayError::Stream(err).into();
                let _ = tx.send(Event::default().data(app.to_json().to_string())).await;
                let _ = tx.send(Event::default().data("[DONE]")).await;
            }
        }
    }
}

async fn pump(
    provider: &dyn ModelProvider,
    request: &CanonicalRequest,
    aggregator: &mut StreamAggregator,
    idle_timeout: Duration,
    tx: &mpsc::Sender<Event>,
) -> Result<(), RelayFailure> {
    let opened = tokio::select! {
        _ = tx.closed() => return Err(RelayFailure::ClientGone),
        opened = tokio::time::timeout(idle_timeout, provider.chat_stream(request)) => opened,
    };
    let mut fragments = opened
        .map_err(|_| RelayFailure::Downstream(UpstreamCallError::timeout(idle_timeout)))?
        .map_err(RelayFailure::Downstream)?;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Err(RelayFailure::ClientGone),
            next = tokio::time::timeout(idle_timeout, fragments.next()) => next,
        };
        let fragment = match next {
            Err(_) => {
                return Err(RelayFailure::Downstream(UpstreamCallError::timeout(
                    idle_timeout,
                )));
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(err))) => return Err(RelayFailure::Downstream(err)),
            Ok(Some(Ok(fragment))) => fragment,
        };
        let chunk = aggregator.ingest(fragment).map_err(|err| {
            RelayFailure::Downstream(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                None,
                err.to_string(),
            ))
        })?;
        if tx.send(Event::default().data(chunk.to_string())).await.is_err() {
            return Err(RelayFailure::ClientGone);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FragmentDelta;

    fn text(content: &str) -> ResponseFragment {
        ResponseFragment {
            id: "chatcmpl-up".to_string(),
            model: "m".to_string(),
            delta: FragmentDelta {
                content: Some(content.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tool_delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ResponseFragment {
        ResponseFragment {
            delta: FragmentDelta {
                tool_calls: vec![ToolCallDelta {
                    index: Some(index),
                    id: id.map(|s| s.to_string()),
                    call_type: id.map(|_| "function".to_string()),
                    name: name.map(|s| s.to_string()),
                    arguments: Some(args.to_string()),
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn finish(reason: &str) -> ResponseFragment {
        ResponseFragment {
            finish_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn content_accumulates_and_chunks_mirror_fragments() {
        let mut agg = StreamAggregator::new("m");
        let chunk = agg.ingest(text("Hel")).expect("chunk");
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["id"], "chatcmpl-up");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hel");
        agg.ingest(text("lo")).expect("chunk");
        agg.ingest(finish("stop")).expect("chunk");
        let summary = agg.finish("hi").expect("summary");
        assert_eq!(summary.content, "Hello");
        assert_eq!(summary.finish_reason.as_deref(), Some("stop"));
        assert_eq!(summary.fragment_count, 3);
        assert!(summary.usage_estimated);
        assert_eq!(summary.usage, Usage::new(1, 1));
    }

    #[test]
    fn tool_arguments_reassemble_for_every_split() {
        let arguments = r#"{"query":"Beyond","limit":5}"#;
        for pieces in 1..=arguments.len() {
            let mut agg = StreamAggregator::new("m");
            let step = arguments.len().div_ceil(pieces);
            let chars: Vec<char> = arguments.chars().collect();
            for (i, part) in chars.chunks(step).enumerate() {
                let part: String = part.iter().collect();
                let fragment = if i == 0 {
                    tool_delta(0, Some("call_1"), Some("search_songs"), &part)
                } else {
                    tool_delta(0, None, None, &part)
                };
                agg.ingest(fragment).expect("chunk");
            }
            agg.ingest(finish("tool_calls")).expect("chunk");
            let summary = agg.finish("").expect("summary");
            assert_eq!(summary.tool_calls.len(), 1, "split into {pieces}");
            assert_eq!(summary.tool_calls[0].id, "call_1");
            assert_eq!(summary.tool_calls[0].function.name, "search_songs");
            assert_eq!(summary.tool_calls[0].function.arguments, arguments);
        }
    }

    #[test]
    fn parallel_tool_calls_keep_first_seen_order() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(tool_delta(0, Some("a"), Some("first"), "{")).expect("chunk");
        agg.ingest(tool_delta(1, Some("b"), Some("second"), "{")).expect("chunk");
        agg.ingest(tool_delta(1, None, None, "}")).expect("chunk");
        agg.ingest(tool_delta(0, None, Some(""), "}")).expect("chunk");
        let summary = agg.finish("").expect("summary");
        let names: Vec<&str> = summary
            .tool_calls
            .iter()
            .map(|c| c.function.name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(summary.tool_calls.iter().all(|c| c.function.arguments == "{}"));
    }

    #[test]
    fn id_less_first_delta_gets_stable_id_in_chunks() {
        let mut agg = StreamAggregator::new("m");
        let chunk = agg.ingest(tool_delta(2, None, Some("f"), "{}")).expect("chunk");
        assert_eq!(chunk["choices"][0]["delta"]["tool_calls"][0]["id"], "call_2");
        assert_eq!(chunk["choices"][0]["delta"]["tool_calls"][0]["index"], 2);
    }

    #[test]
    fn late_real_id_is_adopted_by_the_index_slot() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(tool_delta(0, None, Some("get_weather"), "{\"city\":"))
            .expect("chunk");
        let chunk = agg
            .ingest(tool_delta(0, Some("call_real"), None, "\"Paris\"}"))
            .expect("chunk");
        assert_eq!(chunk["choices"][0]["delta"]["tool_calls"][0]["id"], "call_real");
        let summary = agg.finish("").expect("summary");
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(summary.tool_calls[0].id, "call_real");
        assert_eq!(summary.tool_calls[0].function.name, "get_weather");
        assert_eq!(summary.tool_calls[0].function.arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn distinct_real_ids_on_one_index_stay_separate() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(tool_delta(0, Some("a"), Some("f"), "{}")).expect("chunk");
        agg.ingest(tool_delta(0, Some("b"), Some("g"), "{}")).expect("chunk");
        let summary = agg.finish("").expect("summary");
        let ids: Vec<&str> = summary.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn empty_finish_reason_keeps_calls_open() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(tool_delta(0, Some("a"), Some("f"), "{\"x\":")).expect("chunk");
        agg.ingest(finish("")).expect("chunk");
        agg.ingest(tool_delta(0, None, None, "1}")).expect("chunk");
        agg.ingest(finish("tool_calls")).expect("chunk");
        let summary = agg.finish("").expect("summary");
        assert_eq!(summary.tool_calls[0].function.arguments, "{\"x\":1}");
        assert_eq!(summary.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn finalized_calls_ignore_late_deltas() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(tool_delta(0, Some("a"), Some("f"), "{}")).expect("chunk");
        agg.ingest(finish("tool_calls")).expect("chunk");
        agg.ingest(tool_delta(0, None, Some("renamed"), "junk")).expect("chunk");
        let summary = agg.finish("").expect("summary");
        assert_eq!(summary.tool_calls[0].function.name, "f");
        assert_eq!(summary.tool_calls[0].function.arguments, "{}");
    }

    #[test]
    fn legacy_function_call_name_only_overwritten_when_non_empty() {
        let mut agg = StreamAggregator::new("m");
        for (name, args) in [(Some("get_weather"), "{\"city\""), (Some(""), ":\"Paris\"}"), (None, "")] {
            let fragment = ResponseFragment {
                delta: FragmentDelta {
                    function_call: Some(FunctionCallDelta {
                        name: name.map(|s| s.to_string()),
                        arguments: Some(args.to_string()),
                    }),
                    ..Default::default()
                },
                ..Default::default()
            };
            let chunk = agg.ingest(fragment).expect("chunk");
            assert!(chunk["choices"][0]["delta"]["function_call"].is_object());
        }
        let summary = agg.finish("").expect("summary");
        let call = summary.function_call.expect("function call");
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn reported_usage_is_kept_and_forwarded() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(text("x")).expect("chunk");
        let chunk = agg
            .ingest(ResponseFragment {
                usage: Some(Usage::new(7, 2)),
                ..Default::default()
            })
            .expect("chunk");
        assert_eq!(chunk["usage"]["total_tokens"], 9);
        let summary = agg.finish("ignored").expect("summary");
        assert!(!summary.usage_estimated);
        assert_eq!(summary.usage.total_tokens, 9);
    }

    #[test]
    fn last_finish_reason_wins() {
        let mut agg = StreamAggregator::new("m");
        agg.ingest(finish("length")).expect("chunk");
        agg.ingest(text("")).expect("chunk");
        agg.ingest(finish("stop")).expect("chunk");
        assert_eq!(agg.finish("").expect("summary").finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn terminal_states_are_exclusive() {
        let mut agg = StreamAggregator::new("m");
        assert_eq!(agg.state(), StreamState::Idle);
        agg.ingest(text("a")).expect("chunk");
        assert_eq!(agg.state(), StreamState::Streaming);
        agg.fail().expect("first terminal");
        assert_eq!(agg.state(), StreamState::Errored);
        assert_eq!(
            agg.finish(""),
            Err(AggregatorError::AlreadyFinished(StreamState::Errored))
        );
        assert!(agg.ingest(text("b")).is_err());
        assert!(agg.fail().is_err());
    }
}
