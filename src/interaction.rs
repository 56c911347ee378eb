//! Per-request audit trail of what was sent downstream and what came back.
//!
//! An entry is opened when a request is dispatched and closed exactly once,
//! at which point one structured record goes to the configured sink and the
//! live entry is dropped. Entries that are never closed are swept after a TTL.

use chrono::{DateTime, Local};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const INTERACTION_TARGET: &str = "llm_interaction";

const VECTOR_KEEP: usize = 3;
const BASE64_KEEP: usize = 10;
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Pending,
    Success,
    Error,
    Abandoned,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionStatus::Pending => "pending",
            InteractionStatus::Success => "success",
            InteractionStatus::Error => "error",
            InteractionStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Interaction {
    pub timestamp: DateTime<Local>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_request: Option<Value>,
    pub downstream_response: Option<Value>,
    pub processing_time: Option<f64>,
    pub status: InteractionStatus,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip)]
    opened_at: Option<Instant>,
}

impl Interaction {
    fn open(request_id: &str, provider: &str, request: Value) -> Self {
        let mut downstream = Map::new();
        downstream.insert("provider".to_string(), Value::String(provider.to_string()));
        match request {
            Value::Object(fields) => downstream.extend(fields),
            other => {
                downstream.insert("payload".to_string(), other);
            }
        }
        Self {
            timestamp: Local::now(),
            request_id: request_id.to_string(),
            downstream_request: Some(Value::Object(downstream)),
            downstream_response: None,
            processing_time: None,
            status: InteractionStatus::Pending,
            error: None,
            context: None,
            opened_at: Some(Instant::now()),
        }
    }

    /// Record for a request that has no live entry.
    fn orphan_error(request_id: &str, error: String, context: Option<String>) -> Self {
        Self {
            timestamp: Local::now(),
            request_id: request_id.to_string(),
            downstream_request: None,
            downstream_response: None,
            processing_time: None,
            status: InteractionStatus::Error,
            error: Some(error),
            context,
            opened_at: None,
        }
    }

    fn age(&self) -> Duration {
        self.opened_at.map(|t| t.elapsed()).unwrap_or_default()
    }
}

/// Destination for finished interaction records.
pub trait InteractionSink: Send + Sync {
    fn emit(&self, record: &Interaction);
}

/// Writes each record as one JSON string on the `llm_interaction` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl InteractionSink for TracingSink {
    fn emit(&self, record: &Interaction) {
        let body = match serde_json::to_string(record) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(request_id = %record.request_id, "interaction encode failed: {err}");
                return;
            }
        };
        match record.status {
            InteractionStatus::Success | InteractionStatus::Pending => tracing::info!(
                target: INTERACTION_TARGET,
                request_id = %record.request_id,
                status = record.status.as_str(),
                interaction = %body
            ),
            InteractionStatus::Error | InteractionStatus::Abandoned => tracing::warn!(
                target: INTERACTION_TARGET,
                request_id = %record.request_id,
                status = record.status.as_str(),
                interaction = %body
            ),
        }
    }
}

/// Keeps emitted records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Interaction>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<Interaction> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl InteractionSink for MemorySink {
    fn emit(&self, record: &Interaction) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

#[derive(Clone)]
pub struct InteractionLogger {
    live: Arc<DashMap<String, Interaction>>,
    sink: Arc<dyn InteractionSink>,
}

impl Default for InteractionLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl InteractionLogger {
    pub fn new(sink: Arc<dyn InteractionSink>) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            sink,
        }
    }

    pub fn start(&self, request_id: &str, provider: &str, request: Value) {
        match self.live.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::error!(request_id, "interaction already open; keeping existing entry");
            }
            Entry::Vacant(slot) => {
                slot.insert(Interaction::open(request_id, provider, request));
            }
        }
    }

    /// Closes the live entry and emits it. A missing entry produces a
    /// minimal error record instead.
    pub fn complete(
        &self,
        request_id: &str,
        response: Value,
        processing_time: f64,
        success: bool,
        error: Option<String>,
    ) {
        let Some((_, mut record)) = self.live.remove(request_id) else {
            self.sink.emit(&Interaction::orphan_error(
                request_id,
                error.unwrap_or_else(|| "interaction not found".to_string()),
                Some("complete".to_string()),
            ));
            return;
        };
        record.downstream_response = Some(truncate_embedding_fields(&response));
        record.processing_time = Some(processing_time);
        record.status = if success {
            InteractionStatus::Success
        } else {
            InteractionStatus::Error
        };
        record.error = error;
        self.sink.emit(&record);
    }

    pub fn log_error(&self, request_id: &str, error: &str, context: &str) {
        let elapsed = self
            .live
            .get(request_id)
            .map(|entry| entry.age().as_secs_f64());
        match elapsed {
            Some(elapsed) => self.complete(
                request_id,
                json!({ "error_context": context }),
                elapsed,
                false,
                Some(error.to_string()),
            ),
            None => self.sink.emit(&Interaction::orphan_error(
                request_id,
                error.to_string(),
                Some(context.to_string()),
            )),
        }
    }

    /// Evicts entries older than `ttl` and emits them as abandoned.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .live
            .iter()
            .filter(|entry| entry.age() >= ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let mut swept = 0;
        for request_id in expired {
            if let Some((_, record)) = self.live.remove_if(&request_id, |_, r| r.age() >= ttl) {
                self.abandon(record, "interaction expired before completion");
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::warn!(swept, "swept expired interactions");
        }
        swept
    }

    /// Emits every live entry as abandoned. Used on shutdown.
    pub fn drain(&self) -> usize {
        let keys: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        let mut drained = 0;
        for request_id in keys {
            if let Some((_, record)) = self.live.remove(&request_id) {
                self.abandon(record, "gateway shut down before completion");
                drained += 1;
            }
        }
        drained
    }

    fn abandon(&self, mut record: Interaction, reason: &str) {
        record.processing_time = Some(record.age().as_secs_f64());
        record.status = InteractionStatus::Abandoned;
        record.error = Some(reason.to_string());
        self.sink.emit(&record);
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, request_id: &str) -> bool {
        self.live.contains_key(request_id)
    }
}

/// Shortens embedding vectors in an embeddings response so records stay
/// small: float arrays keep three elements, base64 strings ten characters.
pub fn truncate_embedding_fields(value: &Value) -> Value {
    let mut out = value.clone();
    let Some(items) = out.get_mut("data").and_then(|v| v.as_array_mut()) else {
        return out;
    };
    for item in items.iter_mut() {
        let Some(embedding) = item.get_mut("embedding") else {
            continue;
        };
        match embedding {
            Value::Array(values) if values.len() > VECTOR_KEEP => {
                values.truncate(VECTOR_KEEP);
                values.push(Value::String(ELLIPSIS.to_string()));
            }
            Value::String(encoded) if encoded.chars().count() > BASE64_KEEP => {
                let head: String = encoded.chars().take(BASE64_KEEP).collect();
                *encoded = format!("{head}{ELLIPSIS}");
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> (InteractionLogger, MemorySink) {
        let sink = MemorySink::default();
        (InteractionLogger::new(Arc::new(sink.clone())), sink)
    }

    #[test]
    fn truncation_respects_bounds() {
        let response = json!({
            "data": [
                {"embedding": [0.1, 0.2, 0.3, 0.4, 0.5]},
                {"embedding": "QUJDREVGR0hJSktMTU5PUA=="},
                {"embedding": [0.1, 0.2]},
                {"embedding": "short"}
            ]
        });
        let truncated = truncate_embedding_fields(&response);
        let data = truncated["data"].as_array().expect("data");
        assert_eq!(data[0]["embedding"], json!([0.1, 0.2, 0.3, "..."]));
        assert_eq!(data[1]["embedding"], "QUJDREVGR0...");
        assert!(data[1]["embedding"].as_str().map(|s| s.len() <= 13).unwrap_or(false));
        assert_eq!(data[2]["embedding"], json!([0.1, 0.2]));
        assert_eq!(data[3]["embedding"], "short");
        // Input is untouched.
        assert_eq!(response["data"][0]["embedding"].as_array().map(|a| a.len()), Some(5));
    }

    #[test]
    fn complete_emits_once_and_removes_entry() {
        let (logger, sink) = logger();
        logger.start("r1", "openai_compatible", json!({"model": "m"}));
        assert!(logger.is_live("r1"));
        logger.complete("r1", json!({"ok": true}), 0.25, true, None);
        assert!(!logger.is_live("r1"));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InteractionStatus::Success);
        assert_eq!(
            records[0].downstream_request.as_ref().map(|r| r["provider"].clone()),
            Some(json!("openai_compatible"))
        );
        assert_eq!(records[0].processing_time, Some(0.25));
    }

    #[test]
    fn complete_without_start_emits_error_record() {
        let (logger, sink) = logger();
        logger.complete("ghost", json!({}), 0.0, true, None);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InteractionStatus::Error);
        assert!(records[0].downstream_request.is_none());
    }

    #[test]
    fn log_error_carries_context() {
        let (logger, sink) = logger();
        logger.start("r2", "p", json!({}));
        logger.log_error("r2", "upstream exploded", "stream_completion");
        logger.log_error("r3", "never started", "chat_completion");

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].downstream_response,
            Some(json!({"error_context": "stream_completion"}))
        );
        assert_eq!(records[0].error.as_deref(), Some("upstream exploded"));
        assert_eq!(records[1].context.as_deref(), Some("chat_completion"));
        assert_eq!(logger.live_count(), 0);
    }

    #[test]
    fn sweep_only_evicts_expired() {
        let (logger, sink) = logger();
        logger.start("old", "p", json!({}));
        std::thread::sleep(Duration::from_millis(20));
        logger.start("new", "p", json!({}));

        assert_eq!(logger.sweep_expired(Duration::from_millis(10)), 1);
        assert!(!logger.is_live("old"));
        assert!(logger.is_live("new"));
        assert_eq!(sink.records()[0].status, InteractionStatus::Abandoned);

        assert_eq!(logger.drain(), 1);
        assert_eq!(logger.live_count(), 0);
    }
}
