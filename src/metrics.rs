//! In-process request metrics.
//!
//! Every request is registered as active on dispatch and moved into a bounded
//! history of completed requests exactly once. Aggregates (totals, per-model
//! usage, per-hour buckets) are updated in the same critical section as the
//! move, so readers never see a request counted twice or in both sets.
//! Completions are also mirrored into the process Prometheus recorder.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub const DEFAULT_HISTORY: usize = 10_000;
const HOUR_RETENTION: i64 = 168;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Chat,
    Embedding,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Chat => "chat",
            RequestType::Embedding => "embedding",
        }
    }
}

/// What is known about a request when it is dispatched.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Gateway-assigned; keys the active set.
    pub request_id: String,
    /// Caller-supplied `x-request-id`, kept for log correlation only.
    pub correlation_id: Option<String>,
    pub model: String,
    pub user_id: Option<String>,
    pub stream: bool,
    pub request_type: RequestType,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub model: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and completion.
    pub duration: Option<f64>,
    pub success: bool,
    pub error: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub user_id: Option<String>,
    pub stream: bool,
    pub request_type: RequestType,
    #[serde(skip)]
    started_at: Instant,
}

impl RequestMetrics {
    fn new(desc: RequestDescriptor) -> Self {
        Self {
            request_id: desc.request_id,
            correlation_id: desc.correlation_id,
            model: desc.model,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            success: true,
            error: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            user_id: desc.user_id,
            stream: desc.stream,
            request_type: desc.request_type,
            started_at: Instant::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Elapsed seconds; still running for active requests.
    pub fn duration_secs(&self) -> f64 {
        self.duration
            .unwrap_or_else(|| self.started_at.elapsed().as_secs_f64())
    }
}

/// How a request ended.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Falls back to prompt + completion when absent.
    pub total_tokens: Option<u64>,
}

impl RequestOutcome {
    pub fn success(prompt_tokens: u64, completion_tokens: u64, total_tokens: Option<u64>) -> Self {
        Self {
            success: true,
            error: None,
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
struct HourBucket {
    requests: u64,
    tokens: u64,
    duration: f64,
    errors: u64,
}

#[derive(Debug, Default)]
struct CollectorState {
    active: HashMap<String, RequestMetrics>,
    completed: VecDeque<RequestMetrics>,
    total_requests: u64,
    total_tokens: u64,
    total_duration: f64,
    success_count: u64,
    model_usage: BTreeMap<String, u64>,
    hourly: BTreeMap<NaiveDateTime, HourBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub average_latency: f64,
    pub success_rate: f64,
    pub active_requests: usize,
    pub models_used: BTreeMap<String, u64>,
    pub requests_per_hour: u64,
    pub tokens_per_hour: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelStats {
    pub requests: u64,
    pub tokens: u64,
    pub total_duration: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_latency: f64,
    pub success_rate: f64,
}

/// Parallel series, oldest hour first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HourlyTrends {
    pub hours: Vec<String>,
    pub requests: Vec<u64>,
    pub tokens: Vec<u64>,
    pub latency: Vec<f64>,
    pub errors: Vec<u64>,
}

#[derive(Clone)]
pub struct MetricsCollector {
    capacity: usize,
    inner: Arc<Mutex<CollectorState>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(CollectorState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a request as active. A second start for an id that is
    /// still active keeps the first entry.
    pub fn start(&self, desc: RequestDescriptor) -> RequestMetrics {
        let (entry, active, collided) = {
            let mut state = self.lock();
            let collided = state.active.contains_key(&desc.request_id);
            let entry = state
                .active
                .entry(desc.request_id.clone())
                .or_insert_with(|| RequestMetrics::new(desc))
                .clone();
            (entry, state.active.len(), collided)
        };
        if collided {
            tracing::error!(
                request_id = %entry.request_id,
                "request id already active; keeping existing metrics entry"
            );
        }
        ::metrics::gauge!("llmgate_active_requests").set(active as f64);
        entry
    }

    /// Moves an active request into history. Unknown ids are ignored.
    pub fn complete(&self, request_id: &str, outcome: RequestOutcome) -> Option<RequestMetrics> {
        let (done, active) = {
            let mut state = self.lock();
            let mut entry = state.active.remove(request_id)?;
            let now = Utc::now();
            entry.end_time = Some(now);
            entry.duration = Some(entry.started_at.elapsed().as_secs_f64());
            entry.success = outcome.success;
            entry.error = outcome.error;
            entry.prompt_tokens = outcome.prompt_tokens;
            entry.completion_tokens = outcome.completion_tokens;
            entry.total_tokens = outcome
                .total_tokens
                .unwrap_or(outcome.prompt_tokens + outcome.completion_tokens);

            state.record(&entry);
            while state.completed.len() >= self.capacity {
                state.completed.pop_front();
            }
            state.completed.push_back(entry.clone());
            (entry, state.active.len())
        };
        export_completion(&done, active);
        Some(done)
    }

    pub fn current_stats(&self) -> CurrentStats {
        let state = self.lock();
        let current = state.hourly.get(&hour_key(Local::now()));
        let requests = state.total_requests;
        CurrentStats {
            total_requests: requests,
            total_tokens: state.total_tokens,
            average_latency: if requests > 0 {
                state.total_duration / requests as f64
            } else {
                0.0
            },
            success_rate: if requests > 0 {
                state.success_count as f64 / requests as f64
            } else {
                1.0
            },
            active_requests: state.active.len(),
            models_used: state.model_usage.clone(),
            requests_per_hour: current.map(|b| b.requests).unwrap_or(0),
            tokens_per_hour: current.map(|b| b.tokens).unwrap_or(0),
        }
    }

    /// Per-model figures over the retained history.
    pub fn model_stats(&self) -> BTreeMap<String, ModelStats> {
        let snapshot: Vec<(String, u64, f64, bool)> = {
            let state = self.lock();
            state
                .completed
                .iter()
                .map(|m| (m.model.clone(), m.total_tokens, m.duration_secs(), m.success))
                .collect()
        };
        let mut out: BTreeMap<String, ModelStats> = BTreeMap::new();
        for (model, tokens, duration, success) in snapshot {
            let stats = out.entry(model).or_default();
            stats.requests += 1;
            stats.tokens += tokens;
            stats.total_duration += duration;
            if success {
                stats.success_count += 1;
            } else {
                stats.error_count += 1;
            }
        }
        for stats in out.values_mut() {
            stats.average_latency = stats.total_duration / stats.requests as f64;
            stats.success_rate = stats.success_count as f64 / stats.requests as f64;
        }
        out
    }

    pub fn hourly_trends(&self, hours: u32) -> HourlyTrends {
        let now = Local::now();
        let slots: Vec<DateTime<Local>> = (0..hours as i64)
            .rev()
            .map(|i| now - ChronoDuration::hours(i))
            .collect();
        let buckets: Vec<HourBucket> = {
            let state = self.lock();
            slots
                .iter()
                .map(|at| state.hourly.get(&hour_key(*at)).cloned().unwrap_or_default())
                .collect()
        };
        let mut trends = HourlyTrends::default();
        for (at, bucket) in slots.iter().zip(buckets) {
            trends.hours.push(at.format("%H:00").to_string());
            trends.requests.push(bucket.requests);
            trends.tokens.push(bucket.tokens);
            trends.latency.push(if bucket.requests > 0 {
                bucket.duration / bucket.requests as f64
            } else {
                0.0
            });
            trends.errors.push(bucket.errors);
        }
        trends
    }

    /// Most recent completions, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RequestMetrics> {
        let state = self.lock();
        state.completed.iter().rev().take(limit).cloned().collect()
    }

    pub fn reset(&self) {
        *self.lock() = CollectorState::default();
        ::metrics::gauge!("llmgate_active_requests").set(0.0);
        tracing::info!("metrics reset");
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.lock().completed.len()
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.lock().active.contains_key(request_id)
    }

    pub fn is_completed(&self, request_id: &str) -> bool {
        self.lock()
            .completed
            .iter()
            .any(|m| m.request_id == request_id)
    }
}

impl CollectorState {
    fn record(&mut self, entry: &RequestMetrics) {
        let duration = entry.duration_secs();
        self.total_requests += 1;
        self.total_tokens += entry.total_tokens;
        self.total_duration += duration;
        if entry.success {
            self.success_count += 1;
        }
        *self.model_usage.entry(entry.model.clone()).or_insert(0) += 1;

        let started = entry.start_time.with_timezone(&Local);
        let bucket = self.hourly.entry(hour_key(started)).or_default();
        bucket.requests += 1;
        bucket.tokens += entry.total_tokens;
        bucket.duration += duration;
        if !entry.success {
            bucket.errors += 1;
        }

        let cutoff = hour_key(Local::now()) - ChronoDuration::hours(HOUR_RETENTION);
        self.hourly = self.hourly.split_off(&cutoff);
    }
}

fn hour_key(at: DateTime<Local>) -> NaiveDateTime {
    let naive = at.naive_local();
    naive
        .date()
        .and_hms_opt(naive.hour(), 0, 0)
        .unwrap_or(naive)
}

fn export_completion(entry: &RequestMetrics, active: usize) {
    let model = entry.model.clone();
    let status = if entry.success { "success" } else { "error" };
    ::metrics::counter!("llmgate_requests_total",
        "model" => model.clone(), "request_type" => entry.request_type.as_str(), "status" => status
    )
    .increment(1);
    ::metrics::counter!("llmgate_tokens_total", "model" => model.clone(), "kind" => "prompt")
        .increment(entry.prompt_tokens);
    ::metrics::counter!("llmgate_tokens_total", "model" => model.clone(), "kind" => "completion")
        .increment(entry.completion_tokens);
    ::metrics::histogram!("llmgate_request_duration_seconds", "model" => model)
        .record(entry.duration_secs());
    ::metrics::gauge!("llmgate_active_requests").set(active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: &str, model: &str) -> RequestDescriptor {
        RequestDescriptor {
            request_id: id.to_string(),
            correlation_id: None,
            model: model.to_string(),
            user_id: None,
            stream: false,
            request_type: RequestType::Chat,
        }
    }

    #[test]
    fn empty_collector_reports_full_success_rate() {
        let stats = MetricsCollector::new(10).current_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.average_latency, 0.0);
    }

    #[test]
    fn active_and_completed_stay_disjoint() {
        let collector = MetricsCollector::new(10);
        collector.start(desc("a", "m"));
        assert!(collector.is_active("a"));
        assert!(!collector.is_completed("a"));

        let done = collector
            .complete("a", RequestOutcome::success(5, 3, None))
            .expect("completed");
        assert_eq!(done.total_tokens, 8);
        assert!(!collector.is_active("a"));
        assert!(collector.is_completed("a"));

        assert!(collector.complete("a", RequestOutcome::failure("late")).is_none());
        assert_eq!(collector.current_stats().total_requests, 1);
    }

    #[test]
    fn unknown_completion_is_noop() {
        let collector = MetricsCollector::new(10);
        assert!(collector.complete("missing", RequestOutcome::failure("x")).is_none());
        assert_eq!(collector.completed_count(), 0);
    }

    #[test]
    fn duplicate_start_keeps_first_entry() {
        let collector = MetricsCollector::new(10);
        let first = collector.start(desc("dup", "first-model"));
        let second = collector.start(desc("dup", "second-model"));
        assert_eq!(second.model, "first-model");
        assert_eq!(first.start_time, second.start_time);
        assert_eq!(collector.active_count(), 1);
    }

    #[test]
    fn history_evicts_oldest_but_totals_keep_counting() {
        let collector = MetricsCollector::new(2);
        for id in ["r1", "r2", "r3"] {
            collector.start(desc(id, "m"));
            collector.complete(id, RequestOutcome::success(1, 1, Some(2)));
        }
        assert_eq!(collector.completed_count(), 2);
        assert!(!collector.is_completed("r1"));
        let recent: Vec<String> = collector
            .recent(10)
            .into_iter()
            .map(|m| m.request_id)
            .collect();
        assert_eq!(recent, vec!["r3".to_string(), "r2".to_string()]);
        let stats = collector.current_stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_tokens, 6);
        assert_eq!(stats.requests_per_hour, 3);
    }

    #[test]
    fn model_stats_split_success_and_error() {
        let collector = MetricsCollector::new(10);
        collector.start(desc("ok", "gpt-4o-mini"));
        collector.complete("ok", RequestOutcome::success(2, 2, None));
        collector.start(desc("bad", "gpt-4o-mini"));
        collector.complete("bad", RequestOutcome::failure("boom"));

        let stats = collector.model_stats();
        let model = stats.get("gpt-4o-mini").expect("model stats");
        assert_eq!(model.requests, 2);
        assert_eq!(model.success_count, 1);
        assert_eq!(model.error_count, 1);
        assert_eq!(model.tokens, 4);
        assert_eq!(model.success_rate, 0.5);
    }

    #[test]
    fn trends_cover_requested_hours_oldest_first() {
        let collector = MetricsCollector::new(10);
        collector.start(desc("t", "m"));
        collector.complete("t", RequestOutcome::failure("err"));

        let trends = collector.hourly_trends(3);
        assert_eq!(trends.hours.len(), 3);
        assert_eq!(trends.requests, vec![0, 0, 1]);
        assert_eq!(trends.errors, vec![0, 0, 1]);
        assert_eq!(
            trends.hours.last().map(String::as_str),
            Some(Local::now().format("%H:00").to_string().as_str())
        );
    }

    #[test]
    fn reset_clears_everything() {
        let collector = MetricsCollector::new(10);
        collector.start(desc("x", "m"));
        collector.start(desc("y", "m"));
        collector.complete("y", RequestOutcome::success(1, 0, None));
        collector.reset();
        let stats = collector.current_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.active_requests, 0);
        assert!(stats.models_used.is_empty());
        assert_eq!(collector.completed_count(), 0);
    }

    #[test]
    fn concurrent_lifecycles_finish_exactly_once() {
        let collector = MetricsCollector::new(1_000);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collector = collector.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{t}-{i}");
                        collector.start(desc(&id, "m"));
                        collector.complete(&id, RequestOutcome::success(1, 1, None));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(collector.active_count(), 0);
        assert_eq!(collector.completed_count(), 400);
        assert_eq!(collector.current_stats().total_tokens, 800);
    }
}
