use crate::interaction::InteractionLogger;
use crate::metrics::{MetricsCollector, RequestDescriptor, RequestMetrics, RequestOutcome};
use crate::schema::Usage;
use serde_json::Value;
use std::time::Instant;

pub const CANCELLED_MESSAGE: &str = "request cancelled before completion";

/// Binds one metrics entry and one interaction entry to a dispatched request.
///
/// `succeed` and `fail` consume the tracker, so a request is finalized at
/// most once. A tracker dropped without either (handler future cancelled,
/// relay task aborted) finalizes the request as failed.
pub struct RequestTracker {
    request_id: String,
    started_at: Instant,
    metrics: MetricsCollector,
    interactions: InteractionLogger,
    finished: bool,
}

impl RequestTracker {
    pub fn begin(
        metrics: &MetricsCollector,
        interactions: &InteractionLogger,
        descriptor: RequestDescriptor,
        provider: &str,
        request_payload: Value,
    ) -> Self {
        let request_id = descriptor.request_id.clone();
        metrics.start(descriptor);
        interactions.start(&request_id, provider, request_payload);
        Self {
            request_id,
            started_at: Instant::now(),
            metrics: metrics.clone(),
            interactions: interactions.clone(),
            finished: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn succeed(mut self, usage: Usage, response: Value) -> Option<RequestMetrics> {
        self.finished = true;
        let done = self.metrics.complete(
            &self.request_id,
            RequestOutcome::success(
                usage.prompt_tokens,
                usage.completion_tokens,
                Some(usage.total_tokens).filter(|t| *t > 0),
            ),
        );
        self.interactions
            .complete(&self.request_id, response, self.elapsed_secs(), true, None);
        done
    }

    pub fn fail(mut self, error: &str, context: &str) -> Option<RequestMetrics> {
        self.finished = true;
        self.finalize_failure(error, context)
    }

    fn finalize_failure(&self, error: &str, context: &str) -> Option<RequestMetrics> {
        let done = self
            .metrics
            .complete(&self.request_id, RequestOutcome::failure(error));
        self.interactions.log_error(&self.request_id, error, context);
        done
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(request_id = %self.request_id, "request dropped before completion");
        self.finalize_failure(CANCELLED_MESSAGE, "cancelled");
    }
}
