use crate::config::{
    UnknownFieldPolicy, UpstreamAuthConfig, UpstreamAuthType, UpstreamConfig, default_models,
};
use crate::error::{AppError, AppResult};
use crate::interaction::InteractionLogger;
use crate::metrics::{DEFAULT_HISTORY, MetricsCollector};
use crate::provider::ModelProvider;
use crate::upstream::HttpProvider;
use axum::Router;
use axum::http::{HeaderName, HeaderValue};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

pub const SERVICE_NAME: &str = "llmgate";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_LISTEN: &str = "0.0.0.0:8728";
const DEFAULT_UPSTREAM: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TTL_SECS: u64 = 600;
const SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_PROMETHEUS_PATH: &str = "/metrics/prometheus";
const RESERVED_PATHS: [&str; 10] = [
    "/",
    "/health",
    "/v1/models",
    "/v1/chat/completions",
    "/v1/embeddings",
    "/metrics",
    "/metrics/models",
    "/metrics/trends",
    "/metrics/recent",
    "/admin/reset-metrics",
];

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub provider: Arc<dyn ModelProvider>,
    pub metrics: MetricsCollector,
    pub interactions: InteractionLogger,
    pub prometheus: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub upstream: UpstreamConfig,
    pub request_timeout: Duration,
    pub metrics_history: usize,
    pub interaction_ttl: Duration,
    pub sweep_interval: Duration,
    pub models: Vec<String>,
    pub unknown_fields: UnknownFieldPolicy,
    pub prometheus_path: String,
    pub enable_cors: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            upstream: UpstreamConfig {
                base_url: DEFAULT_UPSTREAM.to_string(),
                auth: None,
            },
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            metrics_history: DEFAULT_HISTORY,
            interaction_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            models: default_models(),
            unknown_fields: UnknownFieldPolicy::default(),
            prometheus_path: DEFAULT_PROMETHEUS_PATH.to_string(),
            enable_cors: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset
    /// and unparsable ones fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let listen = get("LLMGATE_LISTEN").unwrap_or(defaults.listen);
        let base_url = get("LLMGATE_UPSTREAM_BASE_URL")
            .or_else(|| get("OPENAI_BASE_URL"))
            .unwrap_or(defaults.upstream.base_url);
        let auth = get("LLMGATE_UPSTREAM_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .map(|value| UpstreamAuthConfig {
                auth_type: get("LLMGATE_UPSTREAM_AUTH")
                    .and_then(|raw| parse_or_warn("LLMGATE_UPSTREAM_AUTH", &raw, UpstreamAuthType::parse))
                    .unwrap_or(UpstreamAuthType::Bearer),
                value: value.trim().to_string(),
                header_name: get("LLMGATE_UPSTREAM_AUTH_HEADER"),
            });

        let request_timeout = get("LLMGATE_REQUEST_TIMEOUT_SECS")
            .and_then(|raw| parse_or_warn("LLMGATE_REQUEST_TIMEOUT_SECS", &raw, positive_u64))
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let metrics_history = get("LLMGATE_METRICS_HISTORY")
            .and_then(|raw| parse_or_warn("LLMGATE_METRICS_HISTORY", &raw, positive_u64))
            .map(|n| n as usize)
            .unwrap_or(defaults.metrics_history);
        let interaction_ttl = get("LLMGATE_INTERACTION_TTL_SECS")
            .and_then(|raw| parse_or_warn("LLMGATE_INTERACTION_TTL_SECS", &raw, positive_u64))
            .map(Duration::from_secs)
            .unwrap_or(defaults.interaction_ttl);
        let models = get("LLMGATE_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|models| !models.is_empty())
            .unwrap_or(defaults.models);
        let unknown_fields = get("LLMGATE_UNKNOWN_FIELDS")
            .and_then(|raw| parse_or_warn("LLMGATE_UNKNOWN_FIELDS", &raw, UnknownFieldPolicy::parse))
            .unwrap_or(defaults.unknown_fields);
        let prometheus_path = get("LLMGATE_PROMETHEUS_PATH")
            .map(|raw| raw.trim().to_string())
            .and_then(|path| {
                parse_or_warn("LLMGATE_PROMETHEUS_PATH", &path, |p| {
                    (p.starts_with('/') && !RESERVED_PATHS.iter().any(|r| *r == p)).then(|| p.to_string())
                })
            })
            .unwrap_or(defaults.prometheus_path);
        let enable_cors = get("LLMGATE_ENABLE_CORS")
            .and_then(|raw| parse_or_warn("LLMGATE_ENABLE_CORS", &raw, parse_bool))
            .unwrap_or(defaults.enable_cors);

        Self {
            listen,
            upstream: UpstreamConfig { base_url, auth },
            request_timeout,
            metrics_history,
            interaction_ttl,
            sweep_interval: defaults.sweep_interval.min(interaction_ttl),
            models,
            unknown_fields,
            prometheus_path,
            enable_cors,
        }
    }
}

fn parse_or_warn<T>(key: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!("ignoring invalid {key}={raw:?}, using default");
    }
    parsed
}

fn positive_u64(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok().filter(|n| *n > 0)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("llmgate/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    if runtime.upstream.auth.is_none() {
        tracing::warn!("no upstream api key configured; requests go out unauthenticated");
    }
    let provider = HttpProvider::new(http, runtime.upstream.clone(), runtime.request_timeout);
    load_state_with_provider(runtime, Arc::new(provider)).await
}

pub async fn load_state_with_provider(
    runtime: RuntimeConfig,
    provider: Arc<dyn ModelProvider>,
) -> AppResult<AppState> {
    let prometheus = init_metrics()?;
    tracing::info!(
        provider = provider.name(),
        upstream = %runtime.upstream.base_url,
        models = runtime.models.len(),
        "gateway state loaded"
    );
    Ok(AppState {
        metrics: MetricsCollector::new(runtime.metrics_history),
        interactions: InteractionLogger::default(),
        runtime: Arc::new(runtime),
        provider,
        prometheus,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

/// Handle to the tasks started by [`AppState::spawn_background`].
pub struct BackgroundTasks {
    stop: oneshot::Sender<()>,
    sweeper: JoinHandle<()>,
    interactions: InteractionLogger,
}

impl BackgroundTasks {
    /// Stops the sweeper and flushes every interaction still open.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.sweeper.await {
            tracing::warn!("interaction sweeper ended abnormally: {err}");
        }
        let drained = self.interactions.drain();
        if drained > 0 {
            tracing::warn!(drained, "flushed open interactions on shutdown");
        }
    }
}

impl AppState {
    pub fn spawn_background(&self) -> BackgroundTasks {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let interactions = self.interactions.clone();
        let ttl = self.runtime.interaction_ttl;
        let every = self.runtime.sweep_interval;
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        interactions.sweep_expired(ttl);
                    }
                }
            }
        });
        BackgroundTasks {
            stop,
            sweeper,
            interactions: self.interactions.clone(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let enable_cors = state.runtime.enable_cors;
    let router = build_api_router(&state.runtime.prometheus_path)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-service-version"),
            HeaderValue::from_static(SERVICE_VERSION),
        ))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(TraceLayer::new_for_http());
    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

fn build_api_router(prometheus_path: &str) -> Router<AppState> {
    Router::new()
        .route("/", get(crate::handlers::root))
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/embeddings", post(crate::handlers::create_embeddings))
        .route("/metrics", get(crate::handlers::current_metrics))
        .route("/metrics/models", get(crate::handlers::model_metrics))
        .route("/metrics/trends", get(crate::handlers::metric_trends))
        .route("/metrics/recent", get(crate::handlers::recent_requests))
        .route("/admin/reset-metrics", post(crate::handlers::reset_metrics))
        .route(prometheus_path, get(crate::handlers::prometheus_metrics))
}
