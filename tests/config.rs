use llmgate::app::RuntimeConfig;
use llmgate::config::{UnknownFieldPolicy, UpstreamAuthType};
use std::collections::HashMap;
use std::time::Duration;

fn runtime_from(pairs: &[(&str, &str)]) -> RuntimeConfig {
    let env: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    RuntimeConfig::from_lookup(move |key: &str| env.get(key).cloned())
}

#[test]
fn empty_environment_uses_defaults() {
    let cfg = runtime_from(&[]);
    let defaults = RuntimeConfig::default();
    assert_eq!(cfg.listen, defaults.listen);
    assert_eq!(cfg.upstream.base_url, defaults.upstream.base_url);
    assert!(cfg.upstream.auth.is_none());
    assert_eq!(cfg.metrics_history, 10_000);
    assert_eq!(cfg.unknown_fields, UnknownFieldPolicy::Preserve);
    assert!(!cfg.models.is_empty());
    assert!(cfg.enable_cors);
}

#[test]
fn openai_variables_are_fallbacks() {
    let cfg = runtime_from(&[
        ("OPENAI_BASE_URL", "http://fallback/v1"),
        ("OPENAI_API_KEY", "sk-fallback"),
    ]);
    assert_eq!(cfg.upstream.base_url, "http://fallback/v1");
    let auth = cfg.upstream.auth.expect("auth");
    assert_eq!(auth.auth_type, UpstreamAuthType::Bearer);
    assert_eq!(auth.value, "sk-fallback");

    let cfg = runtime_from(&[
        ("OPENAI_BASE_URL", "http://fallback/v1"),
        ("LLMGATE_UPSTREAM_BASE_URL", "http://primary"),
        ("LLMGATE_UPSTREAM_API_KEY", " sk-primary "),
        ("LLMGATE_UPSTREAM_AUTH", "header"),
        ("LLMGATE_UPSTREAM_AUTH_HEADER", "api-key"),
    ]);
    assert_eq!(cfg.upstream.base_url, "http://primary");
    let auth = cfg.upstream.auth.expect("auth");
    assert_eq!(auth.auth_type, UpstreamAuthType::Header);
    assert_eq!(auth.value, "sk-primary");
    assert_eq!(auth.header_name.as_deref(), Some("api-key"));
}

#[test]
fn invalid_values_fall_back_to_defaults() {
    let cfg = runtime_from(&[
        ("LLMGATE_REQUEST_TIMEOUT_SECS", "0"),
        ("LLMGATE_METRICS_HISTORY", "lots"),
        ("LLMGATE_UNKNOWN_FIELDS", "explode"),
        ("LLMGATE_ENABLE_CORS", "maybe"),
        ("LLMGATE_MODELS", " , "),
    ]);
    let defaults = RuntimeConfig::default();
    assert_eq!(cfg.request_timeout, defaults.request_timeout);
    assert_eq!(cfg.metrics_history, defaults.metrics_history);
    assert_eq!(cfg.unknown_fields, defaults.unknown_fields);
    assert_eq!(cfg.enable_cors, defaults.enable_cors);
    assert_eq!(cfg.models, defaults.models);
}

#[test]
fn explicit_values_are_applied() {
    let cfg = runtime_from(&[
        ("LLMGATE_LISTEN", "127.0.0.1:9000"),
        ("LLMGATE_REQUEST_TIMEOUT_SECS", "15"),
        ("LLMGATE_METRICS_HISTORY", "50"),
        ("LLMGATE_INTERACTION_TTL_SECS", "120"),
        ("LLMGATE_MODELS", "gpt-4o, text-embedding-3-small"),
        ("LLMGATE_UNKNOWN_FIELDS", "reject"),
        ("LLMGATE_ENABLE_CORS", "false"),
    ]);
    assert_eq!(cfg.listen, "127.0.0.1:9000");
    assert_eq!(cfg.request_timeout, Duration::from_secs(15));
    assert_eq!(cfg.metrics_history, 50);
    assert_eq!(cfg.interaction_ttl, Duration::from_secs(120));
    assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
    assert_eq!(cfg.models, vec!["gpt-4o", "text-embedding-3-small"]);
    assert_eq!(cfg.unknown_fields, UnknownFieldPolicy::Reject);
    assert!(!cfg.enable_cors);
}

#[tokio::test]
async fn state_loads_with_http_provider() {
    let runtime = runtime_from(&[("LLMGATE_UPSTREAM_BASE_URL", "http://127.0.0.1:9/v1")]);
    let state = llmgate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    assert_eq!(state.provider.name(), "openai_compatible");
    assert_eq!(state.metrics.active_count(), 0);
    let background = state.spawn_background();
    background.shutdown().await;
}
