use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    Reject,
    Ignore,
    Preserve,
}

impl Default for UnknownFieldPolicy {
    fn default() -> Self {
        UnknownFieldPolicy::Preserve
    }
}

impl UnknownFieldPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(UnknownFieldPolicy::Reject),
            "ignore" => Some(UnknownFieldPolicy::Ignore),
            "preserve" => Some(UnknownFieldPolicy::Preserve),
            _ => None,
        }
    }
}

/// Where the HTTP provider sends downstream calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: Option<UpstreamAuthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: UpstreamAuthType,
    pub value: String,
    #[serde(default)]
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamAuthType {
    Bearer,
    Header,
}

impl UpstreamAuthType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bearer" => Some(UpstreamAuthType::Bearer),
            "header" => Some(UpstreamAuthType::Header),
            _ => None,
        }
    }
}

pub fn default_models() -> Vec<String> {
    [
        "gpt-4o-mini",
        "gpt-4o",
        "gpt-4-turbo",
        "gpt-4",
        "gpt-3.5-turbo",
        "text-embedding-3-small",
        "text-embedding-3-large",
        "claude-3-sonnet-20240229",
        "claude-3-haiku-20240307",
        "gemini-pro",
        "mistral-large",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_config_deserializes_with_auth() {
        let cfg: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "base_url": "http://localhost:4000/v1",
            "auth": { "type": "header", "value": "k", "header_name": "api-key" }
        }))
        .expect("config");
        let auth = cfg.auth.expect("auth");
        assert_eq!(auth.auth_type, UpstreamAuthType::Header);
        assert_eq!(auth.header_name.as_deref(), Some("api-key"));
    }

    #[test]
    fn unknown_field_policy_parses_case_insensitively() {
        assert_eq!(
            UnknownFieldPolicy::parse(" Reject "),
            Some(UnknownFieldPolicy::Reject)
        );
        assert_eq!(UnknownFieldPolicy::parse("nope"), None);
        assert_eq!(UnknownFieldPolicy::default(), UnknownFieldPolicy::Preserve);
    }
}
