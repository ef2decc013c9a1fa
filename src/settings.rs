use std::str::FromStr;
use std::time::Duration;

use crate::models::{DEFAULT_TIMEOUT, DEFAULT_UPSTREAM_URL};
use crate::retry::RetryPolicy;
use crate::storage::{DEFAULT_HISTORY_PAIRS, DEFAULT_MAX_SESSIONS};

pub const ENV_UPSTREAM_URL: &str = "WAVES_UPSTREAM_URL";
pub const ENV_API_KEY: &str = "WAVES_API_KEY";
pub const ENV_MODEL: &str = "WAVES_MODEL";
pub const ENV_TEMPERATURE: &str = "WAVES_TEMPERATURE";
pub const ENV_MAX_TOKENS: &str = "WAVES_MAX_TOKENS";
pub const ENV_HISTORY_PAIRS: &str = "WAVES_HISTORY_PAIRS";
pub const ENV_MAX_SESSIONS: &str = "WAVES_MAX_SESSIONS";
pub const ENV_TIMEOUT_SECS: &str = "WAVES_TIMEOUT_SECS";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self { Self { temperature: 0.7, max_tokens: 1000 } }
}

/// One source of configuration. Unset fields defer to the next layer down.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SettingsLayer {
    pub upstream_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub history_pairs: Option<usize>,
    pub max_sessions: Option<usize>,
    pub timeout_secs: Option<u64>,
}

impl SettingsLayer {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            upstream_url: text(ENV_UPSTREAM_URL),
            api_key: text(ENV_API_KEY),
            model: text(ENV_MODEL),
            temperature: parse_var(ENV_TEMPERATURE, text(ENV_TEMPERATURE)),
            max_tokens: parse_var(ENV_MAX_TOKENS, text(ENV_MAX_TOKENS)),
            history_pairs: parse_var(ENV_HISTORY_PAIRS, text(ENV_HISTORY_PAIRS)),
            max_sessions: parse_var(ENV_MAX_SESSIONS, text(ENV_MAX_SESSIONS)),
            timeout_secs: parse_var(ENV_TIMEOUT_SECS, text(ENV_TIMEOUT_SECS)),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub upstream_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub model_params: ModelParams,
    pub history_pairs: usize,
    pub max_sessions: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.into(),
            api_key: None,
            model: None,
            model_params: ModelParams::default(),
            history_pairs: DEFAULT_HISTORY_PAIRS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Command-line flags win over the environment, which wins over built-in defaults.
pub fn resolve_settings(cli: &SettingsLayer, env: &SettingsLayer) -> anyhow::Result<RelaySettings> {
    let defaults = RelaySettings::default();

    let upstream_url = cli
        .upstream_url
        .clone()
        .or_else(|| env.upstream_url.clone())
        .unwrap_or(defaults.upstream_url);
    let parsed = url::Url::parse(&upstream_url)
        .map_err(|e| anyhow::anyhow!("invalid upstream url {upstream_url:?}: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("upstream url must be http or https, got {}", parsed.scheme());
    }

    let model_params = ModelParams {
        temperature: cli
            .temperature
            .or(env.temperature)
            .unwrap_or(defaults.model_params.temperature),
        max_tokens: cli
            .max_tokens
            .or(env.max_tokens)
            .unwrap_or(defaults.model_params.max_tokens),
    };

    Ok(RelaySettings {
        upstream_url,
        api_key: cli.api_key.clone().or_else(|| env.api_key.clone()),
        model: cli.model.clone().or_else(|| env.model.clone()),
        model_params,
        history_pairs: cli.history_pairs.or(env.history_pairs).unwrap_or(defaults.history_pairs),
        max_sessions: cli.max_sessions.or(env.max_sessions).unwrap_or(defaults.max_sessions),
        timeout: cli
            .timeout_secs
            .or(env.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        retry: defaults.retry,
    })
}

/// A credential sent with the request overrides the configured one.
pub fn resolve_credential(request: Option<String>, configured: Option<&str>) -> Option<String> {
    request
        .filter(|k| !k.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
}
