//! Static gateway configuration, loaded once at startup.
//!
//! The document is JSON; individual fields can be overridden through
//! environment variables so deployments never need credentials on disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{GatewayError, Result};

pub const PROVIDER_OPENAI: &str = "openai";
pub const PROVIDER_GEMINI: &str = "gemini";
pub const PROVIDER_CLAUDE: &str = "claude";
pub const PROVIDER_LOCAL_WORKER: &str = "local-worker";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub routing: RoutingSettings,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub breaker: BreakerSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderSettings {
    pub enabled: bool,
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub timeout_seconds: u64,
    pub priority: i32,
    /// Case-insensitive substring patterns; empty means the adapter's
    /// built-in list.
    pub models: Vec<String>,
    /// USD per input token, used for the estimated-cost metadata field.
    pub input_cost_per_token: f64,
    /// USD per output token.
    pub output_cost_per_token: f64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            base_url: String::new(),
            default_model: String::new(),
            timeout_seconds: 30,
            priority: 10,
            models: Vec::new(),
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
        }
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("enabled", &self.enabled)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("priority", &self.priority)
            .field("models", &self.models)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingSettings {
    pub default_provider: String,
    pub fallback_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_provider: PROVIDER_OPENAI.to_string(),
            fallback_enabled: true,
            max_retries: 2,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_size: usize,
    /// When set, cache entries live in Redis; otherwise in process memory.
    pub redis_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            max_size: 10_000,
            redis_url: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerSettings {
    /// Failure rate in [0, 1] that opens the breaker.
    pub failure_rate: f64,
    /// Minimum calls in the window before the rate is evaluated.
    pub min_samples: u32,
    pub window_seconds: u64,
    pub open_seconds: u64,
    pub half_open_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            min_samples: 10,
            window_seconds: 60,
            open_seconds: 30,
            half_open_probes: 3,
        }
    }
}

impl GatewayConfig {
    /// Configuration with all four standard providers wired to their public
    /// endpoints. Credentials come from the environment.
    pub fn standard() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            PROVIDER_OPENAI.to_string(),
            ProviderSettings {
                base_url: "https://api.openai.com/v1".to_string(),
                default_model: "gpt-4o-mini".to_string(),
                priority: 10,
                input_cost_per_token: 0.000_000_15,
                output_cost_per_token: 0.000_000_6,
                ..ProviderSettings::default()
            },
        );
        providers.insert(
            PROVIDER_GEMINI.to_string(),
            ProviderSettings {
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                default_model: "gemini-2.5-flash".to_string(),
                priority: 20,
                ..ProviderSettings::default()
            },
        );
        providers.insert(
            PROVIDER_CLAUDE.to_string(),
            ProviderSettings {
                base_url: "https://api.anthropic.com/v1".to_string(),
                default_model: "claude-3-5-sonnet-20241022".to_string(),
                priority: 30,
                input_cost_per_token: 0.000_003,
                output_cost_per_token: 0.000_015,
                ..ProviderSettings::default()
            },
        );
        providers.insert(
            PROVIDER_LOCAL_WORKER.to_string(),
            ProviderSettings {
                base_url: "http://localhost:8000".to_string(),
                default_model: "local-llm".to_string(),
                priority: 40,
                ..ProviderSettings::default()
            },
        );
        Self {
            providers,
            ..Self::default()
        }
    }

    /// Read a JSON config document, falling back to [`standard`] when no
    /// path is given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|err| {
                    GatewayError::Internal(format!(
                        "failed to read config {}: {err}",
                        path.display()
                    ))
                })?;
                serde_json::from_str(&raw).map_err(|err| {
                    GatewayError::Internal(format!(
                        "failed to parse config {}: {err}",
                        path.display()
                    ))
                })?
            }
            None => Self::standard(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }

    /// Per-field environment overrides: `{OPENAI,GEMINI,CLAUDE}_API_KEY`,
    /// `{OPENAI,GEMINI,CLAUDE,LOCAL_WORKER}_BASE_URL`, `GATEWAY_PORT`,
    /// `REDIS_URL`.
    pub fn apply_env_overrides(&mut self) {
        for (name, env_prefix) in [
            (PROVIDER_OPENAI, "OPENAI"),
            (PROVIDER_GEMINI, "GEMINI"),
            (PROVIDER_CLAUDE, "CLAUDE"),
            (PROVIDER_LOCAL_WORKER, "LOCAL_WORKER"),
        ] {
            let Some(settings) = self.providers.get_mut(name) else {
                continue;
            };
            if let Ok(key) = std::env::var(format!("{env_prefix}_API_KEY")) {
                if !key.is_empty() {
                    settings.api_key = key;
                }
            }
            if let Ok(url) = std::env::var(format!("{env_prefix}_BASE_URL")) {
                if !url.is_empty() {
                    settings.base_url = url;
                }
            }
        }
        if let Some(port) = std::env::var("GATEWAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                self.cache.redis_url = Some(url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.routing.max_retries, 2);
        assert_eq!(config.routing.retry_delay_ms, 1000);
        assert!(config.routing.fallback_enabled);
        assert_eq!(config.rate_limit.requests_per_minute, 60);
        assert_eq!(config.cache.ttl_seconds, 3600);
        assert_eq!(config.cache.max_size, 10_000);
    }

    #[test]
    fn parses_partial_documents() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "providers": {
                    "openai": { "apiKey": "sk-test", "priority": 5 }
                },
                "routing": { "fallbackEnabled": false }
            }"#,
        )
        .unwrap();
        let openai = config.provider("openai").unwrap();
        assert_eq!(openai.api_key, "sk-test");
        assert_eq!(openai.priority, 5);
        assert_eq!(openai.timeout_seconds, 30);
        assert!(!config.routing.fallback_enabled);
        assert_eq!(config.rate_limit.requests_per_minute, 60);
    }

    #[test]
    fn debug_redacts_api_key() {
        let settings = ProviderSettings {
            api_key: "sk-secret".to_string(),
            ..ProviderSettings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
