pub mod claude;
pub mod gemini;
pub mod openai;
pub mod worker;

pub use claude::Claude;
pub use gemini::Gemini;
pub use openai::OpenAI;
pub use worker::LocalWorker;

use std::sync::Arc;

use crate::config::{
    GatewayConfig, PROVIDER_CLAUDE, PROVIDER_GEMINI, PROVIDER_LOCAL_WORKER, PROVIDER_OPENAI,
};
use crate::metrics::Metrics;
use crate::provider::AiProvider;
use crate::types::{GatewayMetadata, Usage};

/// Construct every adapter named in configuration. Adapters with missing
/// credentials are still constructed; they simply report unavailable.
pub fn build_providers(config: &GatewayConfig, metrics: Arc<Metrics>) -> Vec<Arc<dyn AiProvider>> {
    let mut providers: Vec<Arc<dyn AiProvider>> = Vec::new();
    if let Some(settings) = config.provider(PROVIDER_OPENAI) {
        providers.push(Arc::new(OpenAI::new(settings, metrics.clone())));
    }
    if let Some(settings) = config.provider(PROVIDER_GEMINI) {
        providers.push(Arc::new(Gemini::new(settings, metrics.clone())));
    }
    if let Some(settings) = config.provider(PROVIDER_CLAUDE) {
        providers.push(Arc::new(Claude::new(settings, metrics.clone())));
    }
    if let Some(settings) = config.provider(PROVIDER_LOCAL_WORKER) {
        providers.push(Arc::new(LocalWorker::new(settings, metrics.clone())));
    }
    providers
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

pub(crate) fn base_metadata(
    provider: &str,
    model_hint: Option<&str>,
    latency_ms: u64,
    request_id: String,
) -> GatewayMetadata {
    GatewayMetadata {
        provider: provider.to_string(),
        original_model: model_hint.map(str::to_string),
        latency_ms,
        cached: false,
        retry_count: 0,
        request_id,
        estimated_cost: None,
    }
}

pub(crate) fn estimate_cost(
    usage: Option<&Usage>,
    input_cost_per_token: f64,
    output_cost_per_token: f64,
) -> f64 {
    let Some(usage) = usage else {
        return 0.0;
    };
    let input = f64::from(usage.prompt_tokens.unwrap_or(0)) * input_cost_per_token;
    let output = f64::from(usage.completion_tokens.unwrap_or(0)) * output_cost_per_token;
    input + output
}

pub(crate) fn patterns_or_default(configured: &[String], defaults: &[&str]) -> Vec<String> {
    if configured.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        configured.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "/models"),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            join_url("https://api.openai.com/v1", "/models"),
            "https://api.openai.com/v1/models"
        );
    }

    #[test]
    fn cost_estimate_uses_both_sides_of_usage() {
        let usage = Usage::with_total(Some(1000), Some(500));
        let cost = estimate_cost(Some(&usage), 0.000_001, 0.000_002);
        assert!((cost - 0.002).abs() < 1e-9);
        assert_eq!(estimate_cost(None, 1.0, 1.0), 0.0);
    }
}
