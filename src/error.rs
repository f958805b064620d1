use thiserror::Error;

/// Messages matching one of these substrings are treated as retryable even
/// when the error arrived unclassified. Structural classification on the
/// variant is checked first; this is only the fallback.
const RETRYABLE_FRAGMENTS: &[&str] = &["timeout", "connection", "502", "503", "504", "429"];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("provider {provider} does not support {operation}")]
    CapabilityUnsupported {
        provider: String,
        operation: &'static str,
    },
    #[error("no available providers for request")]
    NoProvidersAvailable,
    #[error("{provider} request timed out")]
    UpstreamTimeout { provider: String },
    #[error("{provider} connection failed: {message}")]
    UpstreamTransport { provider: String, message: String },
    #[error("{provider} returned server error {status}")]
    UpstreamServer { provider: String, status: u16 },
    #[error("{provider} throttled the request (429)")]
    UpstreamThrottled { provider: String },
    #[error("{provider} rejected the request ({status}): {body}")]
    UpstreamClient {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("provider {provider} is unavailable")]
    ProviderUnavailable { provider: String },
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable error code reported in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::RateLimited => "rate_limit_exceeded",
            Self::CapabilityUnsupported { .. } => "capability_unsupported",
            Self::NoProvidersAvailable => "no_providers_available",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamTransport { .. } => "upstream_transport",
            Self::UpstreamServer { .. } => "upstream_server_error",
            Self::UpstreamThrottled { .. } => "upstream_throttled",
            Self::UpstreamClient { .. } => "upstream_client_error",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::InvalidResponse(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the router may retry the same provider after this error.
    ///
    /// Timeouts, transport failures, upstream 5xx and upstream 429 retry.
    /// Everything else retries only if its rendered message contains one of
    /// the legacy fragments (`timeout`, `connection`, `502`, `503`, `504`,
    /// `429`). A breaker short-circuit (`ProviderUnavailable`) never
    /// matches: it falls through to the next candidate instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTimeout { .. }
            | Self::UpstreamTransport { .. }
            | Self::UpstreamServer { .. }
            | Self::UpstreamThrottled { .. } => true,
            other => {
                let message = other.to_string().to_lowercase();
                RETRYABLE_FRAGMENTS.iter().any(|f| message.contains(f))
            }
        }
    }

    /// Classify a transport-layer failure from the HTTP client.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::UpstreamTimeout {
                provider: provider.to_string(),
            };
        }
        Self::UpstreamTransport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    /// Classify a non-2xx upstream status.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        if status == 429 {
            return Self::UpstreamThrottled {
                provider: provider.to_string(),
            };
        }
        if status >= 500 {
            return Self::UpstreamServer {
                provider: provider.to_string(),
                status,
            };
        }
        Self::UpstreamClient {
            provider: provider.to_string(),
            status,
            body,
        }
    }
}
