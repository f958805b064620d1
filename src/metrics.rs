//! Process-local counters rendered in Prometheus text format.
//!
//! Series cardinality is bounded: labels are provider names and fixed
//! operation strings, never caller-controlled values.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    requests_by_operation: BTreeMap<String, u64>,
    request_errors_by_operation: BTreeMap<String, u64>,
    rate_limited_total: u64,
    cache_hits_total: u64,
    cache_misses_total: u64,
    cache_stores_total: u64,
    provider_requests: BTreeMap<(String, &'static str), u64>,
    provider_latency_ms_sum: BTreeMap<String, u64>,
    provider_latency_count: BTreeMap<String, u64>,
    retries_by_provider: BTreeMap<String, u64>,
    fallbacks_by_provider: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner(&self, f: impl FnOnce(&mut Inner)) {
        if let Ok(mut inner) = self.inner.lock() {
            f(&mut inner);
        }
    }

    pub fn record_request(&self, operation: &str) {
        self.with_inner(|inner| {
            *inner
                .requests_by_operation
                .entry(operation.to_string())
                .or_default() += 1;
        });
    }

    pub fn record_request_error(&self, operation: &str) {
        self.with_inner(|inner| {
            *inner
                .request_errors_by_operation
                .entry(operation.to_string())
                .or_default() += 1;
        });
    }

    pub fn record_rate_limited(&self) {
        self.with_inner(|inner| inner.rate_limited_total += 1);
    }

    pub fn record_cache_hit(&self) {
        self.with_inner(|inner| inner.cache_hits_total += 1);
    }

    pub fn record_cache_miss(&self) {
        self.with_inner(|inner| inner.cache_misses_total += 1);
    }

    pub fn record_cache_store(&self) {
        self.with_inner(|inner| inner.cache_stores_total += 1);
    }

    pub fn record_provider_request(&self, provider: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.with_inner(|inner| {
            *inner
                .provider_requests
                .entry((provider.to_string(), status))
                .or_default() += 1;
        });
    }

    pub fn record_provider_latency_ms(&self, provider: &str, latency_ms: u64) {
        self.with_inner(|inner| {
            *inner
                .provider_latency_ms_sum
                .entry(provider.to_string())
                .or_default() += latency_ms;
            *inner
                .provider_latency_count
                .entry(provider.to_string())
                .or_default() += 1;
        });
    }

    pub fn record_retry(&self, provider: &str) {
        self.with_inner(|inner| {
            *inner
                .retries_by_provider
                .entry(provider.to_string())
                .or_default() += 1;
        });
    }

    pub fn record_fallback(&self, from_provider: &str) {
        self.with_inner(|inner| {
            *inner
                .fallbacks_by_provider
                .entry(from_provider.to_string())
                .or_default() += 1;
        });
    }

    /// Render every series in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let Ok(inner) = self.inner.lock() else {
            return String::new();
        };
        let mut out = String::new();

        let _ = writeln!(
            out,
            "# TYPE gateway_requests_total counter"
        );
        for (operation, count) in &inner.requests_by_operation {
            let _ = writeln!(
                out,
                "gateway_requests_total{{operation=\"{operation}\"}} {count}"
            );
        }
        let _ = writeln!(out, "# TYPE gateway_request_errors_total counter");
        for (operation, count) in &inner.request_errors_by_operation {
            let _ = writeln!(
                out,
                "gateway_request_errors_total{{operation=\"{operation}\"}} {count}"
            );
        }
        let _ = writeln!(out, "# TYPE gateway_rate_limited_total counter");
        let _ = writeln!(out, "gateway_rate_limited_total {}", inner.rate_limited_total);
        let _ = writeln!(out, "# TYPE gateway_cache_hits_total counter");
        let _ = writeln!(out, "gateway_cache_hits_total {}", inner.cache_hits_total);
        let _ = writeln!(out, "# TYPE gateway_cache_misses_total counter");
        let _ = writeln!(out, "gateway_cache_misses_total {}", inner.cache_misses_total);
        let _ = writeln!(out, "# TYPE gateway_cache_stores_total counter");
        let _ = writeln!(out, "gateway_cache_stores_total {}", inner.cache_stores_total);

        let _ = writeln!(out, "# TYPE gateway_provider_requests_total counter");
        for ((provider, status), count) in &inner.provider_requests {
            let _ = writeln!(
                out,
                "gateway_provider_requests_total{{provider=\"{provider}\",status=\"{status}\"}} {count}"
            );
        }
        let _ = writeln!(out, "# TYPE gateway_provider_latency_ms_sum counter");
        for (provider, sum) in &inner.provider_latency_ms_sum {
            let _ = writeln!(
                out,
                "gateway_provider_latency_ms_sum{{provider=\"{provider}\"}} {sum}"
            );
        }
        let _ = writeln!(out, "# TYPE gateway_provider_latency_ms_count counter");
        for (provider, count) in &inner.provider_latency_count {
            let _ = writeln!(
                out,
                "gateway_provider_latency_ms_count{{provider=\"{provider}\"}} {count}"
            );
        }
        let _ = writeln!(out, "# TYPE gateway_retries_total counter");
        for (provider, count) in &inner.retries_by_provider {
            let _ = writeln!(
                out,
                "gateway_retries_total{{provider=\"{provider}\"}} {count}"
            );
        }
        let _ = writeln!(out, "# TYPE gateway_fallbacks_total counter");
        for (provider, count) in &inner.fallbacks_by_provider {
            let _ = writeln!(
                out,
                "gateway_fallbacks_total{{from=\"{provider}\"}} {count}"
            );
        }

        out
    }
}
