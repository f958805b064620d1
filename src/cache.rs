//! Response cache keyed by a deterministic request fingerprint.
//!
//! The fingerprint covers model, temperature, and the ordered role:content
//! pairs, nothing else. Two requests differing only in top-p, penalties,
//! max-tokens, or user share a cache entry. Entries live either in Redis
//! (keys prefixed `ai:cache:`) or in a process-local TTL map.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};

use crate::config::CacheSettings;
use crate::metrics::Metrics;
use crate::types::{ChatRequest, ChatResponse, GatewayMetadata};
use crate::{GatewayError, Result};

pub const CACHE_PREFIX: &str = "ai:cache:";

/// Leading 32 hex characters of SHA-256 over the canonical request string.
pub fn fingerprint(request: &ChatRequest) -> String {
    let mut canonical = String::new();
    canonical.push_str(request.model.as_deref().unwrap_or("default"));
    canonical.push('|');
    let _ = write!(canonical, "{}", request.temperature_or_default());
    canonical.push('|');
    for message in &request.messages {
        let _ = write!(canonical, "{}:{}|", message.role.as_str(), message.content);
    }

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

pub fn cache_key(request: &ChatRequest) -> String {
    format!("{CACHE_PREFIX}{}", fingerprint(request))
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    /// Delete every key matching a `*`-glob over the full key.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Process-local store used when no Redis URL is configured.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    max_size: usize,
}

impl MemoryStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: max_size.max(1),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| GatewayError::Internal("cache lock poisoned".to_string()))?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| GatewayError::Internal("cache lock poisoned".to_string()))?;
        if entries.len() >= self.max_size && !entries.contains_key(key) {
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.max_size {
                tracing::debug!(key, "cache full, dropping store");
                return Ok(());
            }
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| GatewayError::Internal("cache lock poisoned".to_string()))?;
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        Ok((before - entries.len()) as u64)
    }
}

/// Shared external store; concurrency is delegated to Redis itself.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| GatewayError::Internal(format!("redis client: {err}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| GatewayError::Internal(format!("redis connection: {err}")))
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(key)
            .await
            .map_err(|err| GatewayError::Internal(format!("redis get: {err}")))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|err| GatewayError::Internal(format!("redis set: {err}")))
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn
            .keys(pattern)
            .await
            .map_err(|err| GatewayError::Internal(format!("redis keys: {err}")))?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = conn
            .del(keys)
            .await
            .map_err(|err| GatewayError::Internal(format!("redis del: {err}")))?;
        Ok(deleted)
    }
}

pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    store: Arc<dyn CacheStore>,
    metrics: Arc<Metrics>,
}

impl ResponseCache {
    pub fn new(settings: &CacheSettings, metrics: Arc<Metrics>) -> Result<Self> {
        let store: Arc<dyn CacheStore> = match settings.redis_url.as_deref() {
            Some(url) => Arc::new(RedisStore::new(url)?),
            None => Arc::new(MemoryStore::new(settings.max_size)),
        };
        Ok(Self {
            enabled: settings.enabled,
            ttl: Duration::from_secs(settings.ttl_seconds),
            store,
            metrics,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_store(
        settings: &CacheSettings,
        store: Arc<dyn CacheStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            enabled: settings.enabled,
            ttl: Duration::from_secs(settings.ttl_seconds),
            store,
            metrics,
        }
    }

    /// Cache lookup for non-stream chat requests. A hit comes back with
    /// `cached = true` stamped on the gateway metadata.
    pub async fn lookup(&self, request: &ChatRequest) -> Option<ChatResponse> {
        if !self.enabled || request.stream {
            return None;
        }
        let key = cache_key(request);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.metrics.record_cache_miss();
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cache read failed");
                self.metrics.record_cache_miss();
                return None;
            }
        };

        match serde_json::from_str::<ChatResponse>(&raw) {
            Ok(mut response) => {
                match response.gateway.as_mut() {
                    Some(gateway) => gateway.cached = true,
                    None => {
                        response.gateway = Some(GatewayMetadata {
                            cached: true,
                            ..GatewayMetadata::default()
                        });
                    }
                }
                self.metrics.record_cache_hit();
                tracing::debug!(key, "cache hit");
                Some(response)
            }
            Err(err) => {
                tracing::error!(key, error = %err, "failed to deserialize cached response");
                None
            }
        }
    }

    /// Store a routed response. Streaming requests, empty responses, and
    /// error responses are never cached.
    pub async fn store(&self, request: &ChatRequest, response: &ChatResponse) {
        if !self.enabled || request.stream {
            return;
        }
        if response.choices.is_empty()
            || response
                .choices
                .iter()
                .any(|choice| choice.finish_reason.as_deref() == Some("error"))
        {
            return;
        }

        let key = cache_key(request);
        let serialized = match serde_json::to_string(response) {
            Ok(serialized) => serialized,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize response for caching");
                return;
            }
        };
        match self.store.set(&key, serialized, self.ttl).await {
            Ok(()) => {
                self.metrics.record_cache_store();
                tracing::debug!(key, "cached response");
            }
            Err(err) => tracing::warn!(key, error = %err, "cache store failed"),
        }
    }

    /// Bulk-delete entries whose key matches `ai:cache:<pattern>`.
    pub async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let full = format!("{CACHE_PREFIX}{pattern}");
        self.store.delete_matching(&full).await
    }
}

/// Minimal `*`-only glob, the subset Redis `KEYS` patterns use here.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut remainder = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Choice};

    fn request(model: &str, content: &str) -> ChatRequest {
        ChatRequest {
            model: Some(model.to_string()),
            messages: vec![ChatMessage::user(content)],
            ..ChatRequest::default()
        }
    }

    fn response_with(content: &str) -> ChatResponse {
        ChatResponse {
            id: "resp-1".to_string(),
            object: "chat.completion".to_string(),
            created: 1,
            model: "gpt-4o-mini".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Some(ChatMessage::assistant(content)),
                delta: None,
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
            gateway: Some(GatewayMetadata {
                provider: "openai".to_string(),
                request_id: "req-1".to_string(),
                ..GatewayMetadata::default()
            }),
        }
    }

    fn cache() -> ResponseCache {
        ResponseCache::with_store(
            &CacheSettings::default(),
            Arc::new(MemoryStore::new(100)),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn fingerprint_is_32_hex_chars() {
        let fp = fingerprint(&request("gpt-4o-mini", "Hi"));
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_non_semantic_fields() {
        let base = request("gpt-4o-mini", "Hi");
        let mut variant = base.clone();
        variant.top_p = Some(0.5);
        variant.frequency_penalty = Some(1.0);
        variant.presence_penalty = Some(1.0);
        variant.max_tokens = Some(32);
        variant.user = Some("someone".to_string());
        assert_eq!(fingerprint(&base), fingerprint(&variant));
    }

    #[test]
    fn fingerprint_keys_on_model_temperature_and_messages() {
        let base = request("gpt-4o-mini", "Hi");

        let mut other_model = base.clone();
        other_model.model = Some("gpt-4o".to_string());
        assert_ne!(fingerprint(&base), fingerprint(&other_model));

        let mut other_temp = base.clone();
        other_temp.temperature = Some(0.9);
        assert_ne!(fingerprint(&base), fingerprint(&other_temp));

        let other_content = request("gpt-4o-mini", "Bye");
        assert_ne!(fingerprint(&base), fingerprint(&other_content));
    }

    #[test]
    fn explicit_default_temperature_matches_omitted() {
        let base = request("gpt-4o-mini", "Hi");
        let mut explicit = base.clone();
        explicit.temperature = Some(0.7);
        assert_eq!(fingerprint(&base), fingerprint(&explicit));
    }

    #[test]
    fn missing_model_fingerprints_as_default() {
        let mut no_model = request("x", "Hi");
        no_model.model = None;
        let fp = fingerprint(&no_model);
        assert_eq!(fp.len(), 32);
    }

    #[tokio::test]
    async fn round_trip_stamps_cached_flag() {
        let cache = cache();
        let request = request("gpt-4o-mini", "Hi");

        assert!(cache.lookup(&request).await.is_none());
        cache.store(&request, &response_with("Hello")).await;

        let hit = cache.lookup(&request).await.expect("cache hit");
        assert!(hit.gateway.as_ref().unwrap().cached);
        assert_eq!(
            hit.choices[0].message.as_ref().unwrap().content,
            "Hello"
        );
    }

    #[tokio::test]
    async fn refuses_to_cache_streaming_empty_and_error_responses() {
        let cache = cache();

        let mut streaming = request("gpt-4o-mini", "Hi");
        streaming.stream = true;
        cache.store(&streaming, &response_with("Hello")).await;
        streaming.stream = false;
        assert!(cache.lookup(&streaming).await.is_none());

        let plain = request("gpt-4o-mini", "empty");
        let empty = ChatResponse {
            choices: Vec::new(),
            ..response_with("ignored")
        };
        cache.store(&plain, &empty).await;
        assert!(cache.lookup(&plain).await.is_none());

        let errored = request("gpt-4o-mini", "error");
        let mut error_response = response_with("boom");
        error_response.choices[0].finish_reason = Some("error".to_string());
        cache.store(&errored, &error_response).await;
        assert!(cache.lookup(&errored).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_supports_glob_patterns() {
        let cache = cache();
        let first = request("gpt-4o-mini", "one");
        let second = request("gpt-4o-mini", "two");
        cache.store(&first, &response_with("1")).await;
        cache.store(&second, &response_with("2")).await;

        let cleared = cache.invalidate("*").await.unwrap();
        assert_eq!(cleared, 2);
        assert!(cache.lookup(&first).await.is_none());
    }

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new(10);
        store
            .set("ai:cache:k", "v".to_string(), Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.get("ai:cache:k").await.unwrap(), None);
    }

    #[test]
    fn glob_matcher() {
        assert!(glob_match("ai:cache:*", "ai:cache:abc123"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("ai:cache:ab*23", "ai:cache:abc123"));
        assert!(!glob_match("ai:cache:zz*", "ai:cache:abc123"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact-not"));
    }
}
