use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::Result;

pub type ChatStream = BoxStream<'static, Result<ChatResponse>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub chat: bool,
    pub chat_stream: bool,
    pub embedding: bool,
}

/// Canonical contract every upstream adapter implements. The router only
/// ever talks to this surface; nothing downcasts to a concrete adapter.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enabled in configuration and, where the upstream needs one, holding
    /// a non-empty credential. Unavailable adapters are never routed to.
    fn available(&self) -> bool;

    /// Stable sort key; lower runs first.
    fn priority(&self) -> i32;

    fn capabilities(&self) -> Capabilities;

    /// Case-insensitive substring patterns this adapter serves.
    fn model_patterns(&self) -> &[String];

    /// A nil hint matches every adapter.
    fn supports_model(&self, model: Option<&str>) -> bool {
        let Some(model) = model else {
            return true;
        };
        let model = model.to_lowercase();
        self.model_patterns()
            .iter()
            .any(|pattern| model.contains(&pattern.to_lowercase()))
    }

    fn advertised_models(&self) -> Vec<String> {
        self.model_patterns().to_vec()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Lazy, non-restartable event sequence. Dropping the stream cancels
    /// the upstream call.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream>;

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Cheap liveness probe, bounded to a few seconds.
    async fn health_check(&self) -> bool;
}

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Gateway-assigned request id, unique within and across process restarts.
pub fn next_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    format!("req-{micros:x}-{seq:04x}")
}

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
