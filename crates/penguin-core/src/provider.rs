// Provider adapter seam
//
// Providers are external collaborators. The core fixes one interface:
// open a stream for an API view and a model binding, get chunks back.
// The replay adapter ships here so examples and integration tests can
// drive the full engine without a network.

use async_trait::async_trait;
use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::message::{Message, MessageRole};
use crate::streaming::ProviderChunk;

/// Provider + model + sampling parameters bound to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    /// Provider key (e.g. "anthropic", "openai", "replay")
    pub provider: String,
    /// Model identifier
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// The model's context window, consumed by the budget allocator
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

fn default_context_window() -> usize {
    128_000
}

impl ModelBinding {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_output_tokens: None,
            context_window: default_context_window(),
        }
    }

    /// Binding for the in-process replay adapter (tests, demos)
    pub fn replay() -> Self {
        Self::new("replay", "replay-1")
    }
}

/// One message in the exact sequence sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: MessageRole,
    pub content: String,
}

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        ApiMessage {
            role: msg.role,
            content: msg.content.to_provider_string(),
        }
    }
}

/// Provider failure classification; drives the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Transport failure or HTTP 5xx; retry may succeed
    Network,
    /// Provider backpressure; retry after a delay
    RateLimited,
    /// Credential rejection; never retried
    Auth,
    /// Malformed request or unsupported model; never retried
    Invalid,
}

/// A provider-level failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Auth,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Network | ProviderErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Boxed chunk stream returned by adapters
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderChunk> + Send>>;

/// The adapter interface every provider gateway implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Open a streaming completion for the given API view
    async fn open_stream(
        &self,
        api_view: Vec<ApiMessage>,
        binding: &ModelBinding,
    ) -> Result<ChunkStream, ProviderError>;
}

/// Maps provider keys from model bindings to adapter instances
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: std::sync::RwLock<std::collections::HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .expect("provider registry lock poisoned")
            .insert(key.into(), adapter);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .expect("provider registry lock poisoned")
            .get(key)
            .cloned()
    }
}

/// Exponential backoff with jitter for provider retries.
/// attempt is zero-based: 0 → ~500ms, 1 → ~1s, 2 → ~2s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1u64 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Default retry budget for retryable provider errors
pub const PROVIDER_RETRY_ATTEMPTS: u32 = 3;

// ============================================================================
// Replay adapter - scripted streams for tests and demos
// ============================================================================

/// One scripted response to an `open_stream` call
pub enum ReplayScript {
    /// Yield these chunks in order
    Chunks(Vec<ProviderChunk>),
    /// Fail the open itself
    ConnectError(ProviderError),
}

impl ReplayScript {
    /// A plain text response that ends normally
    pub fn text(text: impl Into<String>) -> Self {
        ReplayScript::Chunks(vec![
            ProviderChunk::TextDelta(text.into()),
            ProviderChunk::End,
        ])
    }
}

/// Scripted provider: each `open_stream` call pops the next script.
/// When the scripts run out it replies with an empty completed stream.
pub struct ReplayAdapter {
    scripts: Mutex<VecDeque<ReplayScript>>,
}

impl ReplayAdapter {
    pub fn new(scripts: Vec<ReplayScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
        }
    }

    /// Single text response convenience constructor
    pub fn single(text: impl Into<String>) -> Self {
        Self::new(vec![ReplayScript::text(text)])
    }

    /// Scripts left unconsumed
    pub fn remaining(&self) -> usize {
        self.scripts.lock().expect("replay lock poisoned").len()
    }
}

#[async_trait]
impl ProviderAdapter for ReplayAdapter {
    async fn open_stream(
        &self,
        _api_view: Vec<ApiMessage>,
        _binding: &ModelBinding,
    ) -> Result<ChunkStream, ProviderError> {
        let script = self
            .scripts
            .lock()
            .expect("replay lock poisoned")
            .pop_front();

        match script {
            Some(ReplayScript::Chunks(chunks)) => Ok(Box::pin(futures::stream::iter(chunks))),
            Some(ReplayScript::ConnectError(err)) => Err(err),
            None => Ok(Box::pin(futures::stream::iter(vec![ProviderChunk::End]))),
        }
    }
}
