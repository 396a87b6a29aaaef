//! Bounded-concurrency LLM dispatcher.
//!
//! Every call the pipeline makes goes through one dispatcher instance, which
//! enforces the shared semaphore, the per-call timeout, and the retry policy,
//! and records per-phase metrics for the performance report. Calls are tagged
//! with the pipeline phase that issued them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::error::{LlmError, Result};
use crate::json::{ensure_json_keyword, extract_json};
use crate::providers::{ChatCompletion, LlmChatClient};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// One chat exchange to dispatch.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Per-phase call accounting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PhaseStats {
    pub calls: u32,
    pub retries: u32,
    pub failures: u32,
    pub total_tokens: u64,
}

/// Snapshot of dispatcher metrics across all phases.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatchStats {
    pub by_phase: HashMap<String, PhaseStats>,
}

impl DispatchStats {
    pub fn total_calls(&self) -> u32 {
        self.by_phase.values().map(|s| s.calls).sum()
    }

    pub fn total_retries(&self) -> u32 {
        self.by_phase.values().map(|s| s.retries).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.by_phase.values().map(|s| s.total_tokens).sum()
    }
}

/// Semaphore-capped dispatcher with retry, timeout and metrics.
#[derive(Debug, Clone)]
pub struct LlmDispatcher {
    client: Arc<dyn LlmChatClient>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    max_attempts: u32,
    cancel: CancelFlag,
    stats: Arc<RwLock<DispatchStats>>,
}

impl LlmDispatcher {
    pub fn new(client: Arc<dyn LlmChatClient>, max_concurrency: usize) -> Self {
        Self {
            client,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cancel: CancelFlag::new(),
            stats: Arc::new(RwLock::new(DispatchStats::default())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }

    /// Dispatch a plain-text completion tagged with `phase`.
    pub async fn chat(&self, phase: &str, request: &ChatRequest) -> Result<String> {
        self.execute(phase, request, false)
            .await
            .map(|completion| completion.content)
    }

    /// Dispatch a JSON-mode completion and parse the result strictly.
    ///
    /// The prompt is guaranteed to contain the literal token "json" before it
    /// is sent. A response that fails to parse triggers exactly one re-prompt
    /// with a sharpened instruction; a second failure surfaces as
    /// [`LlmError::MalformedResponse`].
    pub async fn chat_json(&self, phase: &str, request: &ChatRequest) -> Result<Value> {
        let json_request = ChatRequest {
            system: request.system.clone(),
            user: ensure_json_keyword(&request.user),
            max_tokens: request.max_tokens,
        };

        let completion = self.execute(phase, &json_request, true).await?;
        if let Some(value) = extract_json(&completion.content) {
            return Ok(value);
        }

        warn!(
            phase,
            preview = &completion.content[..completion.content.len().min(120)],
            "unparseable JSON response, re-prompting once"
        );

        let retry_request = ChatRequest {
            system: json_request.system.clone(),
            user: format!(
                "{}\n\nYour previous reply was not valid JSON. Respond with a \
                 single valid JSON value and nothing else.",
                json_request.user
            ),
            max_tokens: json_request.max_tokens,
        };

        let completion = self.execute(phase, &retry_request, true).await?;
        extract_json(&completion.content).ok_or_else(|| LlmError::MalformedResponse {
            phase: phase.to_string(),
            detail: format!(
                "unparseable after re-prompt: {}",
                &completion.content[..completion.content.len().min(200)]
            ),
        })
    }

    /// Run one call through the semaphore with timeout and bounded retry.
    async fn execute(
        &self,
        phase: &str,
        request: &ChatRequest,
        json_mode: bool,
    ) -> Result<ChatCompletion> {
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(LlmError::Cancelled(phase.to_string()));
            }

            attempt += 1;
            let start = Instant::now();

            let result = self.call_once(request, json_mode).await;

            match result {
                Ok(completion) => {
                    debug!(
                        phase,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        tokens = completion.total_tokens,
                        "LLM call complete"
                    );
                    let mut stats = self.stats.write().await;
                    let entry = stats.by_phase.entry(phase.to_string()).or_default();
                    entry.calls += 1;
                    entry.total_tokens += completion.total_tokens as u64;
                    return Ok(completion);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        phase,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient LLM failure, backing off"
                    );
                    {
                        let mut stats = self.stats.write().await;
                        stats.by_phase.entry(phase.to_string()).or_default().retries += 1;
                    }
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let mut stats = self.stats.write().await;
                    let entry = stats.by_phase.entry(phase.to_string()).or_default();
                    entry.calls += 1;
                    entry.failures += 1;
                    drop(stats);

                    return if attempt > 1 {
                        Err(LlmError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        })
                    } else {
                        Err(e)
                    };
                }
            }
        }
    }

    async fn call_once(&self, request: &ChatRequest, json_mode: bool) -> Result<ChatCompletion> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("dispatcher semaphore closed");

        match tokio::time::timeout(
            self.timeout,
            self.client.chat_completion(
                &request.system,
                &request.user,
                request.max_tokens,
                json_mode,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }
}
