//! Error types for the LLM client layer.
//!
//! Every failure is classified so the dispatcher can decide whether a retry
//! is worthwhile: transient errors (timeouts, throttling, server hiccups) are
//! retried with backoff, fatal errors (bad credentials, exhausted quota)
//! surface immediately, and malformed responses get exactly one re-prompt.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors produced by providers and the dispatcher.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Unknown provider name passed to [`crate::Provider::from_name`].
    #[error("unknown LLM provider: {0:?} (expected \"openai\" or \"deepseek\")")]
    UnknownProvider(String),

    /// The provider's API key environment variable is missing or empty.
    #[error("missing API key: environment variable {0} is not set")]
    MissingApiKey(&'static str),

    /// HTTP transport failure (connection refused, DNS, TLS, ...).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status from the provider.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The call did not complete within the per-call timeout.
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    /// Response was received but could not be parsed as the expected JSON,
    /// even after the single re-prompt.
    #[error("malformed LLM response in phase {phase}: {detail}")]
    MalformedResponse { phase: String, detail: String },

    /// All retry attempts were exhausted.
    #[error("LLM call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<LlmError>,
    },

    /// The pipeline's cancellation flag was raised.
    #[error("cancelled before LLM call in phase {0}")]
    Cancelled(String),
}

impl LlmError {
    /// Whether a retry with backoff has a chance of succeeding.
    ///
    /// Timeouts, throttling (429) and server-side errors (5xx) are transient.
    /// Authentication and billing failures (401/402/403) never recover on
    /// retry, and neither do client-side request errors (4xx other than 429).
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) => true,
            LlmError::Transport(e) => !e.is_builder() && !e.is_decode(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the error should abort the whole pipeline rather than let the
    /// current phase degrade. Mirrors the provider-side conditions that can
    /// never be fixed mid-run: credentials and billing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LlmError::MissingApiKey(_)
                | LlmError::UnknownProvider(_)
                | LlmError::Api {
                    status: 401 | 402 | 403,
                    ..
                }
        )
    }
}
