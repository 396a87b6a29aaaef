//! Error types for the extraction pipeline.
//!
//! Most failure modes degrade in place (bad pages become empty text, failed
//! items keep approximate ranges, invariant violations are auto-repaired and
//! logged). Only the conditions in this enum reach the caller.

use thiserror::Error;

use pagetree_llm::LlmError;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PageTreeError>;

/// Errors surfaced to the caller of [`crate::build_tree`].
#[derive(Error, Debug)]
pub enum PageTreeError {
    /// The PDF could not be opened at all (I/O failure, not a PDF, encrypted
    /// without a usable text layer at the document level).
    #[error("failed to open PDF: {0}")]
    PdfOpen(#[from] lopdf::Error),

    /// Source path could not be read.
    #[error("failed to read PDF source: {0}")]
    Io(#[from] std::io::Error),

    /// The document reports zero pages.
    #[error("document has no pages")]
    EmptyDocument,

    /// Fatal LLM-layer failure (bad credentials, unknown provider, or all
    /// retries exhausted on a required call).
    #[error("LLM failure in phase {phase}: {source}")]
    Llm {
        phase: String,
        #[source]
        source: LlmError,
    },

    /// Serialization of the output envelope failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PageTreeError {
    pub fn llm(phase: impl Into<String>, source: LlmError) -> Self {
        Self::Llm {
            phase: phase.into(),
            source,
        }
    }
}
