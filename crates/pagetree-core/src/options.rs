//! Configuration options for a pipeline run.

use serde::{Deserialize, Serialize};

/// Knobs controlling a [`crate::build_tree`] run. All fields have defaults;
/// construct with `BuildOptions::default()` and override what you need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Model name forwarded to the LLM client. `None` uses the provider
    /// default.
    pub model: Option<String>,

    /// Number of leading pages scanned for a printed contents page.
    pub toc_check_pages: usize,

    /// Page span above which a childless node may be recursed into.
    pub max_pages_per_node: usize,

    /// Token budget for recursion and content-based segmentation.
    pub max_tokens_per_node: usize,

    /// Cap on the number of items verified in phase 5.
    pub max_verify_count: usize,

    /// Semaphore width for verification and gap-fill fan-out.
    pub verification_concurrency: usize,

    /// Disables recursive processing of oversized nodes.
    pub no_recursive: bool,

    /// Run verification even when the document exceeds
    /// `large_pdf_threshold` pages.
    pub force_verification: bool,

    /// Page count above which verification is skipped by default.
    pub large_pdf_threshold: usize,

    /// Attach `node_id` strings to every node.
    pub if_add_node_id: bool,

    /// Attach the node's page-range text slice.
    pub if_add_node_text: bool,

    /// Attach an LLM-generated summary per node.
    pub if_add_node_summary: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            model: None,
            toc_check_pages: 20,
            max_pages_per_node: 10,
            max_tokens_per_node: 20_000,
            max_verify_count: 100,
            verification_concurrency: 20,
            no_recursive: false,
            force_verification: false,
            large_pdf_threshold: 200,
            if_add_node_id: true,
            if_add_node_text: false,
            if_add_node_summary: false,
        }
    }
}
