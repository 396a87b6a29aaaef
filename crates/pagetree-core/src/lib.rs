//! pagetree-core: PDF to hierarchical table-of-contents tree extraction.
//!
//! Turns a PDF into a tree in which every node carries a title, a contiguous
//! 1-based page range, and optional text/summary payload. The tree is the
//! index for a "vectorless" retrieval scheme: downstream consumers navigate
//! it by reasoning over titles and summaries instead of embedding similarity.
//!
//! # Pipeline
//!
//! Seven phases with two early-exit fast paths:
//!
//! 1. PDF parsing: lazy per-page text with `<physical_index_N>` markers
//! 2. TOC source selection: embedded outline, printed contents page, or
//!    content reconstruction
//! 3. Structure extraction: flat ordered items with dotted structure codes
//! 4. Page mapping: resolve each item's physical page, correct offsets
//! 5. Verification and repair: deepest-first existence checks, self-healing
//! 6. Tree building: start/end arithmetic, nesting, depth cap, recursion
//! 7. Gap filling: supplementary sub-trees for uncovered page runs
//!
//! The entry point is [`build_tree`]; see [`options::BuildOptions`] for the
//! knobs and [`model::IndexOutput`] for the output contract.
//!
//! The crate writes nothing to disk and installs no tracing subscriber.

pub mod error;
pub mod matching;
pub mod model;
pub mod options;
pub mod pdf;
pub mod perf;
pub mod pipeline;
pub mod progress;
pub mod structure;
pub mod tree;

pub use error::{PageTreeError, Result};
pub use model::{GapFillInfo, IndexOutput, PdfSource, TocItem, TreeNode, TreeStatistics};
pub use options::BuildOptions;
pub use pipeline::{build_tree, TreePipeline};
pub use progress::ProgressCallback;

pub use pagetree_llm::{CancelFlag, LlmChatClient, LlmDispatcher, Provider};
