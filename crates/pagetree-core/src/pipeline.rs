//! The pipeline orchestrator.
//!
//! Wires the seven phases together with their two early-exit fast paths,
//! checks the cancellation flag between phases, and guarantees that whatever
//! comes back satisfies the tree invariants: full page coverage, parents
//! covering children, bounded depth, ordered siblings, unique pre-order ids.

use std::collections::HashMap;

use tracing::{info, warn};

use pagetree_llm::{CancelFlag, LlmDispatcher, Provider};

use crate::error::Result;
use crate::model::{GapFillInfo, IndexOutput, PdfSource, TocItem, TreeNode, TreeStatistics};
use crate::options::BuildOptions;
use crate::pdf::PdfParser;
use crate::perf::PerformanceMonitor;
use crate::progress::{ProgressCallback, ProgressReporter};
use crate::structure::extract::ParentContext;
use crate::structure::{PageMapper, StructureExtractor, TocSource, TocSourceDetector, Verifier};
use crate::tree::build::{enforce_forest_depth, expand_parents, repair_invariants};
use crate::tree::{decorate, GapFiller, TreeBuilder};

/// Pages parsed up front before a TOC source is chosen.
const INITIAL_PARSE_PAGES: usize = 30;
/// Pages parsed around each mapped item so verification and the fixer have
/// their neighbourhood available.
const VERIFY_MARGIN: usize = 3;

/// Environment variable selecting the LLM provider for [`build_tree`].
pub const PROVIDER_ENV: &str = "PAGETREE_PROVIDER";

/// Build the TOC tree for a PDF.
///
/// This is the standalone entry point: the provider is selected through the
/// `PAGETREE_PROVIDER` environment variable (`"openai"` by default,
/// `"deepseek"` recognised, anything else fails fast) and its API key is
/// read from the provider's own environment variable. Callers that want
/// progress callbacks, cancellation, or an injected client should construct
/// a [`TreePipeline`] directly.
pub async fn build_tree(
    source: impl Into<PdfSource>,
    options: BuildOptions,
) -> Result<IndexOutput> {
    let provider_name =
        std::env::var(PROVIDER_ENV).unwrap_or_else(|_| "openai".to_string());
    let provider = Provider::from_name(&provider_name)
        .map_err(|e| crate::error::PageTreeError::llm("init", e))?;
    let client = provider
        .client(options.model.as_deref())
        .map_err(|e| crate::error::PageTreeError::llm("init", e))?;

    let dispatcher = LlmDispatcher::new(client, options.verification_concurrency.max(1));
    TreePipeline::new(dispatcher, options).run(source.into()).await
}

/// The orchestrator. Owns the dispatcher, options, cancellation flag and
/// progress reporter for one or more runs.
pub struct TreePipeline {
    llm: LlmDispatcher,
    options: BuildOptions,
    cancel: CancelFlag,
    progress: ProgressReporter,
}

impl TreePipeline {
    pub fn new(llm: LlmDispatcher, options: BuildOptions) -> Self {
        let cancel = CancelFlag::new();
        let llm = llm.with_cancel_flag(cancel.clone());
        Self {
            llm,
            options,
            cancel,
            progress: ProgressReporter::default(),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = ProgressReporter::new(Some(callback));
        self
    }

    /// Flag callers can use to cancel the run; the pipeline stops at the
    /// next checkpoint and returns the best tree produced so far.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(&self, source: PdfSource) -> Result<IndexOutput> {
        let mut perf = PerformanceMonitor::new();
        let source_file = source.display_name();

        // Phase 1: open and lazily parse the leading window.
        perf.start_phase("pdf_parsing");
        self.progress.report("pdf_parsing", "opening document", 0.05);
        let mut parser = PdfParser::open(&source)?;
        let total_pages = parser.total_pages();
        parser.parse_initial(INITIAL_PARSE_PAGES.max(self.options.toc_check_pages));

        // Phase 2: pick the structural source.
        perf.start_phase("toc_detection");
        self.progress.report("toc_detection", "selecting TOC source", 0.15);
        if self.cancelled() {
            return self.finalize(perf, source_file, parser, Vec::new(), 0.0, None, true).await;
        }
        let detector = TocSourceDetector::new(&self.llm);
        let toc_source = detector
            .select(&parser, self.options.toc_check_pages)
            .await?;

        // Phases 3 and 4: flat items with physical pages.
        let extractor = StructureExtractor::new(&self.llm);
        let mapper = PageMapper::new(&self.llm);
        let mut items: Vec<TocItem>;

        match toc_source {
            TocSource::EmbeddedOutline(entries) => {
                info!(entries = entries.len(), "fast path: embedded outline");
                perf.start_phase("structure_extraction");
                items = StructureExtractor::from_outline(&entries);
                perf.start_phase("page_mapping");
                PageMapper::map_from_outline(&mut items, total_pages);
            }
            TocSource::PrintedContents {
                content,
                has_page_numbers,
                ..
            } => {
                perf.start_phase("structure_extraction");
                self.progress
                    .report("structure_extraction", "extracting printed contents", 0.3);
                items = extractor
                    .from_printed_contents(&content, has_page_numbers)
                    .await?;

                perf.start_phase("page_mapping");
                self.progress.report("page_mapping", "resolving pages", 0.45);
                if has_page_numbers {
                    let max_referenced = items.iter().filter_map(|i| i.page).max().unwrap_or(0);
                    parser.parse_range(1, (max_referenced + 1).min(total_pages));
                } else {
                    parser.parse_all();
                }
                if self.cancelled() {
                    return self
                        .finalize(perf, source_file, parser, items, 0.0, None, true)
                        .await;
                }
                mapper.map_pages(&mut items, &parser, has_page_numbers).await?;
            }
            TocSource::ContentAnalysis => {
                perf.start_phase("pdf_parsing");
                parser.parse_all();
                perf.start_phase("structure_extraction");
                self.progress
                    .report("structure_extraction", "reconstructing from body", 0.3);
                items = extractor
                    .from_content(
                        &parser,
                        (1, total_pages),
                        self.options.max_tokens_per_node,
                        None,
                    )
                    .await?;

                perf.start_phase("page_mapping");
                mapper.map_pages(&mut items, &parser, false).await?;
            }
        }

        // Empty extraction: a single node covering the whole document.
        if items.is_empty() {
            warn!("no structure extracted, returning single-node tree");
            return self
                .finalize(perf, source_file, parser, Vec::new(), 1.0, None, false)
                .await;
        }

        // Phase 5: verification and repair.
        perf.start_phase("verification");
        self.progress.report("verification", "verifying mapped titles", 0.6);
        for item in &items {
            if let Some(p) = item.physical_index {
                parser.parse_range(p.saturating_sub(VERIFY_MARGIN), p + VERIFY_MARGIN);
            }
        }
        let outcome = if self.cancelled() {
            return self
                .finalize(perf, source_file, parser, items, 0.0, None, true)
                .await;
        } else {
            Verifier::new(&self.llm)
                .verify(&mut items, &parser, &self.options)
                .await?
        };

        // Phase 6: tree building, then optional recursion into oversized
        // leaves.
        perf.start_phase("tree_building");
        self.progress.report("tree_building", "assembling tree", 0.75);
        let code_by_node = code_lookup(&items);
        let mut roots = TreeBuilder::build(&items, total_pages);

        if !self.options.no_recursive && !self.cancelled() {
            self.recurse_oversized_roots(&mut roots, &mut parser, &code_by_node)
                .await?;
        }

        self.finalize(
            perf,
            source_file,
            parser,
            Vec::new(),
            outcome.accuracy,
            Some(roots),
            false,
        )
        .await
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Recurse into childless nodes whose page span or token estimate is
    /// oversized, extracting their internal structure with the parent's
    /// numbering context.
    async fn recurse_oversized_roots(
        &self,
        roots: &mut [TreeNode],
        parser: &mut PdfParser,
        codes: &HashMap<(String, usize), String>,
    ) -> Result<()> {
        for root in roots.iter_mut() {
            self.recurse_oversized(root, 1, parser, codes).await?;
        }
        Ok(())
    }

    fn recurse_oversized<'a>(
        &'a self,
        node: &'a mut TreeNode,
        depth: usize,
        parser: &'a mut PdfParser,
        codes: &'a HashMap<(String, usize), String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.cancelled() || depth >= crate::tree::build::MAX_DEPTH {
                return Ok(());
            }

            if !node.is_leaf() {
                for child in &mut node.nodes {
                    self.recurse_oversized(child, depth + 1, parser, codes).await?;
                }
                expand_parents(node);
                return Ok(());
            }

            let span = node.end_index.saturating_sub(node.start_index) + 1;
            parser.parse_range(node.start_index, node.end_index);
            let tokens = parser.token_estimate(node.start_index, node.end_index);
            if span <= self.options.max_pages_per_node
                && tokens <= self.options.max_tokens_per_node
            {
                return Ok(());
            }

            info!(
                title = %node.title,
                span,
                tokens,
                "oversized leaf, extracting sub-structure"
            );

            let parent = ParentContext {
                structure: codes
                    .get(&(node.title.clone(), node.start_index))
                    .cloned()
                    .unwrap_or_default(),
                title: node.title.clone(),
            };

            let extractor = StructureExtractor::new(&self.llm);
            let mut sub_items = extractor
                .from_content(
                    parser,
                    (node.start_index, node.end_index),
                    self.options.max_tokens_per_node,
                    Some(&parent),
                )
                .await?;
            if sub_items.is_empty() {
                return Ok(());
            }

            for (i, item) in sub_items.iter_mut().enumerate() {
                item.list_index = Some(i);
            }
            Verifier::new(&self.llm)
                .verify(&mut sub_items, parser, &self.options)
                .await?;

            let mut sub_tree =
                TreeBuilder::build_in_range(&sub_items, node.start_index, node.end_index);

            // The extraction often re-reports the parent's own title page as
            // the first child; drop it.
            if let Some(first) = sub_tree.first() {
                if first.title.trim().eq_ignore_ascii_case(node.title.trim()) {
                    sub_tree.remove(0);
                }
            }
            if sub_tree.is_empty() {
                return Ok(());
            }

            node.nodes = sub_tree;
            for child in &mut node.nodes {
                self.recurse_oversized(child, depth + 1, parser, codes).await?;
            }
            expand_parents(node);
            Ok(())
        })
    }

    /// Shared tail: gap filling, invariant repair, decoration, statistics.
    ///
    /// `roots` of `None` means phase 6 never ran; a tree is then built from
    /// whatever items exist (the best result so far on cancellation), or a
    /// single node covering the document stands in.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        mut perf: PerformanceMonitor,
        source_file: String,
        mut parser: PdfParser,
        items: Vec<TocItem>,
        verification_accuracy: f64,
        roots: Option<Vec<TreeNode>>,
        partial: bool,
    ) -> Result<IndexOutput> {
        let total_pages = parser.total_pages();

        let mut roots = match roots {
            Some(roots) if !roots.is_empty() => roots,
            _ if !items.is_empty() => TreeBuilder::build(&items, total_pages),
            _ => Vec::new(),
        };
        if roots.is_empty() {
            let title = source_file
                .strip_suffix(".pdf")
                .unwrap_or(&source_file)
                .to_string();
            roots.push(TreeNode::new(title, 1, total_pages));
        }

        // Phase 7: gap filling (skipped when cancelled; the fallback node
        // already covers everything).
        perf.start_phase("gap_filling");
        self.progress.report("gap_filling", "checking coverage", 0.85);
        let gap_fill_info = if partial || self.cancelled() {
            let covered = GapFiller::covered_pages(&roots, total_pages);
            GapFillInfo {
                gaps_found: 0,
                gaps_filled: Vec::new(),
                original_coverage: format!("{}/{}", covered.len(), total_pages),
                coverage_percentage: covered.len() as f64 * 100.0 / total_pages.max(1) as f64,
            }
        } else {
            GapFiller::new(&self.llm).fill(&mut roots, &mut parser).await?
        };

        // Invariant safety net, always.
        enforce_forest_depth(&mut roots);
        repair_invariants(&mut roots, total_pages);

        // Payload decoration.
        perf.start_phase("decoration");
        self.progress.report("decoration", "decorating nodes", 0.95);
        if self.options.if_add_node_id {
            decorate::assign_node_ids(&mut roots);
        }
        if self.options.if_add_node_text || self.options.if_add_node_summary {
            parser.parse_all();
        }
        if self.options.if_add_node_text {
            decorate::attach_text(&mut roots, &parser);
        }
        if self.options.if_add_node_summary && !self.cancelled() {
            decorate::attach_summaries(&mut roots, &parser, &self.llm).await?;
        }
        perf.finish_phase();

        let statistics = TreeStatistics::compute(&roots);
        let stats = self.llm.stats().await;
        let partial = partial || self.cancelled();
        let performance = perf.report(&stats, partial);

        self.progress.report("done", "complete", 1.0);
        info!(
            total_nodes = statistics.total_nodes,
            max_depth = statistics.max_depth,
            accuracy = verification_accuracy,
            partial,
            "pipeline complete"
        );

        Ok(IndexOutput {
            source_file,
            total_pages,
            structure: roots,
            statistics,
            verification_accuracy,
            gap_fill_info,
            performance,
        })
    }
}

/// Lookup from `(title, start page)` to structure code, letting the
/// recursion step recover an item's code after tree building discards it.
fn code_lookup(items: &[TocItem]) -> HashMap<(String, usize), String> {
    items
        .iter()
        .filter_map(|item| {
            item.physical_index
                .map(|p| ((item.title.clone(), p), item.structure.clone()))
        })
        .collect()
}
