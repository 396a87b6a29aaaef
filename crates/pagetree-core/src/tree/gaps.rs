//! Gap filling: detect page runs no leaf covers and synthesize
//! supplementary sub-trees for them.
//!
//! After this phase the union of leaf ranges equals the whole document.
//! Trivial gaps (a single page, or pages with no extractable text) get one
//! flat leaf without an LLM round-trip; real gaps get a short LLM-generated
//! TOC converted through the same code synthesiser as everything else.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use pagetree_llm::{ChatRequest, LlmDispatcher};

use crate::error::{PageTreeError, Result};
use crate::model::{GapFillInfo, TocItem, TreeNode};
use crate::pdf::PdfParser;
use crate::structure::codes::CodeSynthesizer;
use crate::tree::build::TreeBuilder;

const PHASE: &str = "gap_filling";

/// Pages per LLM call when a gap is chunked.
const MAX_PAGES_PER_CALL: usize = 20;
/// Content budget per LLM call, in characters.
const MAX_CHARS_PER_CALL: usize = 30_000;
/// A gap-fill node overlapping already-covered pages by at least this
/// fraction is discarded.
const OVERLAP_DISCARD_RATIO: f64 = 0.5;

/// Phase 7 filler.
pub struct GapFiller<'a> {
    llm: &'a LlmDispatcher,
}

impl<'a> GapFiller<'a> {
    pub fn new(llm: &'a LlmDispatcher) -> Self {
        Self { llm }
    }

    /// Pages covered by at least one leaf.
    pub fn covered_pages(roots: &[TreeNode], total_pages: usize) -> BTreeSet<usize> {
        let mut covered = BTreeSet::new();
        let mut leaves = Vec::new();
        for root in roots {
            root.collect_leaves(&mut leaves);
        }
        for leaf in leaves {
            for page in leaf.start_index..=leaf.end_index.min(total_pages) {
                covered.insert(page);
            }
        }
        covered
    }

    /// Uncovered pages coalesced into maximal contiguous `[start, end]` runs.
    pub fn find_gaps(roots: &[TreeNode], total_pages: usize) -> Vec<(usize, usize)> {
        let covered = Self::covered_pages(roots, total_pages);
        let mut gaps = Vec::new();
        let mut run: Option<(usize, usize)> = None;

        for page in 1..=total_pages {
            if covered.contains(&page) {
                if let Some(r) = run.take() {
                    gaps.push(r);
                }
            } else {
                run = Some(match run {
                    Some((start, _)) => (start, page),
                    None => (page, page),
                });
            }
        }
        if let Some(r) = run {
            gaps.push(r);
        }
        gaps
    }

    /// Fill every gap and insert the produced roots in order. Returns the
    /// coverage report (which reflects the pre-fill state).
    pub async fn fill(
        &self,
        roots: &mut Vec<TreeNode>,
        parser: &mut PdfParser,
    ) -> Result<GapFillInfo> {
        let total_pages = parser.total_pages();
        let covered = Self::covered_pages(roots, total_pages);
        let gaps = Self::find_gaps(roots, total_pages);

        let info = GapFillInfo {
            gaps_found: gaps.len(),
            gaps_filled: gaps.clone(),
            original_coverage: format!("{}/{}", covered.len(), total_pages),
            coverage_percentage: if total_pages > 0 {
                covered.len() as f64 * 100.0 / total_pages as f64
            } else {
                0.0
            },
        };

        if gaps.is_empty() {
            debug!("no gaps, structure already covers every page");
            return Ok(info);
        }

        info!(gaps = gaps.len(), coverage = %info.original_coverage, "filling gaps");

        let mut new_roots = Vec::new();
        for &(start, end) in &gaps {
            parser.parse_range(start, end);
            let nodes = self.fill_one_gap(parser, start, end).await?;
            new_roots.extend(nodes);
        }

        let filtered = filter_overlapping(new_roots, &covered);
        insert_by_start(roots, filtered);

        Ok(info)
    }

    /// Produce the sub-tree for one gap, guaranteed to cover `[start, end]`.
    async fn fill_one_gap(
        &self,
        parser: &PdfParser,
        start: usize,
        end: usize,
    ) -> Result<Vec<TreeNode>> {
        let pages = parser.pages_in(start, end);
        let all_blank = pages.iter().all(|p| p.is_blank());

        if all_blank {
            debug!(start, end, "blank gap, single leaf");
            return Ok(vec![gap_leaf("Unindexed content", start, end)]);
        }
        if start == end {
            let title = pages
                .first()
                .and_then(|p| first_line_title(&p.text))
                .unwrap_or_else(|| "Miscellaneous".to_string());
            return Ok(vec![gap_leaf(&title, start, end)]);
        }

        let items = self.generate_gap_toc(parser, start, end).await?;
        if items.is_empty() {
            let title = pages
                .iter()
                .find_map(|p| first_line_title(&p.text))
                .unwrap_or_else(|| "Unindexed content".to_string());
            return Ok(vec![gap_leaf(&title, start, end)]);
        }

        let mut nodes = TreeBuilder::build_in_range(&items, start, end);
        for node in &mut nodes {
            node.visit_mut(&mut |n| n.is_gap_fill = true);
        }

        // The sub-tree must cover the whole gap even when the first heading
        // sits a few pages in.
        if let Some(first) = nodes.first_mut() {
            first.start_index = first.start_index.min(start);
        }
        if let Some(last) = nodes.last_mut() {
            last.end_index = last.end_index.max(end);
        }
        for node in &mut nodes {
            crate::tree::build::expand_parents(node);
        }

        Ok(nodes)
    }

    /// Ask the LLM for a short TOC over the gap pages, chunked when large.
    async fn generate_gap_toc(
        &self,
        parser: &PdfParser,
        start: usize,
        end: usize,
    ) -> Result<Vec<TocItem>> {
        let mut raw: Vec<(String, usize, usize)> = Vec::new();

        let mut chunk_start = start;
        while chunk_start <= end {
            let chunk_end = (chunk_start + MAX_PAGES_PER_CALL - 1).min(end);
            let mut content = parser.labeled_window(chunk_start, chunk_end);
            if content.chars().count() > MAX_CHARS_PER_CALL {
                content = content.chars().take(MAX_CHARS_PER_CALL).collect::<String>()
                    + "\n\n[content truncated]";
            }

            let system = "Extract the section headings from these document pages and return a \
                 short table of contents. Pages are wrapped in <physical_index_N> markers; use \
                 N as the page number, never a number printed inside the text.\n\
                 Only real section/chapter headings count: skip contents-page lines, page \
                 footers, form fields, placeholders and body text. Copy heading text exactly.\n\
                 Reply JSON: {\"table_of_contents\": [{\"title\": \"...\", \"page\": N, \
                 \"level\": 1}]}\nlevel: 1 = chapter, 2 = section, 3 = subsection. Return an \
                 empty array when there are no headings.";
            let user = format!(
                "Pages {}-{}:\n---\n{}\n---\nExtract the headings as JSON.",
                chunk_start, chunk_end, content
            );

            match self
                .llm
                .chat_json(
                    PHASE,
                    &ChatRequest::new(system, user).with_max_tokens(2000),
                )
                .await
            {
                Ok(value) => {
                    for (title, page, level) in parse_gap_items(&value) {
                        if page >= start && page <= end {
                            raw.push((title, page, level));
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
                Err(e) => {
                    warn!(chunk_start, chunk_end, error = %e, "gap chunk failed, flat fallback");
                    raw.push((
                        format!("Pages {}-{}", chunk_start, chunk_end),
                        chunk_start,
                        1,
                    ));
                }
            }

            chunk_start = chunk_end + 1;
        }

        raw.sort_by_key(|&(_, page, _)| page);

        // Same code synthesiser as outline conversion, so gap sub-trees nest
        // exactly like everything else.
        let mut synth = CodeSynthesizer::new();
        Ok(raw
            .into_iter()
            .map(|(title, page, level)| {
                let mut item = TocItem::new(synth.next_code(level), title);
                item.physical_index = Some(page);
                item
            })
            .collect())
    }
}

fn gap_leaf(title: &str, start: usize, end: usize) -> TreeNode {
    TreeNode {
        title: title.to_string(),
        start_index: start,
        end_index: end,
        is_gap_fill: true,
        ..Default::default()
    }
}

/// First non-empty line of a page, trimmed to a title-sized length.
fn first_line_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(60).collect())
}

fn parse_gap_items(value: &Value) -> Vec<(String, usize, usize)> {
    let array = value
        .get("table_of_contents")
        .or_else(|| value.get("toc"))
        .or_else(|| value.get("items"))
        .and_then(|v| v.as_array())
        .or_else(|| value.as_array());

    let Some(array) = array else {
        return Vec::new();
    };

    array
        .iter()
        .filter_map(|entry| {
            let title = entry.get("title")?.as_str()?.trim().to_string();
            if title.is_empty() {
                return None;
            }
            let page = entry.get("page")?.as_u64()? as usize;
            if page == 0 {
                return None;
            }
            let level = entry
                .get("level")
                .and_then(|l| l.as_u64())
                .map(|l| l as usize)
                .unwrap_or(1)
                .clamp(1, 3);
            Some((title, page, level))
        })
        .collect()
}

/// Drop gap nodes that mostly overlap pages some existing leaf already
/// covers; children are filtered with the same rule.
fn filter_overlapping(nodes: Vec<TreeNode>, covered: &BTreeSet<usize>) -> Vec<TreeNode> {
    nodes
        .into_iter()
        .filter_map(|mut node| {
            let span = (node.end_index - node.start_index + 1) as f64;
            let overlap = (node.start_index..=node.end_index)
                .filter(|p| covered.contains(p))
                .count() as f64;
            if overlap / span >= OVERLAP_DISCARD_RATIO {
                debug!(title = %node.title, "gap node discarded, overlaps existing coverage");
                return None;
            }
            node.nodes = filter_overlapping(std::mem::take(&mut node.nodes), covered);
            Some(node)
        })
        .collect()
}

/// Insert gap roots at their `start_index` position instead of appending,
/// keeping the root list sorted without disturbing existing hierarchy.
fn insert_by_start(roots: &mut Vec<TreeNode>, gap_nodes: Vec<TreeNode>) {
    for node in gap_nodes {
        let at = roots
            .iter()
            .position(|existing| existing.start_index > node.start_index)
            .unwrap_or(roots.len());
        roots.insert(at, node);
    }
}
