//! Tree building: page-range arithmetic and nesting.
//!
//! Ranges are computed on the flat ordered list first (each item ends where
//! the next one begins), and only then is the list nested by structure code.
//! Parents then expand to cover their children; children are never clamped
//! to parents, because child ranges derive from verified sibling positions
//! and clamping would silently discard content.

use tracing::{debug, warn};

use crate::model::{TocItem, TreeNode};
use crate::structure::codes::{code_sort_key, is_descendant};

/// Maximum tree depth, counting the root level.
pub const MAX_DEPTH: usize = 4;

/// Phase 6 builder.
#[derive(Debug, Default)]
pub struct TreeBuilder;

impl TreeBuilder {
    /// Build the nested tree from the mapped, verified flat list.
    ///
    /// Items that failed verification are retained; their ranges are simply
    /// approximate. An empty input yields an empty forest (the pipeline
    /// substitutes the single-node fallback).
    pub fn build(items: &[TocItem], total_pages: usize) -> Vec<TreeNode> {
        let mut roots = Self::build_in_range(items, 1, total_pages);
        synthesize_preface(&mut roots);
        debug!(
            roots = roots.len(),
            total = roots.iter().map(|r| r.count_nodes()).sum::<usize>(),
            "tree built"
        );
        roots
    }

    /// Build a forest whose ranges are bounded by `[lo, hi]` instead of the
    /// whole document. Used by the gap filler for per-gap sub-trees; no
    /// preface is synthesized.
    pub fn build_in_range(items: &[TocItem], lo: usize, hi: usize) -> Vec<TreeNode> {
        if items.is_empty() {
            return Vec::new();
        }

        let mut ordered: Vec<TocItem> = items.to_vec();
        ordered.sort_by_key(|item| code_sort_key(&item.structure));

        let ranges = compute_ranges(&ordered, lo, hi);
        let mut roots = nest(&ordered, &ranges);

        enforce_depth_cap(&mut roots, 1);
        for root in &mut roots {
            expand_parents(root);
        }
        roots
    }
}

/// Compute `(start, end)` for every item on the flat pre-ordered list.
///
/// start: the item's physical page; when missing, it continues from its
/// predecessor. end: up to where the next item begins, shared when the next
/// section starts mid-page and exclusive otherwise; the last item runs to
/// `hi`. Everything is clamped into `[lo, hi]`.
fn compute_ranges(items: &[TocItem], lo: usize, hi: usize) -> Vec<(usize, usize)> {
    let mut starts = Vec::with_capacity(items.len());
    let mut prev_start = lo;
    for item in items {
        let start = item.physical_index.unwrap_or(prev_start).clamp(lo, hi);
        starts.push(start);
        prev_start = start;
    }

    let mut ranges = Vec::with_capacity(items.len());
    for i in 0..items.len() {
        let start = starts[i];
        let end = match items.get(i + 1) {
            Some(next) => {
                let next_start = starts[i + 1];
                if next.appear_start {
                    // The next section begins mid-page; both share it.
                    next_start
                } else if next_start > start {
                    next_start - 1
                } else {
                    next_start
                }
            }
            None => hi,
        };
        ranges.push((start, end.clamp(start, hi)));
    }
    ranges
}

/// Nest the flat pre-ordered list by structure code: each item owns the run
/// of descendants that immediately follows it.
fn nest(items: &[TocItem], ranges: &[(usize, usize)]) -> Vec<TreeNode> {
    fn build_run(items: &[TocItem], ranges: &[(usize, usize)], lo: usize, hi: usize) -> Vec<TreeNode> {
        let mut out = Vec::new();
        let mut i = lo;
        while i < hi {
            let mut j = i + 1;
            while j < hi && is_descendant(&items[j].structure, &items[i].structure) {
                j += 1;
            }
            let mut node = TreeNode::new(items[i].title.clone(), ranges[i].0, ranges[i].1);
            node.nodes = build_run(items, ranges, i + 1, j);
            out.push(node);
            i = j;
        }
        out
    }
    build_run(items, ranges, 0, items.len())
}

/// Enforce the depth cap by lifting anything deeper than [`MAX_DEPTH`] into
/// its deepest allowed ancestor, order preserved.
fn enforce_depth_cap(nodes: &mut Vec<TreeNode>, depth: usize) {
    if depth == MAX_DEPTH {
        // Children of these nodes would exceed the cap: splice each node's
        // flattened descendants in after it, as siblings.
        let mut flattened: Vec<TreeNode> = Vec::new();
        for mut node in nodes.drain(..) {
            let descendants = std::mem::take(&mut node.nodes);
            flattened.push(node);
            flatten_into(descendants, &mut flattened);
        }
        *nodes = flattened;
        return;
    }
    for node in nodes.iter_mut() {
        enforce_depth_cap(&mut node.nodes, depth + 1);
    }
}

fn flatten_into(nodes: Vec<TreeNode>, out: &mut Vec<TreeNode>) {
    for mut node in nodes {
        let children = std::mem::take(&mut node.nodes);
        out.push(node);
        flatten_into(children, out);
    }
}

/// Post-order parent expansion: every parent grows to cover its children.
pub fn expand_parents(node: &mut TreeNode) {
    for child in &mut node.nodes {
        expand_parents(child);
    }
    if let Some(min_start) = node.nodes.iter().map(|c| c.start_index).min() {
        node.start_index = node.start_index.min(min_start);
    }
    if let Some(max_end) = node.nodes.iter().map(|c| c.end_index).max() {
        node.end_index = node.end_index.max(max_end);
    }
}

/// When the first root starts after page 1, prepend a Preface node covering
/// the leading pages.
fn synthesize_preface(roots: &mut Vec<TreeNode>) {
    let Some(first) = roots.first() else { return };
    if first.start_index > 1 {
        let preface = TreeNode::new("Preface", 1, first.start_index - 1);
        debug!(end = preface.end_index, "preface node synthesized");
        roots.insert(0, preface);
    }
}

/// Final safety net over the assembled forest: clamp ranges into
/// `[1, total_pages]`, repair inverted ranges, re-expand parents, and keep
/// sibling order non-decreasing. Violations are logged, never surfaced.
pub fn repair_invariants(roots: &mut Vec<TreeNode>, total_pages: usize) {
    fn repair(node: &mut TreeNode, total_pages: usize) {
        if node.start_index < 1 {
            warn!(title = %node.title, "start below 1, clamped");
            node.start_index = 1;
        }
        if node.end_index > total_pages {
            warn!(title = %node.title, end = node.end_index, "end beyond document, clamped");
            node.end_index = total_pages;
        }
        if node.end_index < node.start_index {
            warn!(
                title = %node.title,
                start = node.start_index,
                end = node.end_index,
                "inverted range, start clamped to end"
            );
            node.start_index = node.end_index.max(1);
        }
        for child in &mut node.nodes {
            repair(child, total_pages);
        }
        node.nodes.sort_by_key(|c| c.start_index);
    }

    for root in roots.iter_mut() {
        repair(root, total_pages);
        expand_parents(root);
    }
    roots.sort_by_key(|r| r.start_index);
}

/// Depth of the deepest node in the forest.
pub fn forest_depth(roots: &[TreeNode]) -> usize {
    roots.iter().map(|r| r.depth()).max().unwrap_or(0)
}

/// Re-apply the depth cap to a forest that grew after building (recursion,
/// gap filling).
pub fn enforce_forest_depth(roots: &mut Vec<TreeNode>) {
    enforce_depth_cap(roots, 1);
}
