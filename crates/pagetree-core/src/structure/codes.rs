//! Dotted structure-code synthesis and queries.
//!
//! Both the embedded outline (flat `(level, title, page)` triples) and the
//! gap filler's LLM output (flat items with level hints) must produce the
//! same pre-order codes, so this level-counter walk is the single
//! normaliser: on each entry, increment the counter at its level and drop
//! every deeper counter; the code is the dotted join from level 1 down.

/// Stateful synthesiser turning a stream of levels into dotted codes.
#[derive(Debug, Default)]
pub struct CodeSynthesizer {
    /// counters[i] is the current ordinal at level i+1.
    counters: Vec<usize>,
}

impl CodeSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthesiser whose codes continue under an existing parent code, used
    /// by recursive extraction so child numbering extends `parent.N` instead
    /// of restarting at `1`.
    pub fn under_parent(parent_code: &str) -> Self {
        let counters = parent_code
            .split('.')
            .filter_map(|part| part.parse::<usize>().ok())
            .collect();
        Self { counters }
    }

    /// Feed the next entry's 1-based level, returning its code.
    ///
    /// Levels that skip ahead (e.g. a level-3 entry right after a level-1)
    /// are clamped to one deeper than the current depth, which keeps codes
    /// parseable when the source hierarchy is sloppy.
    pub fn next_code(&mut self, level: usize) -> String {
        let level = level.max(1).min(self.counters.len() + 1);
        self.counters.truncate(level);
        if self.counters.len() < level {
            self.counters.push(0);
        }
        self.counters[level - 1] += 1;
        self.counters
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// 1-based depth of a code (`"2.3.1"` → 3). Empty codes count as level 1.
pub fn code_level(code: &str) -> usize {
    if code.is_empty() {
        1
    } else {
        code.split('.').count()
    }
}

/// Whether `child` is a strict descendant of `parent` (`"2.3.1"` under
/// `"2.3"`, but not under `"2.30"`).
pub fn is_descendant(child: &str, parent: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'.'
}

/// Sort key for pre-order comparison of codes. Non-numeric segments sort
/// after numeric ones.
pub fn code_sort_key(code: &str) -> Vec<usize> {
    code.split('.')
        .map(|part| part.parse::<usize>().unwrap_or(usize::MAX))
        .collect()
}

/// Indices of the leaf items in a flat pre-ordered sequence of codes: an
/// item is a leaf iff no later item (before the next sibling branch) is its
/// descendant.
pub fn leaf_indices(codes: &[&str]) -> Vec<usize> {
    let mut leaves = Vec::new();
    for (i, code) in codes.iter().enumerate() {
        if code.is_empty() {
            leaves.push(i);
            continue;
        }
        let mut is_leaf = true;
        for later in &codes[i + 1..] {
            if is_descendant(later, code) {
                is_leaf = false;
                break;
            }
            if !later.starts_with(code) {
                break;
            }
        }
        if is_leaf {
            leaves.push(i);
        }
    }
    leaves
}
