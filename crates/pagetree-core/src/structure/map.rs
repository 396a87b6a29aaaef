//! Page mapping: resolve each item's `physical_index`.
//!
//! Outline-sourced items copy their page as-is. Printed page numbers are
//! validated against page text and offset-corrected when the printed
//! numbering starts from a later physical page (Roman front-matter and the
//! like). Items with no usable number are located textually, and whole
//! groups that stay unresolved go through segmented LLM mapping. A final
//! pass restores monotonicity across the flat sequence.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use pagetree_llm::{ChatRequest, LlmDispatcher};

use crate::error::{PageTreeError, Result};
use crate::matching::{normalize_title, title_in_page};
use crate::model::TocItem;
use crate::pdf::{parse_physical_index_tag, PdfParser};

const PHASE: &str = "page_mapping";

/// Validation rate below which offset detection kicks in.
const OFFSET_TRIGGER_RATE: f64 = 0.5;
/// Titles sampled for offset detection.
const OFFSET_SAMPLE: usize = 5;
/// Items per LLM mapping call in the segmented path.
const MAPPING_BATCH: usize = 5;

/// Phase 4 mapper.
pub struct PageMapper<'a> {
    llm: &'a LlmDispatcher,
}

impl<'a> PageMapper<'a> {
    pub fn new(llm: &'a LlmDispatcher) -> Self {
        Self { llm }
    }

    /// Fast path for outline-sourced items: pages are physical already, so
    /// they are copied and pre-marked as validated.
    pub fn map_from_outline(items: &mut [TocItem], total_pages: usize) {
        for (i, item) in items.iter_mut().enumerate() {
            item.physical_index = item.page.map(|p| p.clamp(1, total_pages));
            item.validation_passed = Some(item.physical_index.is_some());
            item.list_index = Some(i);
        }
    }

    /// General path. Returns the fraction of items whose mapping validated.
    pub async fn map_pages(
        &self,
        items: &mut Vec<TocItem>,
        parser: &PdfParser,
        has_page_numbers: bool,
    ) -> Result<f64> {
        // Content-sourced items already carry physical indices from the
        // boundary markers; only normalise and index them.
        let pre_mapped = items.iter().filter(|i| i.physical_index.is_some()).count();
        if pre_mapped == items.len() && !items.is_empty() {
            debug!(items = items.len(), "all items pre-mapped by extraction");
            self.finalize(items, parser);
            let validated = items
                .iter()
                .filter(|i| i.validation_passed == Some(true))
                .count();
            return Ok(validated as f64 / items.len() as f64);
        }

        if has_page_numbers {
            self.map_with_page_numbers(items, parser);
        } else {
            self.map_without_page_numbers(items, parser).await?;
        }

        self.finalize(items, parser);

        let validated = items
            .iter()
            .filter(|i| i.validation_passed == Some(true))
            .count();
        let accuracy = if items.is_empty() {
            0.0
        } else {
            validated as f64 / items.len() as f64
        };
        info!(
            items = items.len(),
            validated,
            accuracy = format!("{:.1}%", accuracy * 100.0),
            "page mapping complete"
        );
        Ok(accuracy)
    }

    /// Printed numbers: direct mapping, then offset correction when the
    /// validation rate is poor.
    fn map_with_page_numbers(&self, items: &mut [TocItem], parser: &PdfParser) {
        let validated = Self::apply_offset(items, parser, 0);
        let rate = validated as f64 / items.len().max(1) as f64;
        debug!(
            validated,
            total = items.len(),
            "direct mapping validation"
        );

        if rate < OFFSET_TRIGGER_RATE && !items.is_empty() {
            if let Some(offset) = Self::detect_offset(items, parser) {
                if offset != 0 {
                    // Trial run on a copy; adopt only on improvement.
                    let mut trial: Vec<TocItem> = items.to_vec();
                    let trial_validated = Self::apply_offset(&mut trial, parser, offset);
                    if trial_validated > validated {
                        info!(offset, "page offset adopted");
                        items.clone_from_slice(&trial);
                    } else {
                        debug!(offset, "detected offset did not improve validation");
                    }
                }
            }
        }

        // Items that still have no physical page: textual search between
        // their mapped neighbours.
        self.resolve_missing_textually(items, parser);
    }

    /// Assign `page + offset` to every item and validate against page text.
    /// Returns the validated count.
    fn apply_offset(items: &mut [TocItem], parser: &PdfParser, offset: i64) -> usize {
        let total = parser.total_pages();
        let mut validated = 0;

        for item in items.iter_mut() {
            let Some(page) = item.page else {
                item.validation_passed = Some(false);
                continue;
            };
            let target = page as i64 + offset;
            if target < 1 || target > total as i64 {
                item.physical_index = Some(target.clamp(1, total as i64) as usize);
                item.validation_passed = Some(false);
                continue;
            }
            let target = target as usize;
            item.physical_index = Some(target);

            let passed = parser
                .page(target)
                .map(|p| title_in_page(&item.title, &p.text))
                .unwrap_or(false);
            item.validation_passed = Some(passed);
            if passed {
                validated += 1;
            }
        }
        validated
    }

    /// Consensus offset: find sample titles on content pages (skipping
    /// pages that look like the contents listing itself) and vote on
    /// `physical - printed`.
    fn detect_offset(items: &[TocItem], parser: &PdfParser) -> Option<i64> {
        let samples: Vec<&TocItem> = items
            .iter()
            .filter(|i| i.page.is_some() && !i.title.trim().is_empty())
            .take(OFFSET_SAMPLE)
            .collect();
        if samples.is_empty() {
            return None;
        }

        let sample_titles: Vec<String> = samples
            .iter()
            .map(|i| normalize_title(&i.title))
            .collect();

        // A page matching three or more sample titles is the listing, not
        // the content.
        let mut listing_pages = Vec::new();
        for n in 1..=parser.total_pages() {
            let Some(page) = parser.page(n) else { continue };
            let haystack = normalize_title(&truncate_chars(&page.text, 5000));
            let matches = sample_titles
                .iter()
                .filter(|t| !t.is_empty() && haystack.contains(t.as_str()))
                .count();
            if matches >= 3 {
                listing_pages.push(n);
            }
        }

        let mut votes: HashMap<i64, usize> = HashMap::new();
        for item in &samples {
            let printed = item.page.unwrap() as i64;
            for n in 1..=parser.total_pages() {
                if listing_pages.contains(&n) {
                    continue;
                }
                let Some(page) = parser.page(n) else { continue };
                if title_in_page(&item.title, &truncate_chars(&page.text, 3000)) {
                    *votes.entry(n as i64 - printed).or_default() += 1;
                    break;
                }
            }
        }

        votes
            .into_iter()
            .max_by_key(|&(offset, count)| (count, std::cmp::Reverse(offset.abs())))
            .map(|(offset, count)| {
                debug!(offset, votes = count, "offset consensus");
                offset
            })
    }

    /// Locate items that still lack a physical page by scanning the window
    /// between their mapped neighbours. Earlier pages win ties.
    fn resolve_missing_textually(&self, items: &mut [TocItem], parser: &PdfParser) {
        let assigned: Vec<Option<usize>> = items.iter().map(|i| i.physical_index).collect();

        for idx in 0..items.len() {
            if items[idx].physical_index.is_some() {
                continue;
            }
            let lo = assigned[..idx]
                .iter()
                .rev()
                .find_map(|p| *p)
                .unwrap_or(1);
            let hi = assigned[idx + 1..]
                .iter()
                .find_map(|p| *p)
                .unwrap_or(parser.total_pages());

            if let Some(found) = textual_search(&items[idx].title, parser, lo, hi) {
                debug!(
                    item = idx,
                    page = found,
                    "missing page resolved textually"
                );
                items[idx].physical_index = Some(found);
                items[idx].validation_passed = Some(true);
            }
        }
    }

    /// No printed numbers at all: segmented LLM mapping over the whole
    /// parsed document, in batches, updating only still-unmapped items.
    async fn map_without_page_numbers(
        &self,
        items: &mut [TocItem],
        parser: &PdfParser,
    ) -> Result<()> {
        let segments = parser.segment_pages(1, parser.total_pages(), 20_000, 1);
        debug!(segments = segments.len(), "segmented LLM mapping");

        for segment in &segments {
            let unmapped: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.physical_index.is_none())
                .map(|(i, _)| i)
                .collect();
            if unmapped.is_empty() {
                break;
            }

            for batch in unmapped.chunks(MAPPING_BATCH) {
                let listing: Vec<String> = batch
                    .iter()
                    .map(|&i| format!("{} {}", items[i].structure, items[i].title))
                    .collect();

                let system = "Assign physical page indices to TOC sections by locating each \
                     section heading in the document segment. Pages are wrapped in \
                     <physical_index_N> markers; report the marker where the section starts, \
                     or null when the section does not appear in this segment.\n\
                     Reply JSON: {\"mappings\": [{\"structure\": \"1\", \"title\": \"...\", \
                     \"physical_index\": \"<physical_index_3>\" }]}";
                let user = format!(
                    "Sections to find:\n{}\n\nDocument segment (pages {}-{}):\n---\n{}\n---\n\
                     Return the mappings as JSON; use null for sections not in this segment.",
                    listing.join("\n"),
                    segment.start_page,
                    segment.end_page,
                    truncate_chars(&segment.content, 50_000)
                );

                let value = match self
                    .llm
                    .chat_json(PHASE, &ChatRequest::new(system, user))
                    .await
                {
                    Ok(value) => value,
                    Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
                    Err(e) => {
                        warn!(error = %e, "mapping batch failed, items stay unmapped");
                        continue;
                    }
                };

                let mappings = value
                    .get("mappings")
                    .and_then(|m| m.as_array())
                    .cloned()
                    .unwrap_or_default();

                for mapping in &mappings {
                    let Some(title) = mapping.get("title").and_then(|t| t.as_str()) else {
                        continue;
                    };
                    let page = mapping
                        .get("physical_index")
                        .and_then(|p| match p {
                            serde_json::Value::String(s) => parse_physical_index_tag(s),
                            serde_json::Value::Number(n) => {
                                n.as_u64().map(|n| n as usize)
                            }
                            _ => None,
                        })
                        .filter(|&p| p >= segment.start_page && p <= segment.end_page);
                    let Some(page) = page else { continue };

                    if let Some(&i) = batch.iter().find(|&&i| {
                        items[i].physical_index.is_none() && items[i].title == title
                    }) {
                        items[i].physical_index = Some(page);
                        items[i].validation_passed = Some(
                            parser
                                .page(page)
                                .map(|p| title_in_page(&items[i].title, &p.text))
                                .unwrap_or(false),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Clamp, index, and restore monotonicity across the flat sequence.
    fn finalize(&self, items: &mut [TocItem], parser: &PdfParser) {
        let total = parser.total_pages();
        for item in items.iter_mut() {
            if let Some(p) = item.physical_index {
                if p > total {
                    warn!(page = p, total, "physical index out of range, clamping");
                    item.physical_index = Some(total);
                    item.validation_passed = Some(false);
                }
            }
        }

        enforce_monotonic(items, parser);

        for (i, item) in items.iter_mut().enumerate() {
            item.list_index = Some(i);
        }
    }
}

/// Earliest page in `[lo, hi]` containing the normalised title.
pub fn textual_search(
    title: &str,
    parser: &PdfParser,
    lo: usize,
    hi: usize,
) -> Option<usize> {
    let lo = lo.max(1);
    let hi = hi.min(parser.total_pages());
    for n in lo..=hi {
        if let Some(page) = parser.page(n) {
            if title_in_page(title, &truncate_chars(&page.text, 3000)) {
                return Some(n);
            }
        }
    }
    None
}

/// Physical indices must be non-decreasing across the flat sequence.
/// Offenders are re-searched in the tight window between their neighbours;
/// when that fails they are pulled onto the previous item's page.
fn enforce_monotonic(items: &mut [TocItem], parser: &PdfParser) {
    for i in 1..items.len() {
        let prev = match items[..i].iter().rev().find_map(|it| it.physical_index) {
            Some(p) => p,
            None => continue,
        };
        let Some(current) = items[i].physical_index else {
            continue;
        };
        if current >= prev {
            continue;
        }

        let next = items[i + 1..]
            .iter()
            .find_map(|it| it.physical_index)
            .filter(|&n| n >= prev)
            .unwrap_or(parser.total_pages());

        let repaired = textual_search(&items[i].title, parser, prev, next).unwrap_or(prev);
        warn!(
            item = i,
            was = current,
            now = repaired,
            "non-monotone page index repaired"
        );
        items[i].physical_index = Some(repaired);
        items[i].validation_passed = Some(false);
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
