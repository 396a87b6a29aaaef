//! Structure extraction: turn the selected source into the flat ordered
//! item list with dotted structure codes.
//!
//! Three paths share one output shape: embedded outline conversion (pure),
//! printed-contents extraction (LLM, chunked with handoff for large
//! listings), and content-based reconstruction (LLM over token-budget
//! segments, with parent-context continuation for recursion).

use serde_json::Value;
use tracing::{debug, info, warn};

use pagetree_llm::{ChatRequest, LlmDispatcher};

use crate::error::{PageTreeError, Result};
use crate::model::TocItem;
use crate::pdf::{parse_physical_index_tag, PdfParser};
use crate::structure::codes::{code_level, code_sort_key, CodeSynthesizer};
use crate::structure::detect::is_chapter_title;

const PHASE: &str = "structure_extraction";

/// Printed contents above this many characters is processed in chunks.
const SINGLE_SHOT_LIMIT: usize = 32_000;
const CHUNK_SIZE: usize = 8_000;
/// Items replayed into the next chunk's prompt so numbering continues.
const HANDOFF_ITEMS: usize = 5;
/// Depth cap applied at extraction time; deeper items are dropped early.
const MAX_LEVEL: usize = 4;

/// Context passed into recursive extraction so synthesized numbering
/// continues under the parent instead of restarting.
#[derive(Debug, Clone, Default)]
pub struct ParentContext {
    pub structure: String,
    pub title: String,
}

/// Phase 3 extractor.
pub struct StructureExtractor<'a> {
    llm: &'a LlmDispatcher,
}

impl<'a> StructureExtractor<'a> {
    pub fn new(llm: &'a LlmDispatcher) -> Self {
        Self { llm }
    }

    /// Convert embedded outline entries into items. Pure and deterministic:
    /// running it twice on the same input yields identical output.
    ///
    /// Chapter-pattern titles are promoted to level 1 before code synthesis,
    /// which normalises outlines whose nesting is sloppy.
    pub fn from_outline(entries: &[crate::pdf::OutlineEntry]) -> Vec<TocItem> {
        let mut synth = CodeSynthesizer::new();
        entries
            .iter()
            .map(|entry| {
                let level = if is_chapter_title(&entry.title) {
                    1
                } else {
                    entry.level
                };
                let code = synth.next_code(level);
                let mut item = TocItem::new(code, entry.title.trim());
                item.page = entry.page;
                item
            })
            .collect()
    }

    /// Extract items from a printed contents region.
    pub async fn from_printed_contents(
        &self,
        content: &str,
        has_page_numbers: bool,
    ) -> Result<Vec<TocItem>> {
        let items = if content.chars().count() > SINGLE_SHOT_LIMIT {
            self.extract_chunked(content).await?
        } else {
            self.extract_single(content, has_page_numbers).await?
        };

        let items = validate_items(items);
        info!(items = items.len(), "printed contents extracted");
        Ok(items)
    }

    async fn extract_single(
        &self,
        content: &str,
        has_page_numbers: bool,
    ) -> Result<Vec<TocItem>> {
        let system = "Extract the table of contents to JSON.\n\
             Output: {\"table_of_contents\": [{\"structure\": \"1.1\", \"title\": \"...\", \"page\": 5}]}\n\
             Rules:\n\
             - structure: \"1\" (chapter), \"1.1\" (section), \"1.1.1\" (subsection); \
               assign codes in pre-order when none are printed\n\
             - copy titles exactly as written, do not translate or rewrite\n\
             - include every listed section\n\
             Return JSON only.";
        let page_note = if has_page_numbers {
            "Each line ends with the section's page number; extract it."
        } else {
            "The listing has no page numbers; set page to null."
        };
        let user = format!("TOC text:\n\n{}\n\n{}\nExtract to JSON.", content, page_note);

        match self
            .llm
            .chat_json(
                PHASE,
                &ChatRequest::new(system, user).with_max_tokens(8000),
            )
            .await
        {
            Ok(value) => Ok(parse_toc_items(&value)),
            Err(e) if e.is_fatal() => Err(PageTreeError::llm(PHASE, e)),
            Err(e) => {
                warn!(error = %e, "contents extraction failed, continuing with no items");
                Ok(Vec::new())
            }
        }
    }

    /// Chunked extraction for very large listings: the tail of the items
    /// extracted so far seeds each next chunk so codes stay monotone.
    async fn extract_chunked(&self, content: &str) -> Result<Vec<TocItem>> {
        let chars: Vec<char> = content.chars().collect();
        let chunks: Vec<String> = chars
            .chunks(CHUNK_SIZE)
            .map(|c| c.iter().collect())
            .collect();
        debug!(chunks = chunks.len(), "large contents region, chunked extraction");

        let mut all_items: Vec<TocItem> = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let handoff: Vec<String> = all_items
                .iter()
                .rev()
                .take(HANDOFF_ITEMS)
                .map(|item| format!("{} {}", item.structure, item.title))
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();

            let system = format!(
                "Extract the table of contents from chunk {} of {} to JSON.\n\
                 Sections already extracted (continue their numbering, do not repeat them):\n{}\n\
                 Output: {{\"table_of_contents\": [{{\"structure\": \"x.x\", \"title\": \"...\", \"page\": 5}}], \"is_complete\": \"yes/no\"}}\n\
                 Return JSON only.",
                i + 1,
                chunks.len(),
                if handoff.is_empty() {
                    "(none)".to_string()
                } else {
                    handoff.join("\n")
                }
            );
            let user = format!("TOC chunk:\n\n{}\n\nExtract to JSON.", chunk);

            match self
                .llm
                .chat_json(
                    PHASE,
                    &ChatRequest::new(system, user).with_max_tokens(8000),
                )
                .await
            {
                Ok(value) => {
                    all_items.extend(parse_toc_items(&value));
                    let complete = value
                        .get("is_complete")
                        .and_then(|v| v.as_str())
                        .map(|s| s.eq_ignore_ascii_case("yes"))
                        .unwrap_or(false);
                    if complete {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
                Err(e) => {
                    warn!(chunk = i + 1, error = %e, "chunk extraction failed, continuing");
                }
            }
        }

        Ok(all_items)
    }

    /// Reconstruct structure from the document body. `range` scopes the
    /// extraction (the full document, or one oversized node's pages during
    /// recursion); `parent` carries the numbering context for recursion.
    pub async fn from_content(
        &self,
        parser: &PdfParser,
        range: (usize, usize),
        max_tokens_per_segment: usize,
        parent: Option<&ParentContext>,
    ) -> Result<Vec<TocItem>> {
        let segments = parser.segment_pages(range.0, range.1, max_tokens_per_segment, 1);
        debug!(
            segments = segments.len(),
            start = range.0,
            end = range.1,
            "content-based extraction"
        );

        let mut all_items: Vec<TocItem> = Vec::new();

        for (i, segment) in segments.iter().enumerate() {
            let extracted = self.extract_from_segment(segment, &all_items, parent).await;
            match extracted {
                Ok(items) => {
                    let before = all_items.len();
                    merge_items(&mut all_items, items);
                    debug!(
                        segment = i + 1,
                        added = all_items.len() - before,
                        "segment extracted"
                    );
                }
                Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
                Err(e) => {
                    warn!(segment = i + 1, error = %e, "segment extraction failed, continuing");
                }
            }
        }

        let mut items = validate_items(all_items);
        repair_monotonicity(&mut items);
        info!(items = items.len(), "content-based structure extracted");
        Ok(items)
    }

    async fn extract_from_segment(
        &self,
        segment: &crate::pdf::PageSegment,
        existing: &[TocItem],
        parent: Option<&ParentContext>,
    ) -> std::result::Result<Vec<TocItem>, pagetree_llm::LlmError> {
        let context_instruction = match parent {
            Some(p) if !p.structure.is_empty() => format!(
                "\nYou are analysing a subsection of \"{title}\" whose structure code is \
                 \"{code}\". If the text shows explicit numbering, follow it exactly; \
                 otherwise number unlabelled children as \"{code}.1\", \"{code}.2\", ... and \
                 deeper levels as \"{code}.1.1\", \"{code}.1.2\", ...\n",
                title = p.title,
                code = p.structure
            ),
            _ => String::new(),
        };

        let tail: Vec<String> = existing
            .iter()
            .rev()
            .take(HANDOFF_ITEMS)
            .map(|item| format!("{} {}", item.structure, item.title))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let system = format!(
            "Extract the hierarchical section structure visible in this document segment.\n\
             {context}\
             Only extract headings that are clearly structural: chapter/part titles, numbered \
             sections and subsections, and every item of a compact subsection list printed \
             under a section title. Do not extract contents-page lines, page footers, form \
             fields, or paragraph text. Copy title text exactly as printed.\n\
             Each page is wrapped in <physical_index_N> markers; report the marker of the page \
             where each heading appears.\n\
             Structure codes: \"1\", \"1.1\", \"1.1.1\", up to 4 levels.\n\
             Sections already extracted (continue numbering, do not repeat):\n{tail}\n\
             Output JSON: {{\"table_of_contents\": [{{\"structure\": \"1\", \"title\": \"...\", \
             \"physical_index\": \"<physical_index_5>\"}}]}}",
            context = context_instruction,
            tail = if tail.is_empty() {
                "(none)".to_string()
            } else {
                tail.join("\n")
            }
        );
        let user = format!(
            "Document segment (pages {}-{}):\n---\n{}\n---\nExtract the structure as JSON.",
            segment.start_page,
            segment.end_page,
            truncate_chars(&segment.content, 60_000)
        );

        let value = self
            .llm
            .chat_json(
                PHASE,
                &ChatRequest::new(system, user).with_max_tokens(4000),
            )
            .await?;

        Ok(parse_toc_items(&value))
    }
}

/// Parse an items array out of the extraction response. Accepts the
/// canonical key plus the aliases models drift toward, or a bare array.
pub fn parse_toc_items(value: &Value) -> Vec<TocItem> {
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
            let structure = entry
                .get("structure")
                .and_then(|s| match s {
                    Value::String(s) => Some(s.trim().trim_end_matches('.').to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .unwrap_or_default();

            let mut item = TocItem::new(structure, title);
            item.page = entry.get("page").and_then(value_to_page);
            item.physical_index = entry.get("physical_index").and_then(value_to_page);
            Some(item)
        })
        .collect()
}

fn value_to_page(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize).filter(|&n| n > 0),
        Value::String(s) => parse_physical_index_tag(s).filter(|&n| n > 0),
        _ => None,
    }
}

/// Drop empty titles and items deeper than the level cap.
fn validate_items(items: Vec<TocItem>) -> Vec<TocItem> {
    items
        .into_iter()
        .filter(|item| !item.title.is_empty())
        .filter(|item| code_level(&item.structure) <= MAX_LEVEL)
        .collect()
}

/// Merge a segment's items into the accumulated list, dropping boundary
/// duplicates (same code and title, typically from the overlap page).
fn merge_items(all: &mut Vec<TocItem>, new_items: Vec<TocItem>) {
    for item in new_items {
        let duplicate = all
            .iter()
            .any(|existing| existing.structure == item.structure && existing.title == item.title);
        if !duplicate {
            all.push(item);
        }
    }
}

/// Repair non-monotone code sequences by renumbering the offending suffix.
///
/// Codes must be strictly increasing in pre-order. At the first violation,
/// every following item is re-coded by replaying its level through a
/// synthesiser seeded with the last good code, which preserves relative
/// depth while restoring monotonicity.
pub fn repair_monotonicity(items: &mut [TocItem]) {
    let mut violation_at = None;
    for i in 1..items.len() {
        if code_sort_key(&items[i].structure) <= code_sort_key(&items[i - 1].structure) {
            violation_at = Some(i);
            break;
        }
    }

    let Some(start) = violation_at else { return };
    warn!(index = start, "non-monotone structure codes, renumbering suffix");

    let mut synth = CodeSynthesizer::under_parent(&items[start - 1].structure);
    for item in items[start..].iter_mut() {
        let level = code_level(&item.structure);
        item.structure = synth.next_code(level);
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::OutlineEntry;

    fn entry(level: usize, title: &str, page: usize) -> OutlineEntry {
        OutlineEntry {
            level,
            title: title.to_string(),
            page: Some(page),
        }
    }

    #[test]
    fn test_outline_conversion_codes() {
        let entries = vec![
            entry(1, "Ch 1", 1),
            entry(2, "1.1", 3),
            entry(2, "1.2", 7),
            entry(1, "Ch 2", 12),
        ];
        let items = StructureExtractor::from_outline(&entries);
        let codes: Vec<&str> = items.iter().map(|i| i.structure.as_str()).collect();
        assert_eq!(codes, vec!["1", "1.1", "1.2", "2"]);
        assert_eq!(items[1].page, Some(3));
    }

    #[test]
    fn test_outline_conversion_idempotent() {
        let entries = vec![
            entry(1, "Intro", 1),
            entry(2, "Scope", 2),
            entry(3, "Detail", 3),
            entry(1, "Body", 5),
        ];
        let first = StructureExtractor::from_outline(&entries);
        let second = StructureExtractor::from_outline(&entries);
        assert_eq!(first, second);
    }

    #[test]
    fn test_chapter_promotion() {
        // The embedded outline wrongly nests a chapter at level 3.
        let entries = vec![
            entry(1, "第一章 概述", 1),
            entry(2, "背景", 2),
            entry(3, "第二章 方法", 5),
        ];
        let items = StructureExtractor::from_outline(&entries);
        let codes: Vec<&str> = items.iter().map(|i| i.structure.as_str()).collect();
        assert_eq!(codes, vec!["1", "1.1", "2"]);
    }

    #[test]
    fn test_parse_toc_items_variants() {
        let canonical = serde_json::json!({
            "table_of_contents": [
                {"structure": "1", "title": "Intro", "page": 3},
                {"structure": "1.1.", "title": "Scope", "page": "4"},
            ]
        });
        let items = parse_toc_items(&canonical);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].structure, "1.1");
        assert_eq!(items[1].page, Some(4));

        let bare = serde_json::json!([
            {"title": "Only", "physical_index": "<physical_index_9>"}
        ]);
        let items = parse_toc_items(&bare);
        assert_eq!(items[0].physical_index, Some(9));

        let junk = serde_json::json!({"table_of_contents": [{"page": 3}, {"title": "  "}]});
        assert!(parse_toc_items(&junk).is_empty());
    }

    #[test]
    fn test_validate_items_depth_cap() {
        let items = vec![
            TocItem::new("1", "ok"),
            TocItem::new("1.1.1.1", "deep but allowed"),
            TocItem::new("1.1.1.1.1", "too deep"),
        ];
        let valid = validate_items(items);
        assert_eq!(valid.len(), 2);
    }

    #[test]
    fn test_merge_drops_boundary_duplicates() {
        let mut all = vec![TocItem::new("1", "Intro"), TocItem::new("1.1", "Scope")];
        merge_items(
            &mut all,
            vec![TocItem::new("1.1", "Scope"), TocItem::new("1.2", "Goals")],
        );
        let codes: Vec<&str> = all.iter().map(|i| i.structure.as_str()).collect();
        assert_eq!(codes, vec!["1", "1.1", "1.2"]);
    }

    #[test]
    fn test_repair_monotonicity() {
        // Second segment restarted numbering from "1".
        let mut items = vec![
            TocItem::new("1", "A"),
            TocItem::new("2", "B"),
            TocItem::new("1", "C"),
            TocItem::new("1.1", "D"),
        ];
        repair_monotonicity(&mut items);
        let codes: Vec<&str> = items.iter().map(|i| i.structure.as_str()).collect();
        assert_eq!(codes, vec!["1", "2", "3", "3.1"]);
    }

    #[test]
    fn test_repair_monotonicity_noop_when_sorted() {
        let mut items = vec![
            TocItem::new("1", "A"),
            TocItem::new("1.1", "B"),
            TocItem::new("2", "C"),
        ];
        repair_monotonicity(&mut items);
        let codes: Vec<&str> = items.iter().map(|i| i.structure.as_str()).collect();
        assert_eq!(codes, vec!["1", "1.1", "2"]);
    }
}
