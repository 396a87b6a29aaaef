//! TOC source selection.
//!
//! Chooses the structural source in strict precedence order: embedded
//! outline when it clears the quality gate, else a printed contents page
//! found in the leading pages, else full-body content reconstruction.

use regex::Regex;
use tracing::{debug, info};

use pagetree_llm::{ChatRequest, LlmDispatcher};

use crate::error::{PageTreeError, Result};
use crate::pdf::{OutlineEntry, PdfParser};

const PHASE: &str = "toc_detection";

/// Minimum embedded-outline entries before the outline is even considered.
const MIN_OUTLINE_ENTRIES: usize = 5;
/// Minimum fraction of outline entries that must pass the validator.
const MIN_OUTLINE_QUALITY: f64 = 0.5;
/// Shape heuristic: this many short page-number-terminated lines make a page
/// look like a contents listing.
const MIN_CONTENTS_SHAPE_LINES: usize = 5;

/// Multilingual contents-page keyword signatures, lowercase.
const TOC_KEYWORDS: &[&str] = &[
    "table of contents",
    "contents",
    "目录",
    "目 录",
    "目次",
    "sommaire",
    "inhaltsverzeichnis",
    "índice",
];

/// The selected structural source.
#[derive(Debug, Clone)]
pub enum TocSource {
    /// Usable embedded outline; phases 3 and 4 are skipped.
    EmbeddedOutline(Vec<OutlineEntry>),
    /// Printed contents region found in the leading pages.
    PrintedContents {
        /// 1-based pages making up the contiguous contents region.
        pages: Vec<usize>,
        /// Concatenated, dot-leader-cleaned text of the region.
        content: String,
        /// Whether the listing carries page numbers.
        has_page_numbers: bool,
    },
    /// No usable source; reconstruct from the body.
    ContentAnalysis,
}

/// Phase 2 detector.
pub struct TocSourceDetector<'a> {
    llm: &'a LlmDispatcher,
}

impl<'a> TocSourceDetector<'a> {
    pub fn new(llm: &'a LlmDispatcher) -> Self {
        Self { llm }
    }

    /// Run source selection over the (already initially-parsed) document.
    pub async fn select(
        &self,
        parser: &PdfParser,
        toc_check_pages: usize,
    ) -> Result<TocSource> {
        let outline = parser.embedded_outline();
        if outline.len() >= MIN_OUTLINE_ENTRIES {
            let valid = outline
                .iter()
                .filter(|e| is_valid_outline_title(&e.title))
                .count();
            let quality = valid as f64 / outline.len() as f64;
            if quality >= MIN_OUTLINE_QUALITY {
                info!(
                    entries = outline.len(),
                    valid, "embedded outline accepted"
                );
                let filtered: Vec<OutlineEntry> = outline
                    .into_iter()
                    .filter(|e| is_valid_outline_title(&e.title))
                    .collect();
                return Ok(TocSource::EmbeddedOutline(filtered));
            }
            debug!(
                entries = outline.len(),
                valid, "embedded outline rejected by quality gate"
            );
        } else if !outline.is_empty() {
            debug!(entries = outline.len(), "embedded outline too small");
        }

        if let Some(source) = self.find_printed_contents(parser, toc_check_pages).await? {
            return Ok(source);
        }

        info!("no usable TOC source in leading pages, falling back to content analysis");
        Ok(TocSource::ContentAnalysis)
    }

    /// Scan the first N parsed pages for a printed contents region.
    async fn find_printed_contents(
        &self,
        parser: &PdfParser,
        toc_check_pages: usize,
    ) -> Result<Option<TocSource>> {
        let limit = toc_check_pages.min(parser.total_pages());
        let mut region: Vec<usize> = Vec::new();

        for n in 1..=limit {
            let Some(page) = parser.page(n) else { continue };
            if page.is_blank() {
                if !region.is_empty() {
                    break;
                }
                continue;
            }

            let candidate = looks_like_contents_page(&page.text);
            if !candidate {
                // A contents region is contiguous: the first non-candidate
                // page after it ends the scan.
                if !region.is_empty() {
                    break;
                }
                continue;
            }

            if self.confirm_contents_page(&page.text).await? {
                debug!(page = n, "contents page confirmed");
                region.push(n);
            } else if !region.is_empty() {
                break;
            }
        }

        if region.is_empty() {
            return Ok(None);
        }

        let content = clean_contents_format(
            &region
                .iter()
                .filter_map(|&n| parser.page(n).map(|p| p.text.clone()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        );

        let has_page_numbers = self.probe_page_numbers(&content).await?;
        info!(
            pages = ?region,
            has_page_numbers, "printed contents region selected"
        );

        Ok(Some(TocSource::PrintedContents {
            pages: region,
            content,
            has_page_numbers,
        }))
    }

    /// LLM confirmation that a candidate page really is a contents listing
    /// rather than a list of figures, bibliography, or body text.
    async fn confirm_contents_page(&self, page_text: &str) -> Result<bool> {
        let system = "Determine whether the given page is a table of contents: \
             a listing of the document's chapters/sections, with or without \
             page numbers. Lists of figures or tables alone, bibliographies, \
             abstracts and ordinary body text do not count.\n\
             Reply JSON: {\"is_toc\": \"yes\" or \"no\"}";
        let user = format!(
            "Page content (truncated):\n---\n{}\n---\nIs this a table of contents? Reply in JSON.",
            truncate_chars(page_text, 2000)
        );

        match self
            .llm
            .chat_json(PHASE, &ChatRequest::new(system, user))
            .await
        {
            Ok(v) => Ok(v
                .get("is_toc")
                .and_then(|x| x.as_str())
                .map(|s| s.eq_ignore_ascii_case("yes"))
                .unwrap_or(false)),
            Err(e) if e.is_fatal() => Err(PageTreeError::llm(PHASE, e)),
            // Degraded confirmation: treat as "not a contents page".
            Err(_) => Ok(false),
        }
    }

    /// Ask whether the contents listing carries per-section page numbers
    /// (footer markers do not count).
    async fn probe_page_numbers(&self, contents: &str) -> Result<bool> {
        let system = "Decide whether this table of contents lists a page number for \
             its sections (numbers at line ends such as \"Chapter 1 ..... 5\"). \
             Page footers like \"Page 3 of 100\" do not count.\n\
             Reply JSON: {\"has_page_numbers\": \"yes\" or \"no\"}";
        let user = format!(
            "Table of contents text:\n---\n{}\n---\nReply in JSON.",
            truncate_chars(contents, 3000)
        );

        match self
            .llm
            .chat_json(PHASE, &ChatRequest::new(system, user))
            .await
        {
            Ok(value) => Ok(value
                .get("has_page_numbers")
                .and_then(|x| x.as_str())
                .map(|s| s.eq_ignore_ascii_case("yes"))
                // When in doubt, the textual shape heuristic decides.
                .unwrap_or_else(|| contents_lines_end_in_numbers(contents))),
            Err(e) if e.is_fatal() => Err(PageTreeError::llm(PHASE, e)),
            Err(_) => Ok(contents_lines_end_in_numbers(contents)),
        }
    }
}

/// Validator for a single TOC entry title.
///
/// Rejects parsing debris: too short/long, pure punctuation, sentence
/// fragments, stray list markers, and form-field labels.
pub fn is_valid_outline_title(title: &str) -> bool {
    let title = title.trim();
    let char_count = title.chars().count();

    if char_count < 2 || char_count > 80 {
        return false;
    }

    if !title.chars().any(|c| c.is_alphanumeric()) {
        return false;
    }

    // Sentence-terminal punctuation marks a content fragment, not a heading,
    // unless the entry starts with a recognised heading token.
    let sentence_marks = ['。', '，', '！', '？', '!', '?'];
    if title.chars().any(|c| sentence_marks.contains(&c)) {
        const HEADING_PREFIXES: &[&str] = &[
            "第", "（", "(", "附件", "表", "图", "Chapter", "Appendix", "Part", "Section",
        ];
        if !HEADING_PREFIXES.iter().any(|p| title.starts_with(p)) {
            return false;
        }
    }

    // "G. some clause text" style list markers leaked from body content.
    let chars: Vec<char> = title.chars().collect();
    if char_count > 2 && chars[0].is_alphabetic() && chars[1] == '.' {
        let rest: String = chars[2..].iter().collect();
        let rest = rest.trim_start();
        const MARKER_EXCEPTIONS: &[&str] = &["附", "补", "表", "图", "Appendix", "Annex"];
        if !MARKER_EXCEPTIONS.iter().any(|p| rest.starts_with(p)) {
            return false;
        }
    }

    // Form-field labels: trailing colon after a form keyword.
    if title.ends_with('：') || title.ends_with(':') {
        const FORM_KEYWORDS: &[&str] = &[
            "地址", "时间", "日期", "名称", "公章", "签字", "盖章", "电话", "传真", "邮编",
            "address", "phone", "date", "name", "fax", "signature",
        ];
        let lower = title.to_lowercase();
        if FORM_KEYWORDS.iter().any(|kw| lower.contains(kw)) || title.contains("  ") {
            return false;
        }
    }

    true
}

/// Chapter-pattern detection used to promote entries to level 1.
pub fn is_chapter_title(title: &str) -> bool {
    let chapter_cn = Regex::new(r"^第[一二三四五六七八九十百0-9]+章").unwrap();
    let chapter_en = Regex::new(r"(?i)^chapter\s*[0-9IVX]+").unwrap();
    chapter_cn.is_match(title) || chapter_en.is_match(title)
}

/// Cheap candidate test: keyword signature or the characteristic shape of a
/// contents listing (many short lines ending in page numbers).
pub fn looks_like_contents_page(text: &str) -> bool {
    let lower = text.to_lowercase();
    // Keyword must appear early; a bibliography citing "contents" deep in the
    // page does not qualify.
    let head: String = lower.chars().take(400).collect();
    if TOC_KEYWORDS.iter().any(|kw| head.contains(kw)) {
        return true;
    }
    contents_lines_end_in_numbers(text)
}

fn contents_lines_end_in_numbers(text: &str) -> bool {
    let trailing_number = Regex::new(r"\d{1,4}\s*$").unwrap();
    let matching = text
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && line.chars().count() < 80 && trailing_number.is_match(line)
        })
        .count();
    matching >= MIN_CONTENTS_SHAPE_LINES
}

/// Replace dot leaders ("Chapter 1 ...... 5") with a colon so the extractor
/// sees clean `title: page` lines.
pub fn clean_contents_format(text: &str) -> String {
    let dots = Regex::new(r"\.{4,}").unwrap();
    let spaced_dots = Regex::new(r"(?:\. ){4,}\.?").unwrap();
    let text = dots.replace_all(text, ": ");
    spaced_dots.replace_all(&text, ": ").into_owned()
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

    #[test]
    fn test_validator_accepts_ordinary_headings() {
        assert!(is_valid_outline_title("Introduction"));
        assert!(is_valid_outline_title("1.2 Background and Motivation"));
        assert!(is_valid_outline_title("第三章 评标办法"));
        assert!(is_valid_outline_title("Appendix B: Data Tables"));
    }

    #[test]
    fn test_validator_rejects_length_extremes() {
        assert!(!is_valid_outline_title("A"));
        assert!(!is_valid_outline_title(&"x".repeat(81)));
    }

    #[test]
    fn test_validator_rejects_punctuation_and_fragments() {
        assert!(!is_valid_outline_title("....."));
        assert!(!is_valid_outline_title("———"));
        assert!(!is_valid_outline_title("供应商应当在开标前提交文件。"));
        // Heading-prefixed entries keep their punctuation allowance.
        assert!(is_valid_outline_title("（一）甲方的权利和义务。"));
    }

    #[test]
    fn test_validator_rejects_list_markers_and_form_fields() {
        assert!(!is_valid_outline_title("G.存在共同直接或间接投资的"));
        assert!(is_valid_outline_title("A.附录一"));
        assert!(!is_valid_outline_title("地    址："));
        assert!(!is_valid_outline_title("phone:"));
    }

    #[test]
    fn test_chapter_detection() {
        assert!(is_chapter_title("第一章 招标公告"));
        assert!(is_chapter_title("第12章 合同条款"));
        assert!(is_chapter_title("Chapter 3 Results"));
        assert!(is_chapter_title("CHAPTER IV"));
        assert!(!is_chapter_title("1.2 Background"));
    }

    #[test]
    fn test_contents_shape_heuristic() {
        let toc = "Contents\nIntroduction ........ 3\nMethods ........ 11\n\
                   Results ........ 21\nDiscussion ........ 35\nReferences ........ 40\n";
        assert!(looks_like_contents_page(toc));

        let body = "This chapter develops the main argument of the thesis. \
                    It begins with a review of the literature.";
        assert!(!looks_like_contents_page(body));
    }

    #[test]
    fn test_keyword_signature_multilingual() {
        assert!(looks_like_contents_page("目录\n第一章 概述\n第二章 方法"));
        assert!(looks_like_contents_page("Table of Contents\nPreface\nOverview"));
    }

    #[test]
    fn test_clean_contents_format() {
        assert_eq!(
            clean_contents_format("Introduction ....... 5"),
            "Introduction : 5"
        );
        assert_eq!(
            clean_contents_format("Methods . . . . . . 11"),
            "Methods : 11"
        );
    }
}
