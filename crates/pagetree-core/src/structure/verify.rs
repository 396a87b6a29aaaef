//! Verification and repair: confirm that mapped titles actually appear on
//! their pages, and heal the ones that do not.
//!
//! The verification budget goes to the deepest items first: chapter titles
//! are usually easy, fine-grained subsections are where extraction errs.
//! Results are written back by `list_index`, never by completion order.

use futures::future::join_all;
use tracing::{debug, info, warn};

use pagetree_llm::{ChatRequest, LlmDispatcher};

use crate::error::{PageTreeError, Result};
use crate::matching::{locate_title, TitlePosition};
use crate::model::TocItem;
use crate::options::BuildOptions;
use crate::pdf::{parse_physical_index_tag, PdfParser};
use crate::structure::codes::leaf_indices;
use crate::structure::map::textual_search;

const PHASE: &str = "verification";

/// Accuracy below which the smart fixer runs over the failures.
const FIX_TRIGGER_ACCURACY: f64 = 0.8;
/// Pages searched on each side of the mapped page during textual fixing.
const FIX_NEIGHBORHOOD: usize = 3;
/// Existence checks look at this many characters of the page.
const PAGE_PROBE_CHARS: usize = 2000;
/// A page with less content than this is likely a bare listing, so a string
/// match alone is not trusted.
const SUBSTANTIAL_CONTENT_CHARS: usize = 200;

/// Aggregate outcome of the verification phase.
#[derive(Debug, Clone, Default)]
pub struct VerificationOutcome {
    /// Fraction of the cohort whose title was confirmed on its mapped page.
    pub accuracy: f64,
    /// Items actually checked.
    pub cohort_size: usize,
    /// Items that passed.
    pub passed: usize,
    /// Leaves that were eligible but skipped (budget or large-PDF policy).
    pub skipped: usize,
}

enum CheckResult {
    Passed { appear_start: bool },
    Failed,
}

/// Phase 5 verifier.
pub struct Verifier<'a> {
    llm: &'a LlmDispatcher,
}

impl<'a> Verifier<'a> {
    pub fn new(llm: &'a LlmDispatcher) -> Self {
        Self { llm }
    }

    /// Verify the deepest-first leaf cohort and heal failures in place.
    pub async fn verify(
        &self,
        items: &mut [TocItem],
        parser: &PdfParser,
        options: &BuildOptions,
    ) -> Result<VerificationOutcome> {
        if items.is_empty() {
            return Ok(VerificationOutcome {
                accuracy: 1.0,
                ..Default::default()
            });
        }

        let codes: Vec<&str> = items.iter().map(|i| i.structure.as_str()).collect();
        let leaves = leaf_indices(&codes);
        let leaf_count = leaves.len();

        // Deepest first, then document order.
        let mut cohort = leaves;
        cohort.sort_by_key(|&i| (std::cmp::Reverse(items[i].level()), i));

        let is_large = parser.total_pages() > options.large_pdf_threshold;
        if cohort.len() > options.max_verify_count {
            cohort.truncate(options.max_verify_count);
        } else if is_large && !options.force_verification {
            info!(
                total_pages = parser.total_pages(),
                "large document, verification skipped"
            );
            return Ok(VerificationOutcome {
                accuracy: 1.0,
                skipped: leaf_count,
                ..Default::default()
            });
        }
        let skipped = leaf_count - cohort.len();

        debug!(
            cohort = cohort.len(),
            skipped, "verifying deepest-first leaf cohort"
        );

        // Fan out existence checks; the dispatcher's semaphore caps real
        // concurrency. Results come back tagged with their item index.
        let checks = cohort.iter().map(|&i| {
            let item = items[i].clone();
            async move { (i, self.check_existence(&item, parser).await) }
        });
        let results = join_all(checks).await;

        let mut passed = 0usize;
        let mut failed_indices = Vec::new();
        for (i, result) in results {
            match result {
                Ok(CheckResult::Passed { appear_start }) => {
                    items[i].validation_passed = Some(true);
                    items[i].appear_start = appear_start;
                    passed += 1;
                }
                Ok(CheckResult::Failed) => {
                    items[i].validation_passed = Some(false);
                    failed_indices.push(i);
                }
                Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
                Err(e) => {
                    warn!(item = i, error = %e, "existence check errored, item marked failed");
                    items[i].validation_passed = Some(false);
                    failed_indices.push(i);
                }
            }
        }

        let mut accuracy = if cohort.is_empty() {
            1.0
        } else {
            passed as f64 / cohort.len() as f64
        };

        if accuracy < FIX_TRIGGER_ACCURACY && !failed_indices.is_empty() {
            let fixed = self.fix_failures(items, &failed_indices, parser).await?;
            passed += fixed;
            accuracy = passed as f64 / cohort.len() as f64;
        }

        // Parents count as verified through their children; skipped leaves
        // keep whatever the mapper concluded.
        let cohort_set: std::collections::HashSet<usize> = cohort.iter().copied().collect();
        let leaf_set: std::collections::HashSet<usize> =
            leaf_indices(&items.iter().map(|i| i.structure.as_str()).collect::<Vec<_>>())
                .into_iter()
                .collect();
        for (i, item) in items.iter_mut().enumerate() {
            if !leaf_set.contains(&i) {
                item.validation_passed = Some(true);
            } else if !cohort_set.contains(&i) && item.validation_passed.is_none() {
                item.validation_passed = Some(false);
            }
        }

        info!(
            cohort = cohort.len(),
            passed,
            accuracy = format!("{:.1}%", accuracy * 100.0),
            "verification complete"
        );

        Ok(VerificationOutcome {
            accuracy,
            cohort_size: cohort.len(),
            passed,
            skipped,
        })
    }

    /// Existence check for one item: a normalised string match against the
    /// mapped page short-circuits the LLM; otherwise the LLM distinguishes a
    /// real heading from a contents-page reference.
    async fn check_existence(
        &self,
        item: &TocItem,
        parser: &PdfParser,
    ) -> std::result::Result<CheckResult, pagetree_llm::LlmError> {
        let Some(page_num) = item.physical_index else {
            return Ok(CheckResult::Failed);
        };
        let Some(page) = parser.page(page_num) else {
            return Ok(CheckResult::Failed);
        };

        let probe: String = page.text.chars().take(PAGE_PROBE_CHARS).collect();
        let substantial = probe.trim().chars().count() > SUBSTANTIAL_CONTENT_CHARS;

        match locate_title(&item.title, &probe) {
            TitlePosition::AtTop if substantial => {
                return Ok(CheckResult::Passed { appear_start: false });
            }
            TitlePosition::MidPage if substantial => {
                return Ok(CheckResult::Passed { appear_start: true });
            }
            _ => {}
        }

        let system = "Check whether the section title appears in the page content as a real \
             section heading, not merely as a table-of-contents reference. Use fuzzy \
             matching for minor spacing or formatting differences.\n\
             Reply JSON: {\"exists\": \"yes\"|\"no\", \"is_toc_page\": \"yes\"|\"no\"}";
        let user = format!(
            "Section title: \"{}\"\n\nPage content:\n---\n{}\n---\n\
             Does the title appear as a real heading? Reply in JSON.",
            item.title, probe
        );

        let value = self
            .llm
            .chat_json(PHASE, &ChatRequest::new(system, user))
            .await?;

        let exists = value
            .get("exists")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        let is_toc_page = value
            .get("is_toc_page")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);

        if exists && !is_toc_page {
            Ok(CheckResult::Passed { appear_start: false })
        } else {
            Ok(CheckResult::Failed)
        }
    }

    /// Smart fixer: search the ±3 page neighbourhood textually, then fall
    /// back to an LLM search over the window between the nearest verified
    /// neighbours. Fixes are re-verified before being accepted. Returns how
    /// many items were healed.
    async fn fix_failures(
        &self,
        items: &mut [TocItem],
        failed: &[usize],
        parser: &PdfParser,
    ) -> Result<usize> {
        debug!(failures = failed.len(), "smart fixer running");
        let mut fixed = 0usize;

        for &i in failed {
            let title = items[i].title.clone();
            let current = items[i].physical_index;

            // Textual pass over the close neighbourhood.
            if let Some(page) = current {
                let lo = page.saturating_sub(FIX_NEIGHBORHOOD).max(1);
                let hi = page + FIX_NEIGHBORHOOD;
                if let Some(found) = textual_search(&title, parser, lo, hi) {
                    if found != page {
                        debug!(item = i, from = page, to = found, "fixed by neighbourhood search");
                    }
                    items[i].physical_index = Some(found);
                    items[i].validation_passed = Some(true);
                    fixed += 1;
                    continue;
                }
            }

            // Windowed LLM search between verified neighbours.
            let lo = items[..i]
                .iter()
                .rev()
                .find(|it| it.validation_passed == Some(true))
                .and_then(|it| it.physical_index)
                .unwrap_or(1);
            let hi = items[i + 1..]
                .iter()
                .find(|it| it.validation_passed == Some(true))
                .and_then(|it| it.physical_index)
                .unwrap_or_else(|| parser.total_pages());

            match self.llm_window_search(&title, parser, lo, hi).await {
                Ok(Some(found)) => {
                    // Accept only when the fix itself verifies.
                    let confirmed = parser
                        .page(found)
                        .map(|p| {
                            locate_title(&title, &p.text.chars().take(PAGE_PROBE_CHARS).collect::<String>())
                                != TitlePosition::Absent
                        })
                        .unwrap_or(false);
                    if confirmed {
                        debug!(item = i, page = found, "fixed by windowed LLM search");
                        items[i].physical_index = Some(found);
                        items[i].validation_passed = Some(true);
                        fixed += 1;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
                Err(e) => {
                    warn!(item = i, error = %e, "windowed fix failed");
                }
            }
        }

        info!(fixed, of = failed.len(), "smart fixer done");
        Ok(fixed)
    }

    async fn llm_window_search(
        &self,
        title: &str,
        parser: &PdfParser,
        lo: usize,
        hi: usize,
    ) -> std::result::Result<Option<usize>, pagetree_llm::LlmError> {
        let window = parser.labeled_window(lo, hi);
        if window.is_empty() {
            return Ok(None);
        }
        let window: String = window.chars().take(25_000).collect();

        let system = "Find the page where this section actually starts. The content wraps \
             every page in <physical_index_N> markers.\n\
             Reply JSON: {\"physical_index\": \"<physical_index_N>\" or null}";
        let user = format!(
            "Section title: \"{}\"\n\nSearch range:\n---\n{}\n---\n\
             Return the marker of the correct page as JSON.",
            title, window
        );

        let value = self
            .llm
            .chat_json(PHASE, &ChatRequest::new(system, user))
            .await?;

        Ok(value
            .get("physical_index")
            .and_then(|v| v.as_str())
            .and_then(parse_physical_index_tag)
            .filter(|&p| p >= lo && p <= hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagetree_llm::{ChatCompletion, LlmChatClient};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::pdf::PdfPage;

    /// Mock that answers every existence check with a fixed verdict.
    #[derive(Debug)]
    struct VerdictClient {
        exists: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmChatClient for VerdictClient {
        async fn chat_completion(
            &self,
            _system: &str,
            _user: &str,
            _max_tokens: Option<u32>,
            _json_mode: bool,
        ) -> pagetree_llm::Result<ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let content = format!(
                "{{\"exists\": \"{}\", \"is_toc_page\": \"no\", \"physical_index\": null}}",
                if self.exists { "yes" } else { "no" }
            );
            Ok(ChatCompletion {
                provider: "mock".into(),
                content,
                total_tokens: 5,
            })
        }
    }

    fn parser_with_pages(texts: &[&str]) -> PdfParser {
        PdfParser::from_cached_pages(
            texts
                .iter()
                .enumerate()
                .map(|(i, text)| PdfPage {
                    physical_index: i + 1,
                    tokens: crate::pdf::estimate_tokens(text),
                    text: text.to_string(),
                })
                .collect(),
        )
    }

    fn mapped_item(code: &str, title: &str, page: usize, idx: usize) -> TocItem {
        let mut item = TocItem::new(code, title);
        item.physical_index = Some(page);
        item.list_index = Some(idx);
        item
    }

    fn long_page(heading: &str) -> String {
        format!("{}\n{}", heading, "body text follows with enough content. ".repeat(12))
    }

    #[tokio::test]
    async fn test_string_fast_path_avoids_llm() {
        let pages = [long_page("Introduction"), long_page("Methods")];
        let parser = parser_with_pages(&[&pages[0], &pages[1]]);
        let client = Arc::new(VerdictClient {
            exists: false,
            calls: AtomicU32::new(0),
        });
        let dispatcher = LlmDispatcher::new(client.clone(), 4);

        let mut items = vec![
            mapped_item("1", "Introduction", 1, 0),
            mapped_item("2", "Methods", 2, 1),
        ];
        let outcome = Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.passed, 2);
        assert_eq!(outcome.accuracy, 1.0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(items[0].validation_passed, Some(true));
        assert!(!items[0].appear_start);
    }

    #[tokio::test]
    async fn test_midpage_title_sets_appear_start() {
        let filler = "preceding section body text. ".repeat(60);
        let page1 = long_page("Alpha");
        let page2 = format!("{}\nBeta Section\nits body begins here", filler);
        let parser = parser_with_pages(&[&page1, &page2]);
        let dispatcher = LlmDispatcher::new(
            Arc::new(VerdictClient {
                exists: false,
                calls: AtomicU32::new(0),
            }),
            4,
        );

        let mut items = vec![
            mapped_item("1", "Alpha", 1, 0),
            mapped_item("2", "Beta Section", 2, 1),
        ];
        Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(items[1].validation_passed, Some(true));
        assert!(items[1].appear_start);
        assert!(!items[0].appear_start);
    }

    #[tokio::test]
    async fn test_neighbourhood_fix_moves_item() {
        // Item mapped to page 1 but the heading is on page 3.
        let page1 = long_page("Unrelated Opening");
        let page2 = long_page("Another Section");
        let page3 = long_page("Misplaced Heading");
        let parser = parser_with_pages(&[&page1, &page2, &page3]);
        let dispatcher = LlmDispatcher::new(
            Arc::new(VerdictClient {
                exists: false,
                calls: AtomicU32::new(0),
            }),
            4,
        );

        let mut items = vec![mapped_item("1", "Misplaced Heading", 1, 0)];
        let outcome = Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(items[0].physical_index, Some(3));
        assert_eq!(items[0].validation_passed, Some(true));
        assert_eq!(outcome.passed, 1);
    }

    #[tokio::test]
    async fn test_unfixable_item_retained_as_failed() {
        let page = long_page("Only Heading Here");
        let parser = parser_with_pages(&[&page]);
        let dispatcher = LlmDispatcher::new(
            Arc::new(VerdictClient {
                exists: false,
                calls: AtomicU32::new(0),
            }),
            4,
        );

        let mut items = vec![mapped_item("1", "Phantom Section", 1, 0)];
        let outcome = Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.passed, 0);
        assert_eq!(items[0].validation_passed, Some(false));
        // The item is retained, not dropped.
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_cohort_prefers_deepest_items() {
        let pages: Vec<String> = (0..4).map(|i| long_page(&format!("H{}", i))).collect();
        let refs: Vec<&str> = pages.iter().map(|s| s.as_str()).collect();
        let parser = parser_with_pages(&refs);
        let dispatcher = LlmDispatcher::new(
            Arc::new(VerdictClient {
                exists: false,
                calls: AtomicU32::new(0),
            }),
            4,
        );

        // Two leaves: "1.1.1" (level 3) and "2" (level 1). Budget of one
        // verification goes to the deeper leaf.
        let mut items = vec![
            mapped_item("1", "H0", 1, 0),
            mapped_item("1.1", "H1", 2, 1),
            mapped_item("1.1.1", "H2", 3, 2),
            mapped_item("2", "H3", 4, 3),
        ];
        let options = BuildOptions {
            max_verify_count: 1,
            ..Default::default()
        };
        let outcome = Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &options)
            .await
            .unwrap();

        assert_eq!(outcome.cohort_size, 1);
        // The deep leaf got verified; the shallow one was skipped.
        assert_eq!(items[2].validation_passed, Some(true));
        assert_eq!(items[3].validation_passed, Some(false));
        assert_eq!(outcome.skipped, 1);
        // Parents are marked verified through their children.
        assert_eq!(items[0].validation_passed, Some(true));
    }

    #[tokio::test]
    async fn test_large_pdf_skip_and_force() {
        let page = long_page("Heading");
        let pages: Vec<&str> = std::iter::repeat(page.as_str()).take(5).collect();
        let parser = parser_with_pages(&pages);
        let dispatcher = LlmDispatcher::new(
            Arc::new(VerdictClient {
                exists: false,
                calls: AtomicU32::new(0),
            }),
            4,
        );

        let mut items = vec![mapped_item("1", "Heading", 1, 0)];
        let options = BuildOptions {
            large_pdf_threshold: 3,
            ..Default::default()
        };
        let outcome = Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &options)
            .await
            .unwrap();
        assert_eq!(outcome.cohort_size, 0);
        assert_eq!(outcome.skipped, 1);

        let forced = BuildOptions {
            large_pdf_threshold: 3,
            force_verification: true,
            ..Default::default()
        };
        let outcome = Verifier::new(&dispatcher)
            .verify(&mut items, &parser, &forced)
            .await
            .unwrap();
        assert_eq!(outcome.cohort_size, 1);
    }
}
