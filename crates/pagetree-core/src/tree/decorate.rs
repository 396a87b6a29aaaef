//! Payload decoration: node ids, text slices, and summaries.
//!
//! Node ids are assigned in pre-order as zero-padded sequential integers, so
//! they are unique, stable for a given input, and sort lexicographically in
//! pre-order. Summaries are cached by title plus page range, so identical
//! nodes within one document cost a single LLM call.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::{debug, warn};

use pagetree_llm::{ChatRequest, LlmDispatcher};

use crate::error::{PageTreeError, Result};
use crate::model::TreeNode;
use crate::pdf::PdfParser;

const PHASE: &str = "summaries";

/// Characters of node text handed to the summary prompt.
const SUMMARY_INPUT_CHARS: usize = 8_000;

/// Assign pre-order `node_id` values: `"0000"`, `"0001"`, ...
pub fn assign_node_ids(roots: &mut [TreeNode]) {
    let mut counter = 0usize;
    for root in roots.iter_mut() {
        root.visit_mut(&mut |node| {
            node.node_id = Some(format!("{:04}", counter));
            counter += 1;
        });
    }
}

/// Attach each node's page-range text, markers excluded.
pub fn attach_text(roots: &mut [TreeNode], parser: &PdfParser) {
    for root in roots.iter_mut() {
        root.visit_mut(&mut |node| {
            let text = parser
                .pages_in(node.start_index, node.end_index)
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            node.text = Some(text);
        });
    }
}

/// Attach an LLM summary to every node, deduplicating identical
/// (title, range) inputs through a per-document cache. Failed summaries are
/// left absent; the phase never fails the pipeline.
pub async fn attach_summaries(
    roots: &mut [TreeNode],
    parser: &PdfParser,
    llm: &LlmDispatcher,
) -> Result<()> {
    // Collect unique summary inputs.
    let mut inputs: Vec<(String, usize, usize)> = Vec::new();
    for root in roots.iter_mut() {
        root.visit_mut(&mut |node| {
            let key = (node.title.clone(), node.start_index, node.end_index);
            if !inputs.contains(&key) {
                inputs.push(key);
            }
        });
    }
    debug!(unique = inputs.len(), "summarizing nodes");

    let tasks = inputs.iter().map(|(title, start, end)| {
        let text: String = parser
            .pages_in(*start, *end)
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
            .chars()
            .take(SUMMARY_INPUT_CHARS)
            .collect();
        async move {
            let system = "Summarize this document section in two or three sentences. \
                 Focus on what the section covers, not how it is written. \
                 Reply JSON: {\"summary\": \"...\"}";
            let user = format!(
                "Section title: \"{}\"\n\nSection text:\n---\n{}\n---\nReply in JSON.",
                title, text
            );
            llm.chat_json(PHASE, &ChatRequest::new(system, user).with_max_tokens(300))
                .await
        }
    });

    let results = join_all(tasks).await;

    let mut cache: HashMap<(String, usize, usize), String> = HashMap::new();
    for (key, result) in inputs.into_iter().zip(results) {
        match result {
            Ok(value) => {
                if let Some(summary) = value.get("summary").and_then(|s| s.as_str()) {
                    cache.insert(key, summary.trim().to_string());
                }
            }
            Err(e) if e.is_fatal() => return Err(PageTreeError::llm(PHASE, e)),
            Err(e) => {
                warn!(title = %key.0, error = %e, "summary failed, node left without one");
            }
        }
    }

    for root in roots.iter_mut() {
        root.visit_mut(&mut |node| {
            let key = (node.title.clone(), node.start_index, node.end_index);
            if let Some(summary) = cache.get(&key) {
                node.summary = Some(summary.clone());
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagetree_llm::{ChatCompletion, LlmChatClient};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::pdf::PdfPage;

    fn two_level_tree() -> Vec<TreeNode> {
        let mut root = TreeNode::new("Root", 1, 4);
        root.nodes.push(TreeNode::new("Child A", 1, 2));
        root.nodes.push(TreeNode::new("Child B", 3, 4));
        vec![root, TreeNode::new("Second", 5, 6)]
    }

    #[test]
    fn test_node_ids_preorder_and_unique() {
        let mut roots = two_level_tree();
        assign_node_ids(&mut roots);

        let mut ids = Vec::new();
        for root in &mut roots {
            root.visit_mut(&mut |n| ids.push(n.node_id.clone().unwrap()));
        }
        assert_eq!(ids, vec!["0000", "0001", "0002", "0003"]);

        // Lexicographic order equals assignment (pre-order) order.
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_node_ids_stable_across_runs() {
        let mut a = two_level_tree();
        let mut b = two_level_tree();
        assign_node_ids(&mut a);
        assign_node_ids(&mut b);
        assert_eq!(a[0].nodes[1].node_id, b[0].nodes[1].node_id);
    }

    #[test]
    fn test_attach_text_slices_range() {
        let parser = PdfParser::from_cached_pages(
            (1..=6)
                .map(|n| PdfPage {
                    physical_index: n,
                    tokens: 2,
                    text: format!("page-{}", n),
                })
                .collect(),
        );
        let mut roots = two_level_tree();
        attach_text(&mut roots, &parser);

        assert_eq!(roots[0].nodes[1].text.as_deref(), Some("page-3\n\npage-4"));
        assert_eq!(roots[1].text.as_deref(), Some("page-5\n\npage-6"));
        // No boundary markers leak into the payload.
        assert!(!roots[0].text.as_deref().unwrap().contains("physical_index"));
    }

    #[derive(Debug)]
    struct CountingSummarizer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmChatClient for CountingSummarizer {
        async fn chat_completion(
            &self,
            _system: &str,
            user: &str,
            _max_tokens: Option<u32>,
            _json_mode: bool,
        ) -> pagetree_llm::Result<ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let title = user
                .lines()
                .find_map(|l| l.strip_prefix("Section title: "))
                .unwrap_or("?");
            Ok(ChatCompletion {
                provider: "mock".into(),
                content: format!("{{\"summary\": \"About {}\"}}", title.trim_matches('"')),
                total_tokens: 5,
            })
        }
    }

    #[tokio::test]
    async fn test_summaries_cached_by_title_and_range() {
        let parser = PdfParser::from_cached_pages(
            (1..=4)
                .map(|n| PdfPage {
                    physical_index: n,
                    tokens: 2,
                    text: format!("content {}", n),
                })
                .collect(),
        );
        let client = Arc::new(CountingSummarizer {
            calls: AtomicU32::new(0),
        });
        let llm = LlmDispatcher::new(client.clone(), 4);

        // Two nodes with identical title and range: one LLM call.
        let mut roots = vec![
            TreeNode::new("Duplicate", 1, 2),
            TreeNode::new("Duplicate", 1, 2),
            TreeNode::new("Unique", 3, 4),
        ];
        attach_summaries(&mut roots, &parser, &llm).await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert!(roots[0].summary.as_deref().unwrap().contains("Duplicate"));
        assert_eq!(roots[0].summary, roots[1].summary);
        assert!(roots[2].summary.as_deref().unwrap().contains("Unique"));
    }
}
