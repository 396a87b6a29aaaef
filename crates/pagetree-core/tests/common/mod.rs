//! Shared fixtures: in-memory PDF construction, a keyword-routed LLM mock,
//! and the tree invariant assertions.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use pagetree_core::{LlmChatClient, TreeNode};
use pagetree_llm::ChatCompletion;

/// Build a PDF with one text page per entry and an optional embedded
/// outline of `(level, title, 1-based page)` entries.
pub fn build_pdf(pages_text: &[String], outline: &[(usize, &str, usize)]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => Object::Reference(font_id) },
    });

    let mut page_ids: Vec<ObjectId> = Vec::new();
    for text in pages_text {
        let mut operations = Vec::new();
        for (i, line) in text.lines().enumerate() {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new("Tf", vec!["F1".into(), 12.into()]));
            operations.push(Operation::new(
                "Td",
                vec![50.into(), (750 - 14 * i as i64).into()],
            ));
            operations.push(Operation::new("Tj", vec![Object::string_literal(line.as_bytes())]));
            operations.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "Contents" => Object::Reference(content_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        page_ids.push(page_id);
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids.iter().map(|&id| Object::Reference(id)).collect::<Vec<_>>(),
            "Count" => page_ids.len() as i64,
            "Resources" => Object::Reference(resources_id),
        }),
    );

    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    };

    if !outline.is_empty() {
        let outlines_root = doc.new_object_id();
        let item_ids: Vec<ObjectId> = outline.iter().map(|_| doc.new_object_id()).collect();

        for (i, &(level, title, page)) in outline.iter().enumerate() {
            let mut dict = dictionary! {
                "Title" => Object::string_literal(title.as_bytes()),
                "Dest" => vec![
                    Object::Reference(page_ids[page - 1]),
                    Object::Name(b"Fit".to_vec()),
                ],
            };
            // First child: the next entry when it is one level deeper.
            if let Some(&(next_level, _, _)) = outline.get(i + 1) {
                if next_level == level + 1 {
                    dict.set("First", Object::Reference(item_ids[i + 1]));
                }
            }
            // Next sibling: the next entry at the same level before any
            // shallower entry.
            for (j, &(later_level, _, _)) in outline.iter().enumerate().skip(i + 1) {
                if later_level < level {
                    break;
                }
                if later_level == level {
                    dict.set("Next", Object::Reference(item_ids[j]));
                    break;
                }
            }
            doc.objects.insert(item_ids[i], Object::Dictionary(dict));
        }

        let first_top = outline
            .iter()
            .position(|&(level, _, _)| level == 1)
            .unwrap_or(0);
        doc.objects.insert(
            outlines_root,
            Object::Dictionary(dictionary! {
                "Type" => "Outlines",
                "First" => Object::Reference(item_ids[first_top]),
            }),
        );
        catalog.set("Outlines", Object::Reference(outlines_root));
    }

    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save pdf");
    bytes
}

/// A page that carries a heading plus enough body text to count as a
/// content page during verification.
pub fn content_page(heading: &str) -> String {
    format!(
        "{}\n{}",
        heading,
        "This page carries ordinary body text that keeps going for a while \
         so that checks treat it as real content rather than a bare listing. "
            .repeat(3)
    )
}

/// LLM mock that routes on prompt keywords; every exchange is recorded.
#[derive(Debug)]
pub struct RouterClient {
    pub calls: Mutex<Vec<String>>,
    /// JSON returned for printed-contents extraction requests.
    pub contents_response: String,
    /// JSON returned for body-content structure extraction requests.
    pub content_response: String,
    /// Verdict for verification existence checks.
    pub exists: bool,
}

impl Default for RouterClient {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            contents_response: r#"{"table_of_contents": []}"#.to_string(),
            content_response: r#"{"table_of_contents": []}"#.to_string(),
            exists: true,
        }
    }
}

impl RouterClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_contents(contents_response: &str) -> Arc<Self> {
        Arc::new(Self {
            contents_response: contents_response.to_string(),
            ..Default::default()
        })
    }

    pub fn with_content_structure(content_response: &str) -> Arc<Self> {
        Arc::new(Self {
            content_response: content_response.to_string(),
            ..Default::default()
        })
    }

    pub fn saw_prompt_containing(&self, needle: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|prompt| prompt.contains(needle))
    }
}

#[async_trait]
impl LlmChatClient for RouterClient {
    async fn chat_completion(
        &self,
        system: &str,
        user: &str,
        _max_tokens: Option<u32>,
        _json_mode: bool,
    ) -> pagetree_llm::Result<ChatCompletion> {
        self.calls.lock().unwrap().push(format!("{}\n{}", system, user));

        let content = if system.contains("is a table of contents") {
            r#"{"is_toc": "yes"}"#.to_string()
        } else if system.contains("lists a page number") {
            r#"{"has_page_numbers": "yes"}"#.to_string()
        } else if system.contains("Extract the table of contents") {
            self.contents_response.clone()
        } else if system.contains("real section heading") {
            format!(
                r#"{{"exists": "{}", "is_toc_page": "no"}}"#,
                if self.exists { "yes" } else { "no" }
            )
        } else if system.contains("where this section actually starts") {
            r#"{"physical_index": null}"#.to_string()
        } else if system.contains("section headings from these document pages") {
            r#"{"table_of_contents": []}"#.to_string()
        } else if system.contains("hierarchical section structure") {
            self.content_response.clone()
        } else if system.contains("Summarize") {
            r#"{"summary": "A short summary."}"#.to_string()
        } else {
            "{}".to_string()
        };

        Ok(ChatCompletion {
            provider: "mock".into(),
            content,
            total_tokens: 10,
        })
    }
}

/// Assert every structural invariant of the returned tree.
pub fn assert_tree_invariants(roots: &[TreeNode], total_pages: usize) {
    // Ranges in bounds, parents cover children, siblings ordered.
    fn check_node(node: &TreeNode, total_pages: usize) {
        assert!(node.start_index >= 1, "start below 1: {:?}", node.title);
        assert!(
            node.start_index <= node.end_index,
            "inverted range on {:?}: [{}, {}]",
            node.title,
            node.start_index,
            node.end_index
        );
        assert!(
            node.end_index <= total_pages,
            "end beyond document on {:?}",
            node.title
        );
        for child in &node.nodes {
            assert!(
                node.start_index <= child.start_index && node.end_index >= child.end_index,
                "parent {:?} [{}, {}] does not cover child {:?} [{}, {}]",
                node.title,
                node.start_index,
                node.end_index,
                child.title,
                child.start_index,
                child.end_index
            );
            check_node(child, total_pages);
        }
        for pair in node.nodes.windows(2) {
            assert!(
                pair[0].start_index <= pair[1].start_index,
                "sibling order violated under {:?}",
                node.title
            );
        }
    }
    for root in roots {
        check_node(root, total_pages);
    }
    for pair in roots.windows(2) {
        assert!(pair[0].start_index <= pair[1].start_index, "root order violated");
    }

    // Depth cap.
    let depth = roots.iter().map(|r| r.depth()).max().unwrap_or(0);
    assert!(depth <= 4, "tree depth {} exceeds cap", depth);

    // Full leaf coverage.
    let mut covered = BTreeSet::new();
    let mut leaves = Vec::new();
    for root in roots {
        root.collect_leaves(&mut leaves);
    }
    for leaf in leaves {
        for page in leaf.start_index..=leaf.end_index {
            covered.insert(page);
        }
    }
    for page in 1..=total_pages {
        assert!(covered.contains(&page), "page {} uncovered", page);
    }

    // node_id uniqueness and pre-order lexicographic sorting.
    let mut ids = Vec::new();
    fn collect_ids(node: &TreeNode, ids: &mut Vec<String>) {
        if let Some(id) = &node.node_id {
            ids.push(id.clone());
        }
        for child in &node.nodes {
            collect_ids(child, ids);
        }
    }
    for root in roots {
        collect_ids(root, &mut ids);
    }
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len(), "duplicate node ids");
    let mut lex = ids.clone();
    lex.sort();
    assert_eq!(lex, ids, "node ids not pre-order lexicographic");
}
