//! Embedded outline ("Outlines" object) extraction.
//!
//! Walks the outline tree through `/First` child and `/Next` sibling links,
//! resolving each item's destination (`/Dest`, or a GoTo `/A` action) to a
//! 1-based page number. Cycle and depth guards keep malformed documents from
//! hanging the walk.

use std::collections::{BTreeMap, HashSet};

use lopdf::{Dictionary, Document, Object, ObjectId};

/// One embedded outline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    /// 1-based nesting level.
    pub level: usize,
    pub title: String,
    /// 1-based physical page, when the destination resolved.
    pub page: Option<usize>,
}

const MAX_DEPTH: usize = 16;
const MAX_SIBLINGS: usize = 10_000;

/// Extract the document outline, or empty when absent or malformed.
pub fn extract_outline(doc: &Document) -> Vec<OutlineEntry> {
    let Ok(catalog) = doc.catalog() else {
        return Vec::new();
    };

    let Some(outlines) = resolve_dict(doc, catalog.get(b"Outlines").ok()) else {
        return Vec::new();
    };

    let Ok(Object::Reference(first)) = outlines.get(b"First") else {
        return Vec::new();
    };

    let pages_map = doc.get_pages();
    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    walk(doc, *first, 1, &pages_map, &mut visited, &mut entries);
    entries
}

fn walk(
    doc: &Document,
    first: ObjectId,
    level: usize,
    pages_map: &BTreeMap<u32, ObjectId>,
    visited: &mut HashSet<ObjectId>,
    entries: &mut Vec<OutlineEntry>,
) {
    if level > MAX_DEPTH {
        return;
    }

    let mut current = Some(first);
    let mut siblings = 0usize;

    while let Some(id) = current {
        if !visited.insert(id) || siblings >= MAX_SIBLINGS {
            break;
        }
        siblings += 1;

        let Some(dict) = resolve_dict(doc, doc.get_object(id).ok()) else {
            break;
        };

        let title = string_value(doc, dict, b"Title").unwrap_or_default();
        let page = resolve_destination(doc, dict, pages_map);

        entries.push(OutlineEntry { level, title, page });

        if let Ok(Object::Reference(child)) = dict.get(b"First") {
            walk(doc, *child, level + 1, pages_map, visited, entries);
        }

        current = match dict.get(b"Next") {
            Ok(Object::Reference(next)) => Some(*next),
            _ => None,
        };
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: Option<&'a Object>) -> Option<&'a Dictionary> {
    let obj = match obj? {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    obj.as_dict().ok()
}

/// Decode a PDF text string from a dictionary: UTF-16BE when BOM-prefixed,
/// else UTF-8 with a Latin-1 fallback.
fn string_value(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    let obj = dict.get(key).ok()?;
    let obj = match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    match obj {
        Object::String(bytes, _) => Some(decode_text_string(bytes)),
        Object::Name(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

fn decode_text_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Resolve an outline item's destination to a 1-based page number. Tries
/// `/Dest` first, then a GoTo `/A` action's `/D`.
fn resolve_destination(
    doc: &Document,
    dict: &Dictionary,
    pages_map: &BTreeMap<u32, ObjectId>,
) -> Option<usize> {
    if let Ok(dest) = dict.get(b"Dest") {
        if let Some(page) = dest_to_page(doc, dest, pages_map) {
            return Some(page);
        }
    }

    let action = resolve_dict(doc, dict.get(b"A").ok())?;
    let Ok(Object::Name(kind)) = action.get(b"S") else {
        return None;
    };
    if kind.as_slice() != b"GoTo" {
        return None;
    }
    dest_to_page(doc, action.get(b"D").ok()?, pages_map)
}

fn dest_to_page(
    doc: &Document,
    dest: &Object,
    pages_map: &BTreeMap<u32, ObjectId>,
) -> Option<usize> {
    let dest = match dest {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };

    let array = match dest {
        Object::Array(array) => array,
        // Named destinations are stored under /Names in the catalog; walking
        // that tree is rarely needed for outlines, so unresolved names just
        // yield no page and the mapper fills the hole later.
        _ => return None,
    };

    let Object::Reference(page_ref) = array.first()? else {
        return None;
    };

    pages_map.iter().find_map(|(&number, &id)| {
        if id == *page_ref {
            Some(number as usize)
        } else {
            None
        }
    })
}
