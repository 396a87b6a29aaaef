//! Title matching against page text.
//!
//! Extraction and OCR both mangle whitespace and punctuation, so every
//! comparison here happens on a normalised form: whitespace collapsed away,
//! case folded, punctuation stripped. Exact containment is tried first, then
//! a Levenshtein-ratio window scan for near misses.

/// Minimum similarity ratio for a fuzzy title match.
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.85;

/// Fraction of the page text within which a title counts as "at the top".
const TOP_OF_PAGE_FRACTION: f64 = 0.25;
/// Titles found within this many normalised characters of the page start
/// always count as top-of-page, regardless of page length.
const TOP_OF_PAGE_FLOOR: usize = 500;

/// Collapse whitespace, fold case, and drop punctuation.
pub fn normalize_title(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Where (if anywhere) a title occurs on a page, in normalised coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitlePosition {
    /// Found within the top fraction of the page.
    AtTop,
    /// Found, but past the top fraction: the section starts mid-page.
    MidPage,
    /// Not found.
    Absent,
}

/// Check whether `title` appears in `page_text`, and where.
pub fn locate_title(title: &str, page_text: &str) -> TitlePosition {
    let needle = normalize_title(title);
    if needle.is_empty() {
        return TitlePosition::Absent;
    }
    let haystack = normalize_title(page_text);
    if haystack.is_empty() {
        return TitlePosition::Absent;
    }

    let offset = match haystack.find(&needle) {
        Some(offset) => offset,
        None => match fuzzy_find(&needle, &haystack) {
            Some(offset) => offset,
            None => return TitlePosition::Absent,
        },
    };

    let top_cutoff = ((haystack.len() as f64 * TOP_OF_PAGE_FRACTION) as usize)
        .max(TOP_OF_PAGE_FLOOR.min(haystack.len()));
    if offset <= top_cutoff {
        TitlePosition::AtTop
    } else {
        TitlePosition::MidPage
    }
}

/// Convenience: does the title appear anywhere on the page.
pub fn title_in_page(title: &str, page_text: &str) -> bool {
    locate_title(title, page_text) != TitlePosition::Absent
}

/// Similarity ratio in `[0, 1]` based on Levenshtein distance. No crate in
/// the corpus covers this, so the DP is implemented directly (two-row form).
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    let distance = levenshtein(&a, &b);
    1.0 - (distance as f64 / max_len as f64)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Slide a needle-sized window across the haystack looking for a span whose
/// similarity clears [`FUZZY_MATCH_THRESHOLD`]. Returns the byte offset of
/// the best-scoring window, preferring earlier positions on ties.
fn fuzzy_find(needle: &str, haystack: &str) -> Option<usize> {
    let window = needle.chars().count();
    let hay: Vec<char> = haystack.chars().collect();
    if window == 0 || hay.len() < window {
        return None;
    }

    let needle_chars: Vec<char> = needle.chars().collect();
    let mut best: Option<(usize, f64)> = None;

    let mut start = 0;
    while start + window <= hay.len() {
        // Cheap prefilter: a window sharing neither of its first two
        // characters with the needle cannot clear the threshold for the
        // short strings we match here.
        if hay[start] != needle_chars[0]
            && (window < 2 || hay[start + 1] != needle_chars[1])
        {
            start += 1;
            continue;
        }
        let span: String = hay[start..start + window].iter().collect();
        let ratio = levenshtein_ratio(needle, &span);
        if ratio >= FUZZY_MATCH_THRESHOLD {
            match best {
                Some((_, best_ratio)) if best_ratio >= ratio => {}
                _ => best = Some((start, ratio)),
            }
            if ratio == 1.0 {
                break;
            }
        }
        start += 1;
    }

    // Convert char offset back to byte offset in the normalised haystack.
    best.map(|(char_offset, _)| {
        haystack
            .char_indices()
            .nth(char_offset)
            .map(|(byte, _)| byte)
            .unwrap_or(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  Chapter 1:  Introduction! "), "chapter1introduction");
        assert_eq!(normalize_title("第一章 招标公告"), "第一章招标公告");
    }

    #[test]
    fn test_exact_containment() {
        let page = "Chapter 3\nEvaluation Criteria\nThe criteria are...";
        assert!(title_in_page("Chapter 3 Evaluation Criteria", page));
        assert!(!title_in_page("Chapter 4 Award", page));
    }

    #[test]
    fn test_whitespace_insensitive_match() {
        // OCR output with spaces between every character.
        let page = "C h a p t e r 2   M e t h o d s\nbody text follows";
        assert!(title_in_page("Chapter 2 Methods", page));
    }

    #[test]
    fn test_levenshtein_ratio() {
        assert_eq!(levenshtein_ratio("abc", "abc"), 1.0);
        assert!(levenshtein_ratio("introduction", "introducton") > 0.9);
        assert!(levenshtein_ratio("introduction", "conclusion") < 0.6);
        assert_eq!(levenshtein_ratio("", ""), 1.0);
    }

    #[test]
    fn test_fuzzy_match_tolerates_single_error() {
        // One character dropped by extraction.
        let page = format!("{}{}", "x".repeat(10), "chaptertwomethds and more text here");
        assert!(title_in_page("Chapter Two Methods", &page));
    }

    #[test]
    fn test_position_at_top_vs_midpage() {
        let filler = "lorem ipsum dolor sit amet ".repeat(100);
        let top = format!("Results and Discussion\n{}", filler);
        assert_eq!(locate_title("Results and Discussion", &top), TitlePosition::AtTop);

        let mid = format!("{}\nResults and Discussion\nmore text", filler);
        assert_eq!(locate_title("Results and Discussion", &mid), TitlePosition::MidPage);
    }

    #[test]
    fn test_short_page_is_always_top() {
        let page = "header\nIntroduction";
        assert_eq!(locate_title("Introduction", page), TitlePosition::AtTop);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(locate_title("", "text"), TitlePosition::Absent);
        assert_eq!(locate_title("title", ""), TitlePosition::Absent);
    }
}
