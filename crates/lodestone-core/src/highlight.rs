//! Contextual excerpts around query-term matches.
//!
//! Shared by every keyword backend so highlight output does not depend on
//! which index produced the hit.

/// Default excerpt length in characters.
pub const EXCERPT_CHARS: usize = 200;

/// Split a query into lowercase alphanumeric terms, deduplicated in order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let t = t.to_lowercase();
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}

/// Excerpts of at most `max_chars` characters centred on the first match
/// of each term, with `"..."` marking truncated ends.
///
/// Matching is ASCII case-insensitive. When no term occurs in `content`,
/// a single excerpt of the first `max_chars` characters is returned.
pub fn excerpts(content: &str, terms: &[String], max_chars: usize) -> Vec<String> {
    let haystack = content.to_ascii_lowercase();
    let chars: Vec<usize> = content.char_indices().map(|(i, _)| i).collect();
    let total = chars.len();

    let mut out: Vec<String> = Vec::new();
    for term in terms {
        let needle = term.to_ascii_lowercase();
        if needle.is_empty() {
            continue;
        }
        let Some(byte_pos) = haystack.find(&needle) else {
            continue;
        };
        let match_char = chars.partition_point(|&b| b < byte_pos);
        let term_chars = needle.chars().count();
        let context = max_chars.saturating_sub(term_chars) / 2;

        let mut start = match_char.saturating_sub(context);
        let end = (start + max_chars).min(total);
        if end - start < max_chars {
            start = end.saturating_sub(max_chars);
        }

        let excerpt = slice_chars(content, &chars, start, end);
        if !out.contains(&excerpt) {
            out.push(excerpt);
        }
    }

    if out.is_empty() && total > 0 {
        out.push(slice_chars(content, &chars, 0, max_chars.min(total)));
    }
    out
}

fn slice_chars(content: &str, chars: &[usize], start: usize, end: usize) -> String {
    let total = chars.len();
    let byte_start = chars.get(start).copied().unwrap_or(content.len());
    let byte_end = if end < total { chars[end] } else { content.len() };

    let mut s = String::with_capacity(byte_end - byte_start + 6);
    if start > 0 {
        s.push_str("...");
    }
    s.push_str(&content[byte_start..byte_end]);
    if end < total {
        s.push_str("...");
    }
    s
}
