//! Lightweight text normalization applied before n-gram generation and
//! query fingerprinting. Full NFKC folding happens upstream in the source
//! connector; this module covers width folding, case folding and whitespace
//! collapsing for text that reaches the core directly (queries, cache keys).

/// Characters treated as whitespace when collapsing: ASCII space, tab,
/// newline, carriage return, and the ideographic space U+3000.
pub fn is_collapsible_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\u{3000}')
}

/// Collapse runs of whitespace (including U+3000) to a single ASCII space
/// and trim the ends.
pub fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_space = false;
    for c in input.chars() {
        if is_collapsible_space(c) {
            in_space = true;
        } else {
            if in_space && !out.is_empty() {
                out.push(' ');
            }
            in_space = false;
            out.push(c);
        }
    }
    out
}

/// Fold full-width ASCII variants (U+FF01..=U+FF5E) to their half-width
/// forms and the ideographic space to ASCII space.
pub fn fold_width(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => {
                char::from_u32(c as u32 - 0xFF01 + 0x21).unwrap_or(c)
            }
            '\u{3000}' => ' ',
            _ => c,
        })
        .collect()
}

/// Standard normalization pipeline: width fold, lowercase, collapse.
pub fn normalize(input: &str) -> String {
    collapse_whitespace(&fold_width(input).to_lowercase())
}
