use std::collections::HashSet;

/// Zero-width characters that Telegram clients occasionally smuggle into
/// hashtags: ZWSP, ZWNJ, ZWJ and the BOM.
const ZERO_WIDTH: &[char] = &['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}'];

/// A structured annotation locating a substring within a message's text.
/// Offsets and lengths count Unicode code points, matching the convention
/// of the annotations they are built from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TagSpan {
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) is_hashtag: bool,
}

/// Slices the hashtag spans out of `text` and normalizes each of them.
///
/// Spans that run past the end of the text are dropped silently: they mean
/// the annotations don't belong to this text revision, and the raw-text
/// fallback in the decider still gets its chance. Missing text or spans
/// yield an empty set, not an error.
pub(crate) fn extract(text: Option<&str>, spans: Option<&[TagSpan]>) -> HashSet<String> {
    let (Some(text), Some(spans)) = (text, spans) else {
        return HashSet::new();
    };

    spans
        .iter()
        .filter(|span| span.is_hashtag)
        .filter_map(|span| slice_span(text, span))
        .map(|raw| normalize_tag(&raw))
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn slice_span(text: &str, span: &TagSpan) -> Option<String> {
    let sliced: String = text.chars().skip(span.offset).take(span.len).collect();

    // Shorter than requested means the span ran past the end of the text.
    (sliced.chars().count() == span.len).then_some(sliced)
}

/// Normalizes a raw hashtag string so that `"#  ЧЕЛЛЕНДЖ1"` and
/// `"#челлендж1"` compare equal: trims whitespace and zero-width characters,
/// collapses `#` followed by whitespace into a bare `#`, and lowercases
/// with Unicode case folding.
pub(crate) fn normalize_tag(raw: &str) -> String {
    let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || ZERO_WIDTH.contains(&c));

    let mut out = String::with_capacity(trimmed.len());
    let mut chars = trimmed.chars().peekable();

    if chars.peek() == Some(&'#') {
        out.push('#');
        chars.next();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || ZERO_WIDTH.contains(&c) {
                chars.next();
            } else {
                break;
            }
        }
    }

    out.extend(chars.filter(|c| !ZERO_WIDTH.contains(c)));
    out.to_lowercase()
}
