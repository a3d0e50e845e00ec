//! Display-text merge of finalized segments and the trailing interim string.
//!
//! Some interim text may already be reflected in a segment that has since
//! been finalized (or vice versa), so naively concatenating the two shows
//! duplicated words. This merge is a pure function of its inputs and is
//! recomputed on demand.

/// Merge finalized texts with an in-progress interim fragment into one
/// displayable string. Comparisons are case-insensitive; the original casing
/// of the inputs is preserved in the output.
pub fn merge_display_text<S: AsRef<str>>(finals: &[S], interim: &str) -> String {
    let joined = finals
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();
    let interim = interim.trim();

    if interim.is_empty() {
        return joined;
    }
    if joined.is_empty() {
        return interim.to_string();
    }

    let joined_lower = joined.to_lowercase();
    let interim_lower = interim.to_lowercase();

    // The interim was fully absorbed into the last finalized segment.
    if joined_lower.ends_with(&interim_lower) {
        return joined;
    }

    if let Some(last) = finals.last().map(|s| s.as_ref().trim()) {
        if !last.is_empty() {
            if interim_lower == last.to_lowercase() {
                return joined;
            }
            // Interim is "last final + extra suffix": append only the suffix.
            if let Some(extra) = strip_prefix_ignore_case(interim, last) {
                let extra = extra.trim();
                if extra.is_empty() {
                    return joined;
                }
                return format!("{joined} {extra}");
            }
        }
    }

    // Note: an interim that contains but does not start with the last final
    // falls through here and can still duplicate a trailing word. Kept
    // pending a product decision on the right resolution policy.
    format!("{joined} {interim}")
}

/// Strip `prefix` from the front of `text`, comparing case-insensitively,
/// returning the remainder of `text` with its casing intact.
///
/// Walks lowercased char iterators in lockstep instead of slicing at
/// lowercased byte offsets, which would not be boundary-safe for characters
/// whose lowercase form has a different length.
fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut rest = text.char_indices();
    let mut prefix_chars = prefix.chars().flat_map(char::to_lowercase);
    loop {
        let Some(expected) = prefix_chars.next() else {
            return match rest.next() {
                Some((idx, _)) => Some(&text[idx..]),
                None => Some(""),
            };
        };
        let (_, ch) = rest.next()?;
        let mut actual = ch.to_lowercase();
        if actual.next() != Some(expected) {
            return None;
        }
        for extra in actual {
            if prefix_chars.next() != Some(extra) {
                return None;
            }
        }
    }
}
