//! Cleanup of raw model output into a single-line caption.
//!
//! Vision models wrap their answers in all sorts of noise:
//! 1. `<think>...</think>` reasoning blocks
//! 2. Markdown code fences
//! 3. A leading label such as `Reverse prompt:`
//! 4. Surrounding quotes
//! 5. Line breaks and runs of whitespace
//!
//! [`clean_caption`] removes all of these. The result never contains a
//! newline, which the CSV progress store relies on.

const LABEL_PREFIXES: [&str; 3] = ["reverse prompt:", "caption:", "description:"];

/// Turn a raw model response into a caption, or `None` if nothing is left.
pub fn clean_caption(raw: &str) -> Option<String> {
    let stripped = strip_think_tags(raw);
    let unfenced = strip_code_fence(stripped.trim());
    let unlabeled = strip_label(unfenced);
    let collapsed = collapse_whitespace(unlabeled);
    let unquoted = strip_quotes(&collapsed);

    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_string())
    }
}

/// Strip `<think>...</think>` blocks emitted by reasoning models.
///
/// Handles both complete and incomplete think blocks:
/// - `<think>reasoning</think>content` -> `content`
/// - `<think>reasoning without closing` -> `` (strips to end)
pub fn strip_think_tags(text: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find("<think>") {
        if let Some(end) = result[start..].find("</think>") {
            result = format!("{}{}", &result[..start], &result[start + end + 8..]);
        } else {
            result.truncate(start);
            break;
        }
    }
    result
}

/// Collapse every run of whitespace (including newlines) into one space.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Skip an optional language tag on the opening fence.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn strip_label(text: &str) -> &str {
    for prefix in LABEL_PREFIXES {
        let matches = text
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if matches {
            return text[prefix.len()..].trim_start();
        }
    }
    text
}

fn strip_quotes(text: &str) -> &str {
    let trimmed = text.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if let Some(inner) = trimmed
            .strip_prefix(open)
            .and_then(|s| s.strip_suffix(close))
        {
            return inner.trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_think_tags_complete() {
        assert_eq!(strip_think_tags("<think>reasoning</think>result"), "result");
    }

    #[test]
    fn strip_think_tags_incomplete() {
        assert_eq!(strip_think_tags("<think>reasoning without close"), "");
    }

    #[test]
    fn strip_think_tags_multiple() {
        let input = "<think>first</think>middle<think>second</think>end";
        assert_eq!(strip_think_tags(input), "middleend");
    }

    #[test]
    fn clean_plain_caption() {
        assert_eq!(
            clean_caption("  A stone ocean under a violet sky.  ").as_deref(),
            Some("A stone ocean under a violet sky.")
        );
    }

    #[test]
    fn clean_collapses_newlines() {
        let raw = "Subject: lighthouse;\nSetting: cliff;\n\nStyle: oil painting";
        assert_eq!(
            clean_caption(raw).as_deref(),
            Some("Subject: lighthouse; Setting: cliff; Style: oil painting")
        );
    }

    #[test]
    fn clean_strips_think_and_quotes() {
        let raw = "<think>\nlooking...\n</think>\n\"Golden pyramids at dusk.\"";
        assert_eq!(clean_caption(raw).as_deref(), Some("Golden pyramids at dusk."));
    }

    #[test]
    fn clean_strips_code_fence() {
        let raw = "```text\nA cobalt nebula over dunes.\n```";
        assert_eq!(
            clean_caption(raw).as_deref(),
            Some("A cobalt nebula over dunes.")
        );
    }

    #[test]
    fn clean_strips_label() {
        assert_eq!(
            clean_caption("Reverse prompt: misty harbor, dawn").as_deref(),
            Some("misty harbor, dawn")
        );
    }

    #[test]
    fn clean_empty_is_none() {
        assert_eq!(clean_caption(""), None);
        assert_eq!(clean_caption("   \n "), None);
        assert_eq!(clean_caption("<think>only thoughts</think>"), None);
        assert_eq!(clean_caption("\"\""), None);
    }
}
