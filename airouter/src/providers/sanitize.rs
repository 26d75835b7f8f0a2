//! Sanitize vendor error strings: scrub secret-like tokens and truncate
//! length before they reach logs or client-facing error messages.

const MAX_API_ERROR_CHARS: usize = 200;

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like token prefixes from vendor error strings.
///
/// Redacts tokens with prefixes like `sk-` (OpenAI/Anthropic keys) and
/// `AIza` (Google keys).
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 2] = ["sk-", "AIza"];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            // Bare prefixes should not stop future scans.
            if end == content_start {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize vendor error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_key_material() {
        let input = r#"{"error":"invalid key sk-proj-abc123def"}"#;
        let out = scrub_secret_patterns(input);
        assert!(!out.contains("abc123def"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn truncates_long_bodies() {
        let input = "x".repeat(500);
        let out = sanitize_api_error(&input);
        assert!(out.len() <= MAX_API_ERROR_CHARS + 3);
        assert!(out.ends_with("..."));
    }
}
