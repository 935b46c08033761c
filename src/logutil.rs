//! Helpers that keep log lines single-line and bounded when they embed mesh text.

use std::fmt::Write;

/// Escape control characters and cap the preview at `max_bytes` (UTF-8 safe, `...` appended
/// when cut) so radio text cannot break log lines or flood them.
pub fn preview(text: &str, max_bytes: usize) -> String {
    let (body, cut) = if text.len() <= max_bytes {
        (text, false)
    } else {
        let mut end = max_bytes.saturating_sub(3);
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        (&text[..end], true)
    };
    let mut out = String::with_capacity(body.len() + 8);
    for ch in body.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    if cut {
        out.push_str("...");
    }
    out
}

/// Lowercase hex of at most `max` leading bytes, for tracing raw frames.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2);
    for b in data.iter().take(max) {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(preview("a\nb\r\tc\u{7}", 64), "a\\nb\\r\\tc\\x07");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // "€" is three bytes; a naive cut at 7 would land inside it.
        assert_eq!(preview("12345€7890", 10), "12345...");
        assert_eq!(preview("ab🙂cd", 5), "ab...");
        assert_eq!(preview("hello", 10), "hello");
    }

    #[test]
    fn hex_snippet_caps_length() {
        assert_eq!(hex_snippet(&[0x94, 0xc3, 0x00, 0x10], 2), "94c3");
    }
}
