//! Continuation text captured from interrupted replies.

/// Default cap on captured carryover, in characters.
pub const DEFAULT_CARRYOVER_MAX_CHARS: usize = 400;

/// Keep the tail of `text` that fits in `max_chars` characters.
///
/// Counting is done on `char`s so multi-byte text is never split inside a
/// code point. When the cut lands inside a word, the partial leading word is
/// dropped so the tail starts at a word boundary. Returns `None` when nothing
/// but whitespace remains.
pub fn truncate_carryover(text: &str, max_chars: usize) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || max_chars == 0 {
        return None;
    }

    let total = trimmed.chars().count();
    if total <= max_chars {
        return Some(trimmed.to_string());
    }

    let cut = trimmed
        .char_indices()
        .nth(total - max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let (head, mut tail) = trimmed.split_at(cut);

    let mid_word = !head.ends_with(char::is_whitespace) && !tail.starts_with(char::is_whitespace);
    if mid_word && let Some(boundary) = tail.find(char::is_whitespace) {
        tail = &tail[boundary..];
    }

    let tail = tail.trim_start();
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}
