//! Canonical spec truncation.
//!
//! Preserves a head window and the final 20% of the budget, joined by an
//! explicit marker. Truncation is idempotent: the output always fits the
//! budget, so re-truncating a truncated string is a no-op.

/// Marker inserted where content was removed.
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]\n";

/// Fraction of the budget reserved for the tail window.
const TAIL_FRACTION: f64 = 0.20;

/// Truncate `text` to at most `max_chars` characters, preserving the head
/// and the trailing window.
///
/// Returns the input unchanged when it already fits.
pub fn truncate_preserving(text: &str, max_chars: usize) -> String {
    let total: usize = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        // Budget too small for a marker; hard cut.
        return text.chars().take(max_chars).collect();
    }

    let budget = max_chars - marker_len;
    let tail_len = ((budget as f64) * TAIL_FRACTION).floor() as usize;
    let head_len = budget - tail_len;

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text
        .chars()
        .skip(total.saturating_sub(tail_len))
        .collect();

    format!("{head}{TRUNCATION_MARKER}{tail}")
}
