//! Splits document text into overlapping chunks.
//!
//! Sizes are measured in characters. A chunk boundary is pulled back to the
//! last whitespace in the second half of the window when there is one, and the
//! next chunk starts `overlap` characters earlier, at a word start. Offsets are
//! byte offsets into the original text and always fall on char boundaries.

use super::types::OffsetRange;

#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan<'a> {
    pub range: OffsetRange,
    pub text: &'a str,
}

pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<TextSpan<'_>> {
    let size = size.max(1);
    let overlap = overlap.min(size / 2);

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let byte_at = |i: usize| if i >= n { text.len() } else { chars[i].0 };

    let mut spans = Vec::new();
    let mut start = 0usize;

    while start < n {
        let mut end = (start + size).min(n);
        if end < n {
            let floor = start + size / 2;
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].1.is_whitespace()) {
                end = ws;
            }
        }

        if let Some(span) = trimmed_span(text, byte_at(start), byte_at(end)) {
            spans.push(span);
        }
        if end >= n {
            break;
        }

        let mut next = end.saturating_sub(overlap).max(start + 1);
        while next < end && !chars[next - 1].1.is_whitespace() {
            next += 1;
        }
        start = next;
    }

    spans
}

fn trimmed_span(text: &str, start: usize, end: usize) -> Option<TextSpan<'_>> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = start + lead;
    Some(TextSpan {
        range: OffsetRange {
            start,
            end: start + trimmed.len(),
        },
        text: trimmed,
    })
}
