//! Prompt rendering of retrieved passages.

use crate::store::RetrievedItem;

pub const CONTEXT_HEADER: &str = "Context from your knowledge base (most relevant first):";
pub const CONTEXT_FOOTER: &str = "Use this context when answering. If irrelevant, ignore it.";

/// Render `items` as a numbered context block.
///
/// Items are numbered by position; items without text are skipped but keep
/// their number. Each text is cut to `max_chars` characters with `...`
/// appended. Returns an empty string when nothing is rendered.
pub fn format_context(items: &[RetrievedItem], max_chars: usize) -> String {
    let lines: Vec<String> = items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let text = item.text.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
            Some(format!("[{}] {}", idx + 1, truncate(text, max_chars)))
        })
        .collect();

    if lines.is_empty() {
        return String::new();
    }
    format!("{CONTEXT_HEADER}\n{}\n\n{CONTEXT_FOOTER}", lines.join("\n"))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
