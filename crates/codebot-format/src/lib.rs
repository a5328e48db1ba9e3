//! Output formatting for length-limited chat transports.
//!
//! Agent output is plain text with Markdown-ish decorations and terminal
//! artifacts. This crate turns it into HTML restricted to the small tag set
//! chat transports accept (`b`, `i`, `s`, `code`, `a`, `pre`) and splits the
//! result into chunks that each stay under the transport's message limit.
//!
//! ```text
//! raw text
//!   -> cleanup        (ANSI codes, box glyphs, blank runs, line trimming)
//!   -> code_blocks    (fenced blocks swapped for placeholders)
//!   -> markup         (HTML escaping, inline conversions)
//!   -> code_blocks    (placeholders restored as <pre>)
//!   -> split          (length-bounded, tag-balanced chunks)
//! ```
//!
//! Every stage is a pure function and can be used on its own.

pub mod cleanup;
pub mod code_blocks;
pub mod markup;
pub mod split;

use std::panic::{self, AssertUnwindSafe};

use log::warn;

pub use cleanup::clean_output;
pub use code_blocks::CodeBlockTable;
pub use markup::escape_html;
pub use split::split_message;

/// Default chunk limit (Telegram's message length limit).
pub const DEFAULT_MAX_LENGTH: usize = 4096;

/// Smallest accepted chunk limit. Lower values are raised to this.
pub const MIN_MAX_LENGTH: usize = 64;

/// Length of a string as the chunker counts it (Unicode scalar values).
pub fn text_len(text: &str) -> usize {
    text.chars().count()
}

/// Convert raw agent output into transport-ready HTML chunks.
///
/// Never fails: if a stage panics on unexpected input, the raw text is
/// escaped and split without any formatting.
pub fn format_message(text: &str, max_length: usize) -> Vec<String> {
    let max_length = max_length.max(MIN_MAX_LENGTH);

    panic::catch_unwind(AssertUnwindSafe(|| format_pipeline(text, max_length))).unwrap_or_else(
        |_| {
            warn!(
                "formatting pipeline failed for {} chars of output, sending it unformatted",
                text_len(text)
            );
            plain_chunks(text, max_length)
        },
    )
}

/// The formatted (but not yet split) HTML for `text`.
pub fn render_html(text: &str) -> String {
    let cleaned = cleanup::clean_output(text);
    let (protected, table) = code_blocks::extract(&cleaned);
    let escaped = markup::escape_html(&protected);
    let converted = markup::apply_inline(&escaped);
    table.restore(&converted)
}

fn format_pipeline(text: &str, max_length: usize) -> Vec<String> {
    let html = render_html(text);

    if text_len(&html) <= max_length {
        return vec![html];
    }

    split::split_message(&html, max_length)
}

/// Escape-only fallback. Raw text is cut first so entity expansion
/// (`&` -> `&amp;`, five chars) can never push a chunk over the limit.
fn plain_chunks(text: &str, max_length: usize) -> Vec<String> {
    let raw_len = (max_length / 5).max(1);
    let chars: Vec<char> = text.chars().collect();

    if chars.is_empty() {
        return vec![String::new()];
    }

    chars
        .chunks(raw_len)
        .map(|chunk| markup::escape_html(&chunk.iter().collect::<String>()))
        .collect()
}
