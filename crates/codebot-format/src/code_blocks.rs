//! Fenced code block protection.
//!
//! Fenced blocks are swapped for positional placeholders before escaping and
//! inline conversion, then restored as `<pre>` blocks. Placeholders are built
//! from private-use code points, which none of the later passes touch.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::markup::escape_html;

static FENCED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(\w*)\n?(.*?)```").expect("valid fenced block regex"));

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("\u{E000}([0-9]+)\u{E001}").expect("valid placeholder regex"));

const PLACEHOLDER_OPEN: char = '\u{E000}';
const PLACEHOLDER_CLOSE: char = '\u{E001}';

/// A fenced block as written by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Language hint after the opening fence, possibly empty.
    pub language: String,
    pub code: String,
}

/// Blocks removed from a text, indexed by the number in their placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBlockTable {
    blocks: Vec<CodeBlock>,
}

impl CodeBlockTable {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CodeBlock> {
        self.blocks.get(index)
    }

    pub fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    /// The token that stands in for block `index`.
    pub fn placeholder(index: usize) -> String {
        format!("{PLACEHOLDER_OPEN}{index}{PLACEHOLDER_CLOSE}")
    }

    fn push(&mut self, language: &str, code: &str) -> String {
        let index = self.blocks.len();
        self.blocks.push(CodeBlock {
            language: language.to_string(),
            code: code.trim_start_matches(['\n', '\r']).trim_end().to_string(),
        });
        Self::placeholder(index)
    }

    /// Replace every placeholder with its block as escaped `<pre>` content.
    /// The language hint is dropped. Unknown indices restore to nothing.
    pub fn restore(&self, text: &str) -> String {
        if self.blocks.is_empty() {
            return text.to_string();
        }

        PLACEHOLDER_RE
            .replace_all(text, |caps: &Captures<'_>| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| self.blocks.get(index))
                    .map(|block| format!("<pre>{}</pre>", escape_html(&block.code)))
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

/// Swap fenced blocks in `text` for placeholders.
///
/// Stray private-use delimiters already present in the input are removed
/// so they can never be mistaken for a placeholder.
pub fn extract(text: &str) -> (String, CodeBlockTable) {
    let sanitized: String = text
        .chars()
        .filter(|c| *c != PLACEHOLDER_OPEN && *c != PLACEHOLDER_CLOSE)
        .collect();

    let mut table = CodeBlockTable::default();
    let replaced = FENCED_RE
        .replace_all(&sanitized, |caps: &Captures<'_>| table.push(&caps[1], &caps[2]))
        .into_owned();

    (replaced, table)
}
