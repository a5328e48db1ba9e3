//! Removal of terminal artifacts from agent output.

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI sequences (colours, cursor movement) and OSC sequences (titles, links).
static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .expect("valid ANSI regex")
});

static BOX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[─│┌┐└┘├┤┬┴┼╭╮╯╰]+").expect("valid box-drawing regex"));

static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank regex"));

const FENCE: &str = "```";

/// Strip ANSI codes and box-drawing glyphs, trim lines outside fenced code
/// and collapse blank runs.
///
/// The result is a fixed point: `clean_output(clean_output(x)) == clean_output(x)`.
pub fn clean_output(text: &str) -> String {
    let text = BOX_RE.replace_all(text, "");
    let text = strip_ansi(&text);
    let text = trim_lines(&text);
    let text = BLANK_RUN_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Remove escape sequences until none are left. A single pass can expose a
/// new sequence (`"\x1b\x1b[0m[1m"`).
pub fn strip_ansi(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = ANSI_RE.replace_all(&current, "");
        if next.len() == current.len() {
            return current;
        }
        current = next.into_owned();
    }
}

/// Trim every line that is not inside a fenced block. Fence lines
/// themselves are kept verbatim so fence detection is stable.
fn trim_lines(text: &str) -> String {
    let mut in_fence = false;
    let mut lines = Vec::new();

    for line in text.split('\n') {
        if line.trim_start().starts_with(FENCE) {
            in_fence = !in_fence;
            lines.push(line);
        } else if in_fence {
            lines.push(line);
        } else {
            lines.push(line.trim());
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colours_and_boxes() {
        let input = "╭──────╮\n│ \x1b[1;32mok\x1b[0m │\n╰──────╯";
        assert_eq!(clean_output(input), "ok");
    }

    #[test]
    fn nested_escape_is_removed() {
        assert_eq!(strip_ansi("a\x1b\x1b[0m[1mb"), "ab");
    }

    #[test]
    fn keeps_code_indentation() {
        let input = "  intro  \n```py\n    if x:\n        pass\n```\n  outro";
        assert_eq!(
            clean_output(input),
            "intro\n```py\n    if x:\n        pass\n```\noutro"
        );
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean_output("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(clean_output("a\n   \n  \n \nb"), "a\n\nb");
    }

    #[test]
    fn is_idempotent_on_samples() {
        let samples = [
            "",
            "   ",
            "\x1b[31m  red  \x1b[0m\n\n\n\nnext",
            "```\n  open fence\n\n\n\n   ",
            "│x│ \n ```rs\n\tfn a() {}\n  ```  \n\n\n tail \x1b]0;title\x07",
        ];
        for sample in samples {
            let once = clean_output(sample);
            assert_eq!(clean_output(&once), once, "sample {sample:?}");
        }
    }
}
