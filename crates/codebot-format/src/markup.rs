//! HTML escaping and inline Markdown conversion.
//!
//! Passes run on already-escaped text, so the only `<` and `>` they can see
//! are the ones earlier passes produced.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static DOUBLE_STAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("valid bold regex"));
static SINGLE_STAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*<>]+)\*").expect("valid bold regex"));
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_]+)_").expect("valid italic regex"));
static STRIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"~~([^~]+)~~").expect("valid strikethrough regex"));
static INLINE_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([^`\n]+)`").expect("valid inline code regex"));
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)<>]+)\)").expect("valid link regex"));

/// Escape `&`, `<` and `>`.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// `**x**` and `*x*` to `<b>x</b>`. A single-star span touching a tag
/// bracket is left alone.
pub fn format_bold(text: &str) -> String {
    let text = DOUBLE_STAR_RE.replace_all(text, "<b>$1</b>");
    replace_guarded(
        &text,
        &SINGLE_STAR_RE,
        |c| c == '<' || c == '>',
        |caps| format!("<b>{}</b>", &caps[1]),
    )
}

/// `_x_` to `<i>x</i>`, skipping underscores that belong to identifiers
/// such as `__init__` or `snake_case_name`.
pub fn format_italic(text: &str) -> String {
    replace_guarded(
        text,
        &ITALIC_RE,
        |c| c == '_' || c.is_alphanumeric(),
        |caps| format!("<i>{}</i>", &caps[1]),
    )
}

pub fn format_strikethrough(text: &str) -> String {
    STRIKE_RE.replace_all(text, "<s>$1</s>").into_owned()
}

/// `` `x` `` to `<code>x</code>`. The content is already escaped.
pub fn format_inline_code(text: &str) -> String {
    INLINE_CODE_RE.replace_all(text, "<code>$1</code>").into_owned()
}

/// `[text](url)` to `<a href="url">text</a>`. A url that picked up tags
/// from an earlier pass is not a link.
pub fn format_links(text: &str) -> String {
    LINK_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let href = caps[2].replace('"', "&quot;");
            format!("<a href=\"{href}\">{}</a>", &caps[1])
        })
        .into_owned()
}

/// All inline passes in their required order.
pub fn apply_inline(text: &str) -> String {
    let text = format_bold(text);
    let text = format_italic(&text);
    let text = format_strikethrough(&text);
    let text = format_inline_code(&text);
    format_links(&text)
}

/// Like `Regex::replace_all`, but a match is only replaced when neither the
/// character before it nor the one after it satisfies `rejects`. After a
/// rejected match the search resumes one character later.
fn replace_guarded(
    text: &str,
    re: &Regex,
    rejects: impl Fn(char) -> bool,
    render: impl Fn(&Captures<'_>) -> String,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut pos = 0;

    while pos <= text.len() {
        let Some(caps) = re.captures_at(text, pos) else {
            break;
        };
        let Some(whole) = caps.get(0) else {
            break;
        };

        let before = text[..whole.start()].chars().next_back();
        let after = text[whole.end()..].chars().next();
        let blocked = before.is_some_and(&rejects) || after.is_some_and(&rejects);

        if blocked {
            pos = match text[whole.start()..].chars().next() {
                Some(c) => whole.start() + c.len_utf8(),
                None => break,
            };
            continue;
        }

        out.push_str(&text[copied..whole.start()]);
        out.push_str(&render(&caps));
        copied = whole.end();
        pos = whole.end();
    }

    out.push_str(&text[copied..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_three_characters() {
        assert_eq!(escape_html("a < b && c > \"d\""), "a &lt; b &amp;&amp; c &gt; \"d\"");
    }

    #[test]
    fn bold_forms() {
        assert_eq!(format_bold("**a** and *b*"), "<b>a</b> and <b>b</b>");
        assert_eq!(format_bold("2 * 3 * 4"), "2 <b> 3 </b> 4");
    }

    #[test]
    fn single_star_next_to_tag_is_skipped() {
        assert_eq!(format_bold("<b>x</b>*y*"), "<b>x</b>*y*");
        assert_eq!(format_bold("*y*<i>"), "*y*<i>");
    }

    #[test]
    fn italic_ignores_identifiers() {
        assert_eq!(format_italic("call __init__ now"), "call __init__ now");
        assert_eq!(format_italic("snake_case_name"), "snake_case_name");
        assert_eq!(format_italic("this is _важно_!"), "this is <i>важно</i>!");
    }

    #[test]
    fn guarded_search_resumes_after_rejection() {
        assert_eq!(format_italic("a_b_ _c_"), "a_b_ <i>c</i>");
    }

    #[test]
    fn strike_code_and_links() {
        assert_eq!(format_strikethrough("~~old~~ new"), "<s>old</s> new");
        assert_eq!(format_inline_code("run `ls -la`"), "run <code>ls -la</code>");
        assert_eq!(
            format_links("see [docs](https://x.io/?a=1&amp;b=\"2\")"),
            "see <a href=\"https://x.io/?a=1&amp;b=&quot;2&quot;\">docs</a>"
        );
    }

    #[test]
    fn inline_code_is_not_escaped_twice() {
        let escaped = escape_html("`a < b`");
        assert_eq!(apply_inline(&escaped), "<code>a &lt; b</code>");
    }

    #[test]
    fn url_with_generated_tags_is_not_linked() {
        let out = apply_inline("[x](http://h/a*b*c)");
        assert_eq!(out, "[x](http://h/a<b>b</b>c)");
    }
}
