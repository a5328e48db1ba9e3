//! Length-bounded splitting of formatted HTML.
//!
//! Each chunk is balanced on its own: tags still open at a boundary are
//! closed at the end of the chunk and reopened, attributes included, at the
//! start of the next one. Positions and lengths are in chars.
//!
//! A link whose tags (with the tags around it) leave no room for text in a
//! chunk is unwrapped to `text (url)` before splitting.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{MIN_MAX_LENGTH, text_len};

static TRACKED_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(/?)(b|i|s|code|pre|a)(?:\s[^>]*)?>").expect("valid tag regex")
});

static ANY_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\shref="([^"]*)""#).expect("valid href regex"));

const PRE_OPEN: &[char] = &['<', 'p', 'r', 'e', '>'];
const PRE_CLOSE: &[char] = &['<', '/', 'p', 'r', 'e', '>'];
const MAX_ENTITY_LEN: usize = 10;

/// A tag left open at the end of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenTag {
    name: String,
    opening: String,
}

/// Split `text` into chunks of at most `max_length` chars.
///
/// Text that already fits comes back as a single chunk. Limits below
/// [`MIN_MAX_LENGTH`] are raised to it.
pub fn split_message(text: &str, max_length: usize) -> Vec<String> {
    let max_length = max_length.max(MIN_MAX_LENGTH);
    if text_len(text) <= max_length {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut rest = unwrap_wide_links(text, max_length);

    while text_len(&rest) > max_length {
        let chars: Vec<char> = rest.chars().collect();
        let (head, tail) = next_chunk(&chars, max_length);
        if !head.is_empty() {
            parts.push(head);
        }
        rest = tail;
    }

    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest);
    }

    parts
}

/// Cut one balanced chunk off the front of `chars`, shrinking the search
/// window until the chunk plus its closing tags fits.
fn next_chunk(chars: &[char], max_length: usize) -> (String, String) {
    let mut budget = max_length;

    loop {
        let split = choose_split(chars, budget, max_length);
        let head: String = chars[..split].iter().collect();
        let head = head.trim_end();

        let open = unclosed_tags(head);
        let closers: String = open.iter().rev().map(|t| format!("</{}>", t.name)).collect();
        let total = text_len(head) + text_len(&closers);

        if total <= max_length || budget <= 1 {
            let reopen: String = open.iter().map(|t| t.opening.as_str()).collect();
            let remainder: String = chars[split..].iter().collect();
            let tail = format!("{reopen}{}", remainder.trim_start());
            return (format!("{head}{closers}"), tail);
        }

        budget = budget.saturating_sub(total - max_length).max(1);
    }
}

/// Pick a split position in `1..=chars.len()` for a window of `budget`
/// chars. The head always keeps at least one visible character.
fn choose_split(chars: &[char], budget: usize, max_length: usize) -> usize {
    let budget = budget.min(chars.len());
    let raw = find_break(chars, budget);
    let safe = avoid_markup(chars, raw);

    let moved = keep_pre_whole(chars, safe, max_length);
    if moved > 0 && has_text(&chars[..moved]) {
        return moved;
    }
    if safe > 0 && has_text(&chars[..safe]) {
        return safe;
    }
    safe.max(first_text_end(chars)).min(chars.len())
}

/// Rightmost paragraph break, else line break, else space past the middle
/// of the window; otherwise the window edge.
fn find_break(chars: &[char], budget: usize) -> usize {
    let window = &chars[..budget];
    let half = budget / 2;

    for pattern in [&['\n', '\n'][..], &['\n'][..], &[' '][..]] {
        if let Some(index) = rfind_seq(window, pattern)
            && index > half
        {
            return index;
        }
    }

    budget
}

/// Move `split` off a tag or an entity it would cut in two.
fn avoid_markup(chars: &[char], mut split: usize) -> usize {
    if let Some(lt) = chars[..split].iter().rposition(|c| *c == '<')
        && !chars[lt..split].contains(&'>')
    {
        split = if lt > 0 {
            lt
        } else {
            chars
                .iter()
                .position(|c| *c == '>')
                .map_or(chars.len(), |gt| gt + 1)
        };
    }

    if let Some(amp) = chars[..split].iter().rposition(|c| *c == '&')
        && chars[amp + 1..split].iter().all(|c| is_entity_char(*c))
        && let Some(semi) = chars[split..]
            .iter()
            .take(MAX_ENTITY_LEN)
            .position(|c| *c == ';')
        && chars[split..split + semi].iter().all(|c| is_entity_char(*c))
    {
        split = if amp > 0 { amp } else { split + semi + 1 };
    }

    split
}

/// If `split` falls inside a `<pre>` block that fits in one chunk, move it
/// to the start of the block.
fn keep_pre_whole(chars: &[char], split: usize, max_length: usize) -> usize {
    let Some(open) = rfind_seq(&chars[..split], PRE_OPEN) else {
        return split;
    };
    if rfind_seq(&chars[..split], PRE_CLOSE).is_some_and(|close| close > open) {
        return split;
    }

    let end = find_seq(chars, open, PRE_CLOSE).map_or(chars.len(), |close| close + PRE_CLOSE.len());
    if end - open <= max_length && open > 0 {
        open
    } else {
        split
    }
}

/// A link's tag positions (byte ranges) in the HTML being split.
struct LinkTags {
    opening: Range<usize>,
    closing: Option<Range<usize>>,
    href: String,
    unwrap: bool,
}

/// Tag open at some point of the scan, with what it costs in every chunk it
/// spans (opening plus closer).
struct OpenFrame<'a> {
    name: &'a str,
    cost: usize,
    link: Option<usize>,
}

/// Replace links that could not share a chunk with even one visible
/// character by their text followed by ` (url)`.
fn unwrap_wide_links(html: &str, max_length: usize) -> String {
    let mut links: Vec<LinkTags> = Vec::new();
    let mut stack: Vec<OpenFrame<'_>> = Vec::new();

    for caps in TRACKED_TAG_RE.captures_iter(html) {
        let (Some(tag), Some(closing), Some(name)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let name = name.as_str();

        if closing.is_empty() {
            let link = (name == "a").then(|| {
                let href = HREF_RE
                    .captures(tag.as_str())
                    .map(|c| c[1].to_string())
                    .unwrap_or_default();
                links.push(LinkTags {
                    opening: tag.range(),
                    closing: None,
                    href,
                    unwrap: false,
                });
                links.len() - 1
            });
            stack.push(OpenFrame {
                name,
                cost: text_len(tag.as_str()) + name.len() + 3,
                link,
            });

            while wrapper_cost(&stack, &links) + MAX_ENTITY_LEN > max_length {
                let widest = stack
                    .iter()
                    .filter(|f| f.link.is_some_and(|l| !links[l].unwrap))
                    .max_by_key(|f| f.cost)
                    .and_then(|f| f.link);
                let Some(index) = widest else {
                    break;
                };
                links[index].unwrap = true;
            }
        } else if let Some(pos) = stack.iter().rposition(|f| f.name == name) {
            let frame = stack.remove(pos);
            if let Some(index) = frame.link {
                links[index].closing = Some(tag.range());
            }
        }
    }

    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    for link in links.into_iter().filter(|l| l.unwrap) {
        edits.push((link.opening, String::new()));
        if let Some(closing) = link.closing {
            let suffix = if link.href.is_empty() {
                String::new()
            } else {
                format!(" ({})", link.href)
            };
            edits.push((closing, suffix));
        }
    }
    if edits.is_empty() {
        return html.to_string();
    }
    edits.sort_by_key(|(range, _)| range.start);

    let mut out = String::with_capacity(html.len());
    let mut copied = 0;
    for (range, replacement) in edits {
        out.push_str(&html[copied..range.start]);
        out.push_str(&replacement);
        copied = range.end;
    }
    out.push_str(&html[copied..]);
    out
}

/// Chars taken by the openings and closers of every still-wrapped frame.
fn wrapper_cost(stack: &[OpenFrame<'_>], links: &[LinkTags]) -> usize {
    stack
        .iter()
        .filter(|f| f.link.is_none_or(|l| !links[l].unwrap))
        .map(|f| f.cost)
        .sum()
}

/// Tags opened in `html` and not closed again, in opening order. A closing
/// tag cancels the most recent opening tag of the same name.
fn unclosed_tags(html: &str) -> Vec<OpenTag> {
    let mut stack: Vec<OpenTag> = Vec::new();

    for caps in TRACKED_TAG_RE.captures_iter(html) {
        let name = &caps[2];
        if caps[1].is_empty() {
            stack.push(OpenTag {
                name: name.to_string(),
                opening: caps[0].to_string(),
            });
        } else if let Some(index) = stack.iter().rposition(|t| t.name == name) {
            stack.remove(index);
        }
    }

    stack
}

fn has_text(chars: &[char]) -> bool {
    let text: String = chars.iter().collect();
    !ANY_TAG_RE.replace_all(&text, "").trim().is_empty()
}

/// Position just past the first visible character (or entity).
fn first_text_end(chars: &[char]) -> usize {
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '<' => {
                i = chars[i..]
                    .iter()
                    .position(|c| *c == '>')
                    .map_or(chars.len(), |gt| i + gt + 1);
            }
            c if c.is_whitespace() => i += 1,
            '&' => {
                return chars[i..]
                    .iter()
                    .take(MAX_ENTITY_LEN)
                    .position(|c| *c == ';')
                    .map_or(i + 1, |semi| i + semi + 1);
            }
            _ => return i + 1,
        }
    }
    chars.len()
}

fn is_entity_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '#'
}

fn rfind_seq(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| haystack[i..i + needle.len()] == *needle)
}

fn find_seq(haystack: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn fitting_text_is_untouched() {
        assert_eq!(split_message("short", 100), vec!["short".to_string()]);
        assert_eq!(split_message("", 100), vec![String::new()]);
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let parts = split_message(&text, 64);
        assert_eq!(parts, vec!["a".repeat(50), "b".repeat(50)]);
    }

    #[test]
    fn hard_split_without_breaks() {
        let text = "x".repeat(150);
        let parts = split_message(&text, 64);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].chars().count(), 64);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn reopens_tags_with_attributes() {
        let body = "word ".repeat(20);
        let text = format!("<a href=\"https://e.x\">{}</a>", body.trim_end());
        let parts = split_message(&text, 64);
        assert!(parts.len() > 1);
        assert!(parts[0].ends_with("</a>"));
        assert!(parts[1].starts_with("<a href=\"https://e.x\">"));
        assert!(parts.iter().all(|p| text_len(p) <= 64));
    }

    #[test]
    fn link_too_wide_for_a_chunk_is_unwrapped() {
        let href = format!("https://example.com/{}", "p".repeat(100));
        let text = format!("<a href=\"{href}\">{}</a>", ["word"; 60].join(" "));
        let parts = split_message(&text, 100);

        assert!(parts.len() < 10, "one chunk per visible char: {}", parts.len());
        for part in &parts {
            assert!(text_len(part) <= 100, "{} chars: {part:?}", text_len(part));
            assert!(!part.contains("<a "));
        }
        let joined = parts.join(" ");
        assert_eq!(joined.matches("word").count(), 60);
        assert!(parts.concat().contains(&format!("({href})")));
    }

    #[test]
    fn nested_wrappers_count_toward_unwrapping() {
        let href = format!("https://e.x/{}", "q".repeat(20));
        let link = format!("<a href=\"{href}\">{}</a>", "w ".repeat(30).trim_end());

        // 47 chars of link tags leave room for text.
        let alone = unwrap_wide_links(&link, 64);
        assert_eq!(alone, link);

        // Inside bold, italic and code there is no room left for text.
        let nested = format!("<b><i><code>{link}</code></i></b>");
        let unwrapped = unwrap_wide_links(&nested, 64);
        assert!(!unwrapped.contains("<a "));
        assert!(unwrapped.ends_with(&format!(" ({href})</code></i></b>")));
    }

    #[test]
    fn closing_tag_cancels_latest_opening() {
        let open = unclosed_tags("<b>x <i>y</b> z");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].name, "i");
    }

    #[test]
    fn never_cuts_inside_tag_or_entity() {
        let c = chars("abc <code>x</code>");
        assert_eq!(avoid_markup(&c, 7), 4);
        let c = chars("abc &amp; d");
        assert_eq!(avoid_markup(&c, 6), 4);
        assert_eq!(avoid_markup(&c, 9), 9);
    }

    #[test]
    fn pre_block_moves_to_next_chunk() {
        let text = format!("{} <pre>{}</pre>", "intro".repeat(8), "line\n".repeat(8));
        let parts = split_message(&text, 64);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "intro".repeat(8));
        assert!(parts[1].starts_with("<pre>") && parts[1].ends_with("</pre>"));
    }

    #[test]
    fn oversized_pre_is_split_and_rebalanced() {
        let text = format!("<pre>{}</pre>", "0123456789\n".repeat(20));
        let parts = split_message(&text, 64);
        assert!(parts.len() > 2);
        for part in &parts {
            assert!(text_len(part) <= 64);
            assert!(part.starts_with("<pre>"));
            assert!(part.ends_with("</pre>"));
        }
    }
}
