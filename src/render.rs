//! Incremental markdown rendering for streamed chapter text.
//!
//! Every function here is pure and is called again on the whole accumulated
//! text after each fragment. Constructs that are not lexically closed yet stay
//! literal so completed output never changes shape as more text arrives.

use std::sync::LazyLock;

use regex::Regex;

use crate::animate::wrap_words;
use crate::entities::{decode_entities, escape_html};
use crate::normalize::{coerce_html, looks_like_html};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// More text may still arrive; an unterminated heading line stays literal.
    Streaming,
    /// The text is complete.
    Final,
}

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect(concat!("valid regex ", stringify!($name))));
    };
}

regex!(H6, r"(?m)^######[ \t]+(.*)$");
regex!(H5, r"(?m)^#####[ \t]+(.*)$");
regex!(H4, r"(?m)^####[ \t]+(.*)$");
regex!(H3, r"(?m)^###[ \t]+(.*)$");
regex!(H2, r"(?m)^##[ \t]+(.*)$");
regex!(H1, r"(?m)^#[ \t]+(.*)$");
regex!(BOLD_STARS, r"\*\*(.+?)\*\*");
regex!(BOLD_UNDERSCORES, r"__(.+?)__");
regex!(ITALIC_UNDERSCORE, r"\b_([^_\s][^_\n]*?)_\b");
regex!(ITALIC_STAR, r"(^|[^*])\*([^*\s][^*\n]*?)\*");
regex!(HEADING_LINE, r"(?m)^(<h[1-6]>.*</h[1-6]>)$");
regex!(BLANK_LINES, r"\n{2,}");
regex!(HEADING_BLOCK, r"^<h[1-6]>");
regex!(
    FIRST_HEADING,
    r#"(?is)^\s*((?:<div[^>]*class="[^"]*words-flash[^"]*"[^>]*>\s*)?)<h[1-6][^>]*>.*?</h[1-6]>\s*"#
);
regex!(
    LABEL_IN_PARAGRAPH,
    r#"(?i)^\s*((?:<div[^>]*class="[^"]*words-flash[^"]*"[^>]*>\s*)?(?:<p[^>]*>\s*)?)\s*Chapter\s+[^:]{1,80}:\s*"#
);
regex!(LABEL_RAW, r"(?i)^\s*Chapter\s+[^:]{1,80}:\s*");
regex!(
    TITLE_IN_TAG,
    r#"(?i)^\s*(?:<div[^>]*class="[^"]*words-flash[^"]*"[^>]*>\s*)?(?:<h[1-6][^>]*>|<p[^>]*>)\s*Chapter\s+[^:]{1,80}:\s*([^<\n]{1,160})"#
);
regex!(TITLE_RAW, r"(?i)^\s*Chapter\s+[^:]{1,80}:\s*([^\n<]{1,160})");
regex!(SCENE_LABEL, r"(?i)^\s*Scene\b[\s:]*");

/// Markdown to HTML for text that may still be growing.
pub fn markdown_to_html_incremental(src: &str) -> String {
    markdown_to_html(src, RenderMode::Streaming)
}

pub fn markdown_to_html(src: &str, mode: RenderMode) -> String {
    let text = decode_entities(src).replace("\r\n", "\n");
    if text.trim().is_empty() {
        return String::new();
    }
    let escaped = escape_html(&text);

    let (closed, open_tail) = match mode {
        RenderMode::Final => (escaped.as_str(), ""),
        RenderMode::Streaming => split_open_heading(&escaped),
    };

    let mut s = closed.to_owned();
    for (re, tag) in [
        (&*H6, "h6"),
        (&*H5, "h5"),
        (&*H4, "h4"),
        (&*H3, "h3"),
        (&*H2, "h2"),
        (&*H1, "h1"),
    ] {
        s = re.replace_all(&s, format!("<{tag}>${{1}}</{tag}>")).into_owned();
    }
    // A heading line is always a block of its own.
    s = HEADING_LINE.replace_all(&s, "\n\n${1}\n\n").into_owned();
    s.push_str(open_tail);

    BLANK_LINES
        .split(&s)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(|block| {
            let block = inline_emphasis(block);
            if HEADING_BLOCK.is_match(&block) {
                block
            } else {
                format!("<p>{}</p>", block.replace('\n', "<br/>"))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Bold and italic spans; applied per block so no span crosses a paragraph.
fn inline_emphasis(block: &str) -> String {
    let s = BOLD_STARS.replace_all(block, "<strong>${1}</strong>");
    let s = BOLD_UNDERSCORES.replace_all(&s, "<strong>${1}</strong>");
    let s = ITALIC_UNDERSCORE.replace_all(&s, "<em>${1}</em>");
    ITALIC_STAR.replace_all(&s, "${1}<em>${2}</em>").into_owned()
}

/// Splits off a last line that starts with `#` and has no newline yet.
fn split_open_heading(text: &str) -> (&str, &str) {
    let line_start = text.rfind('\n').map_or(0, |i| i + 1);
    if text[line_start..].starts_with('#') {
        text.split_at(line_start)
    } else {
        (text, "")
    }
}

/// Renders the accumulated raw stream text into display HTML.
pub fn render_streaming(raw: &str) -> String {
    render(raw, RenderMode::Streaming)
}

pub fn render(raw: &str, mode: RenderMode) -> String {
    strip_leading_chapter_label(&strip_first_heading_tag(&render_unstripped(raw, mode)))
}

fn render_unstripped(raw: &str, mode: RenderMode) -> String {
    let text = decode_entities(raw);
    if text.trim().is_empty() {
        return String::new();
    }
    if looks_like_html(&text) {
        coerce_html(raw)
    } else {
        markdown_to_html(raw, mode)
    }
}

/// Drops the first `<h1>`..`<h6>` element at the very start of `html`,
/// keeping a leading `words-flash` wrapper if there is one.
pub fn strip_first_heading_tag(html: &str) -> String {
    if html.trim().is_empty() {
        return html.to_owned();
    }
    FIRST_HEADING.replacen(html, 1, "${1}").into_owned()
}

/// Removes a leading `Chapter <label>:` prefix.
pub fn strip_leading_chapter_label(html: &str) -> String {
    if html.trim().is_empty() {
        return html.to_owned();
    }
    let stripped = LABEL_IN_PARAGRAPH.replacen(html, 1, "${1}");
    if stripped != html {
        return stripped.into_owned();
    }
    LABEL_RAW.replacen(html, 1, "").into_owned()
}

/// Title from a leading `Chapter <label>: <title>`, or `fallback`.
pub fn extract_chapter_title(html: &str, fallback: &str) -> String {
    let found = TITLE_IN_TAG
        .captures(html)
        .or_else(|| TITLE_RAW.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|title| !title.is_empty());
    found.unwrap_or(fallback).to_owned()
}

/// Removes agent tool-call frames (`{"name":…,"parameters":…}`) and a
/// leading `Scene` label from one stream fragment.
pub fn strip_agent_protocol(chunk: &str) -> String {
    let decoded = decode_entities(chunk);
    let mut s = SCENE_LABEL.replacen(&decoded, 1, "").into_owned();

    for _ in 0..3 {
        let Some(open) = s.find('{') else {
            break;
        };
        let Some(len) = tool_call_len(&s[open..]) else {
            break;
        };
        s.replace_range(open..open + len, "");
    }
    s
}

/// Byte length of the tool-call object at the start of `text`, if it is one.
fn tool_call_len(text: &str) -> Option<usize> {
    let mut values = serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>();
    let value = values.next()?.ok()?;
    let obj = value.as_object()?;
    (obj.contains_key("name") && obj.contains_key("parameters")).then(|| values.byte_offset())
}

/// A completed chapter ready to be stored as a scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedChapter {
    pub title: String,
    pub html: String,
}

/// Final render of a chapter: flash wrapper, words wrapped without recency
/// classes, and the title echoed by the backend (or `fallback_heading`).
pub fn finalize_chapter(raw: &str, fallback_heading: &str) -> FinishedChapter {
    let unstripped = render_unstripped(raw, RenderMode::Final);
    FinishedChapter {
        title: extract_chapter_title(&unstripped, fallback_heading),
        html: finalize_chapter_html(raw),
    }
}

pub fn finalize_chapter_html(raw: &str) -> String {
    flash(&render(raw, RenderMode::Final))
}

/// Final render of a chapter body the normalizer already turned into HTML.
/// The body is not decoded again, so escaped text stays escaped.
pub fn finalize_normalized_chapter(html: &str, fallback_heading: &str) -> FinishedChapter {
    FinishedChapter {
        title: extract_chapter_title(html, fallback_heading),
        html: flash(&strip_leading_chapter_label(&strip_first_heading_tag(html))),
    }
}

fn flash(html: &str) -> String {
    format!(r#"<div class="words-flash">{}</div>"#, wrap_words(html, 0, false))
}
