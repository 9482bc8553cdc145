use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::entities::{decode_entities, escape_html};
use crate::error::StoryError;

/// What the caller expects a webhook body to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Toc,
    Html,
    ImageUrl,
    AudioUrl,
    PrimeInfo,
}

impl ResponseKind {
    fn default_mime(self) -> &'static str {
        match self {
            Self::AudioUrl => "audio/mpeg",
            _ => "image/png",
        }
    }

    /// Content-type prefix for bodies that are the media itself.
    pub fn binary_media_prefix(self) -> Option<&'static str> {
        match self {
            Self::ImageUrl => Some("image/"),
            Self::AudioUrl => Some("audio/"),
            _ => None,
        }
    }
}

/// Result of extracting the intended payload from a heterogeneous body.
///
/// `Payload` means a known structured field was found; `Fallback` means the
/// raw text was interpreted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Payload(String),
    Fallback(String),
    Empty,
}

impl Normalized {
    pub fn into_option(self) -> Option<String> {
        match self {
            Self::Payload(s) | Self::Fallback(s) => Some(s),
            Self::Empty => None,
        }
    }

    pub fn into_result(self) -> Result<String, StoryError> {
        self.into_option().ok_or(StoryError::EmptyResponse)
    }

    fn non_empty(self) -> Self {
        match &self {
            Self::Payload(s) | Self::Fallback(s) if s.trim().is_empty() => Self::Empty,
            _ => self,
        }
    }
}

static HTML_TAG_OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[a-zA-Z!/?]").expect("valid html opener regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("valid blank line regex"));
static TOC_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)chapter\s*\d|table of contents|^\s*\d+[\).]").expect("valid toc shape regex")
});

/// Whether the text already contains an HTML tag opener.
pub fn looks_like_html(text: &str) -> bool {
    HTML_TAG_OPENER.is_match(text)
}

/// Splits plain text on blank lines and wraps each escaped block in `<p>`.
pub fn paragraphs_from_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    BLANK_LINES
        .split(&text)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(|block| format!("<p>{}</p>", escape_html(block).replace('\n', "<br/>")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extracts the payload of `kind` from a raw response body.
pub fn normalize(body: &str, kind: ResponseKind) -> Normalized {
    normalize_at_depth(body, kind, 0)
}

const MAX_DEPTH: usize = 4;

fn normalize_at_depth(body: &str, kind: ResponseKind, depth: usize) -> Normalized {
    let text = body.trim();
    if text.is_empty() {
        return Normalized::Empty;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        let candidate = match &value {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        match candidate {
            Some(Value::Object(_)) => {
                if let Some(found) = structured_field(candidate, kind, depth) {
                    return found.non_empty();
                }
            }
            Some(Value::String(inner)) if depth < MAX_DEPTH => {
                return normalize_at_depth(inner, kind, depth + 1);
            }
            _ => {}
        }
    }

    text_fallback(text, kind).non_empty()
}

fn structured_field(value: Option<&Value>, kind: ResponseKind, depth: usize) -> Option<Normalized> {
    let obj = value?.as_object()?;
    let str_field = |name: &str| obj.get(name).and_then(Value::as_str);

    match kind {
        ResponseKind::Toc => str_field("toc")
            .or_else(|| str_field("output"))
            .map(|s| Normalized::Payload(s.trim().to_owned())),
        ResponseKind::Html => {
            if let Some(html) = str_field("html") {
                if looks_like_html(html) {
                    return Some(Normalized::Payload(html.to_owned()));
                }
                return Some(Normalized::Payload(paragraphs_from_text(&decode_entities(html))));
            }
            let output = str_field("output")?;
            if depth >= MAX_DEPTH {
                return Some(text_fallback(output.trim(), kind));
            }
            Some(match normalize_at_depth(output, kind, depth + 1) {
                Normalized::Fallback(s) => Normalized::Payload(s),
                other => other,
            })
        }
        ResponseKind::ImageUrl | ResponseKind::AudioUrl => {
            if let Some(url) = str_field("url") {
                return Some(Normalized::Payload(url.trim().to_owned()));
            }
            let data = str_field("data")?;
            if data.starts_with("data:") {
                return Some(Normalized::Payload(data.to_owned()));
            }
            let mime = str_field("mime")
                .or_else(|| str_field("type"))
                .unwrap_or(kind.default_mime());
            Some(Normalized::Payload(format!("data:{mime};base64,{data}")))
        }
        ResponseKind::PrimeInfo => match str_field("output") {
            Some(output) => Some(Normalized::Payload(output.trim().to_owned())),
            None => Some(Normalized::Payload(Value::Object(obj.clone()).to_string())),
        },
    }
}

fn text_fallback(text: &str, kind: ResponseKind) -> Normalized {
    match kind {
        ResponseKind::Html => {
            let decoded = decode_entities(text);
            if looks_like_html(&decoded) {
                Normalized::Fallback(decoded)
            } else {
                Normalized::Fallback(paragraphs_from_text(&decoded))
            }
        }
        ResponseKind::Toc
        | ResponseKind::ImageUrl
        | ResponseKind::AudioUrl
        | ResponseKind::PrimeInfo => Normalized::Fallback(text.to_owned()),
    }
}

/// HTML fragment for a chapter body, or an empty string.
pub fn coerce_html(raw: &str) -> String {
    normalize(raw, ResponseKind::Html)
        .into_option()
        .unwrap_or_default()
}

pub const DEFAULT_REFUSAL_PHRASES: [&str; 12] = [
    "i cannot",
    "i can't",
    "i won’t",
    "i won't",
    "i will not",
    "as an ai",
    "goes against my guidelines",
    "i'm unable to",
    "i am unable to",
    "cannot create a story seed",
    "policy",
    "sensitive",
];

/// Heuristic classifier for outline responses where the model declined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefusalPolicy {
    phrases: Vec<String>,
}

impl Default for RefusalPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REFUSAL_PHRASES.iter().map(|p| (*p).to_owned()))
    }
}

impl RefusalPolicy {
    pub fn new(phrases: impl IntoIterator<Item = String>) -> Self {
        let phrases = phrases
            .into_iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// A refusal phrase is present and the text does not read like a TOC.
    pub fn is_refusal(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if lower.trim().is_empty() {
            return false;
        }
        let has_marker = self.phrases.iter().any(|p| lower.contains(p.as_str()));
        has_marker && !looks_like_toc(&lower)
    }
}

/// Numbered lines, a "Chapter N" pattern or a "Table of Contents" header.
pub fn looks_like_toc(text: &str) -> bool {
    TOC_SHAPE.is_match(&text.to_lowercase())
}
