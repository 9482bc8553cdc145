use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Seed metadata inferred from a free-text idea. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_length: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc: Option<String>,
}

impl PrimeInfo {
    pub fn is_empty(&self) -> bool {
        [
            &self.title,
            &self.description,
            &self.age_range,
            &self.genre,
            &self.chapter_length,
            &self.keypoints,
            &self.style,
            &self.toc,
        ]
        .iter()
        .all(|field| field.is_none())
            && self.chapters.is_none()
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        let chapters = match obj.get("chapters") {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|n| *n > 0);
        Self {
            title: text("title"),
            description: text("description"),
            age_range: text("ageRange"),
            genre: text("genre"),
            chapters,
            chapter_length: text("chapterLength"),
            keypoints: text("keypoints"),
            style: text("style"),
            toc: text("toc"),
        }
    }

    fn description(text: &str) -> Self {
        Self {
            description: Some(text.to_owned()),
            ..Self::default()
        }
    }
}

static TUPLE_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\(\s*(\{.*?\})\s*\)\s*,?").expect("valid tuple regex"));
static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```\s*json\s*(.*?)```").expect("valid fenced json regex"));
static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)```").expect("valid fenced regex"));
static LEADING_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\(\s*").expect("valid paren regex"));
static TRAILING_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\)\s*$").expect("valid paren regex"));

/// Interprets a seed-info response body, whatever shape it arrived in.
pub fn parse_prime_response(body: &str) -> PrimeInfo {
    let text = body.trim();
    match serde_json::from_str::<Value>(text) {
        Ok(value) => from_json(&value),
        Err(_) => {
            tracing::debug!("seed-info body is not JSON; reading it as text");
            parse_tuple(text).unwrap_or_else(|| {
                if text.is_empty() {
                    PrimeInfo::default()
                } else {
                    PrimeInfo::description(text)
                }
            })
        }
    }
}

fn from_json(value: &Value) -> PrimeInfo {
    match value {
        Value::Array(items) => match items.first() {
            Some(Value::Object(first)) => match first.get("output") {
                Some(Value::String(output)) => parse_output(output),
                _ => PrimeInfo::from_object(first),
            },
            _ => PrimeInfo::default(),
        },
        Value::Object(obj) => match obj.get("output") {
            Some(Value::String(output)) => parse_output(output),
            _ => PrimeInfo::from_object(obj),
        },
        Value::String(output) => parse_output(output),
        _ => PrimeInfo::default(),
    }
}

/// Parses an agent's `output` string: tuple form, fenced JSON, a bare JSON
/// object, an outline, or finally a plain description.
pub fn parse_output(output: &str) -> PrimeInfo {
    let out = output.trim();
    if out.is_empty() {
        return PrimeInfo::default();
    }
    if let Some(info) = parse_tuple(out) {
        return info;
    }

    let fenced = FENCED_JSON
        .captures(out)
        .or_else(|| FENCED.captures(out))
        .and_then(|caps| caps.get(1))
        .map_or(out, |m| m.as_str())
        .trim();
    let candidate = LEADING_PAREN.replace(fenced, "");
    let candidate = TRAILING_PAREN.replace(&candidate, "");
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&candidate) {
        let info = PrimeInfo::from_object(&obj);
        if !info.is_empty() {
            return info;
        }
    }

    if out.lines().filter(|line| !line.trim().is_empty()).count() >= 3 {
        return PrimeInfo {
            toc: Some(out.to_owned()),
            ..PrimeInfo::default()
        };
    }
    PrimeInfo::description(out)
}

/// First `({…})` group that parses into a non-empty [`PrimeInfo`].
fn parse_tuple(text: &str) -> Option<PrimeInfo> {
    TUPLE_OBJECT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| match serde_json::from_str::<Value>(m.as_str()) {
            Ok(Value::Object(obj)) => Some(PrimeInfo::from_object(&obj)),
            _ => None,
        })
        .find(|info| !info.is_empty())
}
