use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterOutlineEntry {
    pub id: u32,
    pub heading: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synopsis: Option<String>,
}

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect(concat!("valid regex ", stringify!($name))));
    };
}

regex!(FENCED, r"(?s)```.*?```");
regex!(BOLD, r"\*\*(.*?)\*\*");
regex!(TOC_FIRST_LINE, r"(?i)^[^\n]*Table of Contents[^\n]*\n?");
regex!(BASED_ON_PREAMBLE, r"(?is)^Based on.*?:\n+");
regex!(LIST_ITEM, r"^\s*(?:\d+[\).]|[•\-*]|\d+\s+)\s*(.*)$");
regex!(LIST_ITEM_START, r"^\s*(?:\d+[\).]|[•\-*])\s+");
regex!(SYNOPSIS_SEPARATOR, r"[—–\-:]\s+");
regex!(CHAPTER_LABEL, r"(?i)^(?:Chapter|Ch\.?|C)\s*\d+\s*[:.\-]\s*");
regex!(CHAPTER_LINE, r"(?i)^(?:Chapter|Ch\.?|C)\s*\d+\s*[:.\-]\s*(.*)$");
regex!(MD_HEADING, r"^#{1,6}\s+(.*)$");
regex!(MD_HEADING_MARKER, r"^#{1,6}\s+");
regex!(TRAILING_BREAK, r"\s{2,}$");

/// Cleans a raw backend TOC before it is stored and parsed: fenced code,
/// bold markers, a first "Table of Contents" line and a "Based on …:"
/// preamble are removed.
pub fn normalize_toc_text(raw: &str) -> String {
    let text = strip_markup(raw);
    let text = TOC_FIRST_LINE.replacen(&text, 1, "");
    BASED_ON_PREAMBLE.replacen(&text, 1, "").into_owned()
}

fn strip_markup(text: &str) -> String {
    let text = FENCED.replace_all(text, "");
    BOLD.replace_all(&text, "${1}").into_owned()
}

/// Parses free-form table-of-contents text into outline entries numbered
/// from 1.
pub fn parse_toc(toc: &str) -> Vec<ChapterOutlineEntry> {
    let cleaned = strip_markup(toc);
    let lines: Vec<&str> = cleaned
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let mut chapters = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        i += 1;

        if let Some(caps) = LIST_ITEM.captures(line) {
            let body = caps.get(1).map_or("", |m| m.as_str()).trim();
            let body = CHAPTER_LABEL.replacen(body, 1, "");
            let mut parts = SYNOPSIS_SEPARATOR.split(&body);
            let heading = parts.next().unwrap_or_default().to_owned();
            let synopsis = parts
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" - ");
            push_chapter(&mut chapters, &heading, Some(&synopsis));
            continue;
        }

        if let Some(caps) = MD_HEADING.captures(line) {
            let heading = caps.get(1).map_or("", |m| m.as_str());
            if heading.to_lowercase().contains("table of contents") {
                continue;
            }
            let synopsis = lines
                .get(i)
                .copied()
                .filter(|next| !MD_HEADING_MARKER.is_match(next) && !LIST_ITEM_START.is_match(next));
            if synopsis.is_some() {
                i += 1;
            }
            push_chapter(&mut chapters, heading, synopsis);
            continue;
        }

        if let Some(caps) = CHAPTER_LINE.captures(line) {
            let heading = caps.get(1).map_or("", |m| m.as_str());
            let synopsis = lines.get(i).copied().filter(|next| {
                !CHAPTER_LABEL.is_match(next)
                    && !MD_HEADING_MARKER.is_match(next)
                    && !LIST_ITEM_START.is_match(next)
            });
            if synopsis.is_some() {
                i += 1;
            }
            push_chapter(&mut chapters, heading, synopsis);
        }
    }

    if chapters.is_empty() {
        let titles: Vec<String> = lines
            .iter()
            .map(|line| TRAILING_BREAK.replace(line, "").trim().to_owned())
            .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("table of contents"))
            .collect();
        if titles.len() >= 2 {
            for title in &titles {
                push_chapter(&mut chapters, title, None);
            }
        }
    }

    chapters
}

fn push_chapter(chapters: &mut Vec<ChapterOutlineEntry>, raw_heading: &str, synopsis: Option<&str>) {
    let id = chapters.len() as u32 + 1;
    let heading = MD_HEADING_MARKER.replacen(raw_heading.trim(), 1, "");
    let heading = CHAPTER_LABEL.replacen(heading.trim(), 1, "");
    let heading = heading.trim();
    let heading = if heading.is_empty() {
        format!("Chapter {id}")
    } else {
        heading.to_owned()
    };
    let synopsis = synopsis
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    chapters.push(ChapterOutlineEntry { id, heading, synopsis });
}

/// Truncates or pads `list` to exactly `requested` entries (at least one),
/// renumbering ids from 1. Padding entries are `Chapter N` with no synopsis.
pub fn reconcile(list: Vec<ChapterOutlineEntry>, requested: usize) -> Vec<ChapterOutlineEntry> {
    let target = requested.max(1);
    let mut out: Vec<ChapterOutlineEntry> = list
        .into_iter()
        .take(target)
        .enumerate()
        .map(|(i, entry)| ChapterOutlineEntry {
            id: i as u32 + 1,
            ..entry
        })
        .collect();
    for i in out.len()..target {
        let id = i as u32 + 1;
        out.push(ChapterOutlineEntry {
            id,
            heading: format!("Chapter {id}"),
            synopsis: None,
        });
    }
    out
}

/// Illustration prompt for the book cover, seeded from the first two lines
/// of the outline.
pub fn build_cover_prompt(title: &str, toc: &str) -> String {
    let seed = toc
        .lines()
        .filter(|line| !line.is_empty())
        .take(2)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{title}: {seed}. Cozy watercolor, soft light, storybook composition, ancient relic/tech motif."
    )
}
