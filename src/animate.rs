use std::sync::LazyLock;

use regex::{Captures, Regex};

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(&#?\w+;)|([\w'’]+)").expect("valid word token regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Wraps every word of the text runs in `html` in a `word` span.
///
/// With `new_count > 0` the last word is marked `word-new` and the
/// `new_count - 1` words before it `word-recent`. Character entities are
/// kept intact and tag markup is never touched.
pub fn wrap_words(html: &str, new_count: usize, skip_first_word: bool) -> String {
    if html.trim().is_empty() {
        return html.to_owned();
    }

    let total = text_runs(html)
        .map(|run| TOKEN.captures_iter(run).filter(|c| c.get(2).is_some()).count())
        .sum::<usize>();
    let wrapped_total = if skip_first_word { total.saturating_sub(1) } else { total };
    let last = wrapped_total.checked_sub(1);
    let recent_from = last.map(|last| (last + 1).saturating_sub(new_count));

    let mut out = String::with_capacity(html.len() * 2);
    let mut skip_pending = skip_first_word;
    let mut index = 0usize;
    let mut cursor = 0usize;

    let mut wrap_run = |run: &str, out: &mut String| {
        let replaced = TOKEN.replace_all(run, |caps: &Captures<'_>| {
            let Some(word) = caps.get(2) else {
                return caps[0].to_owned();
            };
            if skip_pending {
                skip_pending = false;
                return word.as_str().to_owned();
            }
            let class = match (last, recent_from) {
                (Some(last), _) if new_count > 0 && index == last => "word word-new",
                (_, Some(from)) if new_count > 0 && index >= from => "word word-recent",
                _ => "word",
            };
            index += 1;
            format!(r#"<span class="{class}">{}</span>"#, word.as_str())
        });
        out.push_str(&replaced);
    };

    for tag in TAG.find_iter(html) {
        wrap_run(&html[cursor..tag.start()], &mut out);
        out.push_str(tag.as_str());
        cursor = tag.end();
    }
    wrap_run(&html[cursor..], &mut out);
    out
}

fn text_runs(html: &str) -> impl Iterator<Item = &str> {
    TAG.split(html)
}

/// Number of whitespace-separated tokens in the visible text of `html`.
pub fn count_words(html: &str) -> usize {
    let text = TAG.replace_all(html, " ");
    let collapsed = WHITESPACE.replace_all(&text, " ");
    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        0
    } else {
        trimmed.split(' ').count()
    }
}
