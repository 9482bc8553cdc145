use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_AGE_RANGE: &str = "6-8";

struct AgeBin {
    label: &'static str,
    min: u32,
    max: Option<u32>,
}

// 4-8 and 6-8 overlap on purpose; both are offered as choices.
const BINS: [AgeBin; 7] = [
    AgeBin { label: "1-3", min: 1, max: Some(3) },
    AgeBin { label: "4-8", min: 4, max: Some(8) },
    AgeBin { label: "6-8", min: 6, max: Some(8) },
    AgeBin { label: "9-15", min: 9, max: Some(15) },
    AgeBin { label: "16-20", min: 16, max: Some(20) },
    AgeBin { label: "21-25", min: 21, max: Some(25) },
    AgeBin { label: "25+", min: 25, max: None },
];

static PLUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\s*\+").expect("valid plus regex"));
static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,3})\s*(?:[-–—]|to|through)\s*(\d{1,3})\b").expect("valid range regex")
});
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\b").expect("valid number regex"));

/// Maps free-form audience text to one of the canonical age bins.
pub fn normalize_age_range(raw: &str) -> &'static str {
    let text = raw.trim();
    if text.is_empty() {
        return DEFAULT_AGE_RANGE;
    }
    if let Some(bin) = BINS.iter().find(|bin| bin.label == text) {
        return bin.label;
    }

    let lower = text.to_lowercase();
    let has_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has_any(&["toddler", "infant", "baby"]) {
        return "1-3";
    }
    if has_any(&["kid", "child", "elementary", "grade school"]) {
        return "6-8";
    }
    if has_any(&["teen", "middle school"]) {
        return "16-20";
    }
    if has_any(&["adult", "grown", "mature"]) {
        return "21-25";
    }

    if let Some(n) = capture_number(&PLUS, &lower, 1) {
        return bin_for_point(f64::from(n));
    }
    if let (Some(a), Some(b)) = (capture_number(&RANGE, &lower, 1), capture_number(&RANGE, &lower, 2)) {
        return bin_for_range(a, b);
    }
    if let Some(n) = capture_number(&NUMBER, &lower, 1) {
        return bin_for_point(f64::from(n));
    }
    DEFAULT_AGE_RANGE
}

fn capture_number(re: &Regex, text: &str, group: usize) -> Option<u32> {
    re.captures(text)?.get(group)?.as_str().parse().ok()
}

fn bin_for_point(age: f64) -> &'static str {
    if age <= 0.0 {
        return DEFAULT_AGE_RANGE;
    }
    if age >= 25.0 {
        return "25+";
    }
    let mut best: Option<(&'static str, f64)> = None;
    for bin in &BINS {
        let Some(max) = bin.max else {
            continue;
        };
        let distance = ((f64::from(bin.min) + f64::from(max)) / 2.0 - age).abs();
        if best.is_none_or(|(_, d)| distance < d) {
            best = Some((bin.label, distance));
        }
    }
    best.map_or(DEFAULT_AGE_RANGE, |(label, _)| label)
}

fn bin_for_range(a: u32, b: u32) -> &'static str {
    let (start, end) = (a.min(b), a.max(b));
    if start == 0 {
        return DEFAULT_AGE_RANGE;
    }
    if end >= 25 {
        return "25+";
    }
    bin_for_point(f64::from(start + end) / 2.0)
}

/// Numeric bounds of a canonical range; `25+` has no upper bound.
pub fn age_bounds(age_range: &str) -> (Option<u32>, Option<u32>) {
    let label = normalize_age_range(age_range);
    match BINS.iter().find(|bin| bin.label == label) {
        Some(bin) => (Some(bin.min), bin.max),
        None => (None, None),
    }
}

/// Words-per-chapter target sent with every chapter request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthHint {
    pub range: [u32; 2],
    pub label: String,
}

impl LengthHint {
    fn new(min: u32, max: u32, label: &str) -> Self {
        Self {
            range: [min, max],
            label: label.to_owned(),
        }
    }
}

pub fn chapter_length_hint(age_range: &str) -> LengthHint {
    if let (Some(min), Some(max)) = age_bounds(age_range) {
        if max <= 3 {
            return LengthHint::new(50, 150, "1–3");
        }
        if min >= 4 && max <= 8 {
            return LengthHint::new(500, 1000, "4–8");
        }
        if min >= 9 && max <= 15 {
            return LengthHint::new(1500, 3000, "9–15");
        }
        if min >= 16 && max <= 20 {
            return LengthHint::new(2500, 4000, "16–20");
        }
        if min >= 21 && max <= 25 {
            return LengthHint::new(3000, 5000, "21–25");
        }
        if min >= 26 || max >= 26 {
            return LengthHint::new(3000, 6000, "25+");
        }
    }
    LengthHint::new(3000, 5000, "default-adult")
}
