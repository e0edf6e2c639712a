//! Deterministic crisis keyword screen.
//!
//! Used to derive a safety label and score for backends that do not report
//! one. Phrases are matched case-insensitively on word boundaries; a trailing
//! `*` marks a stem that matches any word it begins. A phrase directly preceded
//! by a negation ("not", "never", "don't", optionally one word in between) is
//! ignored.

use std::sync::LazyLock;

use mindease_core::risk::RiskLevel;
use regex::Regex;

const CRITICAL: &[&str] = &[
    "kill myself",
    "suicide plan",
    "end my life",
    "going to die",
    "goodbye forever",
    "final message",
    "overdose",
    "jump off",
    "hanging myself",
    "cutting deep",
    "want to die today",
];

const HIGH: &[&str] = &[
    "suicid*",
    "kill me",
    "end it all",
    "better off dead",
    "no reason to live",
    "wish i was dead",
    "want to die",
    "self harm",
    "cut myself",
    "hurt myself badly",
];

const MEDIUM: &[&str] = &[
    "harm myself",
    "hurt myself",
    "cutting",
    "self injur*",
    "thoughts of dying",
    "life isn't worth",
    "feel worthless",
    "everyone would be better",
    "nothing matters",
    "no point",
];

const LOW: &[&str] = &[
    "hopeless",
    "helpless",
    "empty inside",
    "numb",
    "can't cope",
    "breaking down",
    "falling apart",
    "exhausted",
    "burned out",
    "can't take it",
];

static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:don't|dont|do not|never|not|no|wont|won't|will not)\s+(?:\w+\s+)?$")
        .expect("valid negation pattern")
});

static TIERS: LazyLock<Vec<(RiskLevel, Vec<Regex>)>> = LazyLock::new(|| {
    [
        (RiskLevel::Critical, CRITICAL),
        (RiskLevel::High, HIGH),
        (RiskLevel::Medium, MEDIUM),
        (RiskLevel::Low, LOW),
    ]
    .into_iter()
    .map(|(level, phrases)| (level, phrases.iter().filter_map(|p| phrase_regex(p)).collect()))
    .collect()
});

fn phrase_regex(phrase: &str) -> Option<Regex> {
    let (body, tail) = match phrase.strip_suffix('*') {
        Some(stem) => (stem, r"\w*"),
        None => (phrase, r"\b"),
    };
    Regex::new(&format!(r"(?i)\b{}{}", regex::escape(body), tail)).ok()
}

fn matches_unnegated(re: &Regex, text: &str) -> bool {
    re.find_iter(text)
        .any(|m| !NEGATION_RE.is_match(&text[..m.start()]))
}

/// Highest keyword tier present in `text`.
pub fn screen(text: &str) -> RiskLevel {
    TIERS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|re| matches_unnegated(re, text)))
        .map(|(level, _)| *level)
        .unwrap_or(RiskLevel::None)
}

/// Safety label and score that classify back to `level`.
pub fn safety_signal(level: RiskLevel) -> (&'static str, f64) {
    match level {
        RiskLevel::Critical => ("crisis", 0.97),
        RiskLevel::High => ("caution", 0.80),
        RiskLevel::Medium => ("caution", 0.55),
        RiskLevel::Low => ("safe", 0.25),
        RiskLevel::None => ("safe", 0.02),
    }
}
