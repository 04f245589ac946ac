//! Error classification for failed phase executions.
//!
//! A failed execution is either retried, turned into a blocking question for
//! a human, or treated as fatal. `KeywordClassifier` decides with a fixed set
//! of phrases and patterns; callers can plug in a different `ErrorClassifier`.

use regex::Regex;
use std::sync::LazyLock;

/// What to do with a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Ask a human; do not retry.
    NeedsHumanInput,
    /// Retrying cannot help.
    Fatal,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &str) -> ErrorClass;
}

/// Numbered alternatives offered by the worker ("1. ... 2. ...").
static OPTION_LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*1[.)]\s+.+\n\s*2[.)]\s+").unwrap()
});

/// A line that ends in a question mark.
static QUESTION_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[^\n]*\?\s*$").unwrap()
});

/// Signals that the worker cannot continue without a decision.
const AMBIGUITY_SIGNALS: &[&str] = &[
    "ambiguous",
    "unclear",
    "clarification",
    "clarify",
    "which approach",
    "which option",
    "design decision",
    "conflicting requirements",
    "requirements conflict",
    "need more information",
    "needs human",
    "human input",
    "please confirm",
    "should i",
    "would you like",
];

/// Signals that a retry would fail the same way.
const FATAL_SIGNALS: &[&str] = &[
    "executor binary not found",
    "permission denied",
    "authentication failed",
    "invalid api key",
    "not authorized",
];

/// Keyword heuristic over the error text.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    extra_signals: Vec<String>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a phrase that should also be treated as needing human input.
    pub fn with_signal(mut self, phrase: &str) -> Self {
        self.extra_signals.push(phrase.to_lowercase());
        self
    }
}

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, error: &str) -> ErrorClass {
        let lower = error.to_lowercase();

        if FATAL_SIGNALS.iter().any(|s| lower.contains(s)) {
            return ErrorClass::Fatal;
        }

        let ambiguous = AMBIGUITY_SIGNALS.iter().any(|s| lower.contains(s))
            || self.extra_signals.iter().any(|s| lower.contains(s.as_str()))
            || OPTION_LIST_RE.is_match(error)
            || QUESTION_LINE_RE.is_match(error);
        if ambiguous {
            return ErrorClass::NeedsHumanInput;
        }

        ErrorClass::Transient
    }
}

/// Pull the question out of an error for display: the last line ending in
/// `?`, or the whole trimmed message.
pub fn extract_question(error: &str) -> String {
    error
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.ends_with('?'))
        .unwrap_or_else(|| error.trim())
        .to_string()
}
