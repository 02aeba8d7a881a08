//! Intent-only validation of character actions.
//!
//! A character declares what it attempts; the dice and the DM decide what
//! happens. Text that narrates a result is a violation. Generation is retried
//! with a stricter instruction each time, and once attempts run out the
//! configured fallback applies.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown validation fallback: {0}")]
pub struct UnknownFallback(pub String);

/// Instruction level passed to the character job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStrictness {
    Standard,
    Strict,
    Strictest,
}

impl ValidationStrictness {
    /// Strictness for a 1-based attempt number.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => ValidationStrictness::Standard,
            2 => ValidationStrictness::Strict,
            _ => ValidationStrictness::Strictest,
        }
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            ValidationStrictness::Standard => {
                "Describe what your character attempts. Do not describe the result."
            }
            ValidationStrictness::Strict => {
                "Your last answer narrated an outcome. State only the attempt, \
                 using words like \"I try to\" or \"I attempt to\"."
            }
            ValidationStrictness::Strictest => {
                "Outcome language is forbidden. One sentence of intent only. \
                 Never say whether it works, hits, succeeds, or what happens next."
            }
        }
    }
}

/// What happens once every attempt still narrates an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFallback {
    /// Strip the outcome language and ship the remaining intent.
    #[default]
    AutoCorrect,
    /// Keep the text and require the DM to review it at adjudication.
    DmReview,
}

impl fmt::Display for ValidationFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFallback::AutoCorrect => f.write_str("auto_correct"),
            ValidationFallback::DmReview => f.write_str("dm_review"),
        }
    }
}

impl FromStr for ValidationFallback {
    type Err = UnknownFallback;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "auto_correct" | "autocorrect" => Ok(ValidationFallback::AutoCorrect),
            "dm_review" | "review" => Ok(ValidationFallback::DmReview),
            other => Err(UnknownFallback(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    /// Matched outcome phrases, lowercased, in order of first appearance.
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

lazy_static::lazy_static! {
    static ref OUTCOME_PATTERNS: Vec<Regex> = [
        r"(?i)\bsuccessfully\b",
        r"(?i)\bsucceed(s|ed)?\b",
        r"(?i)\bmanag(es|ed) to\b",
        r"(?i)\bfinally\b",
        r"(?i)\b(which|and it|and this) (causes|caused|results in|resulted in)\b",
        r"(?i)\bresulting in\b",
        r"(?i)\b(kills|killed|defeats|defeated|destroys|destroyed)\b",
        r"(?i)\b(it|the \w+) (works|worked|opens|opened|breaks|broke|falls|fell|collapses|collapsed|dies|died)\b",
        r"(?i)\band (hits|hit|lands|landed)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("outcome pattern is valid"))
    .collect();

    static ref SPACES: Regex = Regex::new(r"\s{2,}").expect("whitespace pattern is valid");
    static ref ORPHAN_PUNCT: Regex = Regex::new(r"\s+([,.;!?])").expect("punctuation pattern is valid");
}

/// Find outcome narration in a declared action.
pub fn validate_intent(narrative: &str) -> ValidationReport {
    let mut found: Vec<(usize, String)> = OUTCOME_PATTERNS
        .iter()
        .flat_map(|re| re.find_iter(narrative))
        .map(|m| (m.start(), m.as_str().to_lowercase()))
        .collect();
    found.sort_by_key(|(start, _)| *start);

    let mut violations: Vec<String> = Vec::new();
    for (_, phrase) in found {
        if !violations.contains(&phrase) {
            violations.push(phrase);
        }
    }
    ValidationReport { violations }
}

/// Remove outcome language, leaving only the attempt.
pub fn strip_outcome_language(narrative: &str, character_name: &str) -> String {
    let mut text = narrative.to_string();
    for re in OUTCOME_PATTERNS.iter() {
        text = re.replace_all(&text, "").into_owned();
    }
    let text = SPACES.replace_all(&text, " ");
    let text = ORPHAN_PUNCT.replace_all(&text, "$1");
    let text = text.trim();

    if text.chars().filter(|c| c.is_alphanumeric()).count() == 0 {
        format!("{character_name} attempts the action.")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_passes() {
        let report = validate_intent("I try to decode the signal with the ship's array.");
        assert!(report.is_valid());
    }

    #[test]
    fn test_outcome_detected() {
        let report =
            validate_intent("I successfully decode the signal and the hatch opens. Successfully!");
        assert_eq!(report.violations, vec!["successfully", "the hatch opens"]);
    }

    #[test]
    fn test_strip_keeps_intent() {
        let stripped = strip_outcome_language(
            "I aim at the console and successfully hack it.",
            "Zara",
        );
        assert_eq!(stripped, "I aim at the console and hack it.");
        assert!(validate_intent(&stripped).is_valid());
    }

    #[test]
    fn test_strip_falls_back_when_nothing_left() {
        assert_eq!(
            strip_outcome_language("Successfully!", "Zara"),
            "Zara attempts the action."
        );
    }

    #[test]
    fn test_strictness_ladder() {
        assert_eq!(ValidationStrictness::for_attempt(1), ValidationStrictness::Standard);
        assert_eq!(ValidationStrictness::for_attempt(2), ValidationStrictness::Strict);
        assert_eq!(ValidationStrictness::for_attempt(3), ValidationStrictness::Strictest);
        assert_eq!(ValidationStrictness::for_attempt(9), ValidationStrictness::Strictest);
    }

    #[test]
    fn test_fallback_parse() {
        assert_eq!("dm-review".parse::<ValidationFallback>().unwrap(), ValidationFallback::DmReview);
        assert_eq!(ValidationFallback::default(), ValidationFallback::AutoCorrect);
        assert!("ignore".parse::<ValidationFallback>().is_err());
    }
}
