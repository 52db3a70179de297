use regex::Regex;
use std::sync::LazyLock;

use super::Rule;
use crate::core::facts::ResolvedFactSet;

static CHALLENGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:was|were) (dechallenged|rechallenged)\b").unwrap());

/// Phrases that report a later observation after the drug action.
const SEQUENCE_MARKERS: &[&str] = &[
    "subsequently",
    "after which",
    "following which",
    "thereafter",
    "and the event",
];

/// Dechallenge and rechallenge take the past perfect ("had been
/// dechallenged") when the same sentence goes on to report what followed.
pub struct DechallengeTenseRule;

impl DechallengeTenseRule {
    fn sentence(sentence: &str) -> String {
        let lower = sentence.to_lowercase();
        if SEQUENCE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            CHALLENGE.replace_all(sentence, "had been $1").into_owned()
        } else {
            sentence.to_string()
        }
    }
}

impl Rule for DechallengeTenseRule {
    fn name(&self) -> &'static str {
        "dechallenge_tense"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        if !CHALLENGE.is_match(text) {
            return text.to_string();
        }
        text.split("\n\n")
            .map(|paragraph| {
                paragraph
                    .split(". ")
                    .map(Self::sentence)
                    .collect::<Vec<_>>()
                    .join(". ")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
