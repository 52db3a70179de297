/// Casing rules: race and ethnicity in title case, preferred terms and
/// assessment text in lowercase.
use regex::{Captures, Regex};
use std::sync::LazyLock;

use super::Rule;
use crate::core::facts::ResolvedFactSet;

/// Words kept lowercase inside a title-cased phrase.
const MINOR_WORDS: &[&str] = &["or", "and", "of", "the"];

/// Coded race and ethnicity terms as they arrive from the data, longest
/// first so "NOT HISPANIC OR LATINO" wins over "HISPANIC OR LATINO".
const CODED_DEMOGRAPHIC_TERMS: &[&str] = &[
    "NATIVE HAWAIIAN OR OTHER PACIFIC ISLANDER",
    "AMERICAN INDIAN OR ALASKA NATIVE",
    "BLACK OR AFRICAN AMERICAN",
    "NOT HISPANIC OR LATINO",
    "HISPANIC OR LATINO",
    "WHITE",
    "ASIAN",
];

static DEMOGRAPHIC_PHRASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+-year-old )([^,.\n]+)").unwrap());

static ACTION_TAKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?i:action taken with study drug was) )([^.]+)").unwrap()
});

static CAUSALITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"((?i:assessed the event as) )([^.]+)").unwrap());

/// Title-case a phrase: every word capitalised except minor words after the
/// first. `"NOT HISPANIC OR LATINO"` → `"Not Hispanic or Latino"`.
pub fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            if i > 0 && MINOR_WORDS.contains(&lower.as_str()) {
                return lower;
            }
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Upper-case race and ethnicity codes in the demographic phrase (the words
/// after `<N>-year-old` up to the next comma) are rendered in title case.
/// Text elsewhere, such as verbatim terms, is left as recorded.
pub struct RaceEthnicityCasingRule;

impl RaceEthnicityCasingRule {
    fn terms(facts: &ResolvedFactSet) -> Vec<String> {
        let mut terms: Vec<String> = CODED_DEMOGRAPHIC_TERMS
            .iter()
            .map(|term| term.to_string())
            .collect();
        for name in ["race", "ethnicity"] {
            if let Some(value) = facts.get(name) {
                let upper = value.to_uppercase();
                if value == upper && !terms.contains(&upper) {
                    terms.push(upper);
                }
            }
        }
        terms.sort_by_key(|term| std::cmp::Reverse(term.len()));
        terms
    }
}

impl Rule for RaceEthnicityCasingRule {
    fn name(&self) -> &'static str {
        "race_ethnicity_casing"
    }

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String {
        let patterns: Vec<(Regex, String)> = Self::terms(facts)
            .into_iter()
            .filter_map(|term| {
                let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(&term))).ok()?;
                Some((pattern, title_case(&term)))
            })
            .collect();
        DEMOGRAPHIC_PHRASE
            .replace_all(text, |caps: &Captures| {
                let mut phrase = caps[2].to_string();
                for (pattern, cased) in &patterns {
                    phrase = pattern.replace_all(&phrase, cased.as_str()).into_owned();
                }
                format!("{}{phrase}", &caps[1])
            })
            .into_owned()
    }
}

/// The preferred term is lowercase immediately after "SAE of".
pub struct PreferredTermCasingRule;

impl Rule for PreferredTermCasingRule {
    fn name(&self) -> &'static str {
        "preferred_term_casing"
    }

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String {
        let Some(term) = facts.get("preferred_term") else {
            return text.to_string();
        };
        let Ok(pattern) = Regex::new(&format!(r"(SAE of )((?i:{}))", regex::escape(term.trim())))
        else {
            return text.to_string();
        };
        pattern
            .replace_all(text, |caps: &Captures| {
                format!("{}{}", &caps[1], caps[2].to_lowercase())
            })
            .into_owned()
    }
}

/// Action taken and causality assessments are lowercase.
pub struct ActionCausalityCasingRule;

impl Rule for ActionCausalityCasingRule {
    fn name(&self) -> &'static str {
        "action_causality_casing"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        let lower_tail = |caps: &Captures| format!("{}{}", &caps[1], caps[2].to_lowercase());
        let text = ACTION_TAKEN.replace_all(text, lower_tail);
        CAUSALITY.replace_all(&text, lower_tail).into_owned()
    }
}
