/// Required-phrase rules, the verbatim-term note, and the sequelae rule.
use regex::{Captures, Regex};
use std::sync::LazyLock;

use super::Rule;
use crate::core::dates::{format_date, parse_date};
use crate::core::facts::ResolvedFactSet;

static LAST_DOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([Ll])ast dose\b").unwrap());

static NOT_CONSIDERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([Ww]ere|[Ww]as) not considered\b").unwrap());

static AGE_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)(?:\s+|-)years?(?:\s+|-)old\b").unwrap()
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap());

static WITH_SEQUELAE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwith sequelae\b(?: \(sequelae not specified\))?").unwrap()
});

/// "most recent dose", never "last dose".
pub struct MostRecentDoseRule;

impl Rule for MostRecentDoseRule {
    fn name(&self) -> &'static str {
        "most_recent_dose"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        LAST_DOSE
            .replace_all(text, |caps: &Captures| {
                if &caps[1] == "L" {
                    "Most recent dose"
                } else {
                    "most recent dose"
                }
            })
            .into_owned()
    }
}

/// "were considered not", never "were not considered".
pub struct ConsideredNotRule;

impl Rule for ConsideredNotRule {
    fn name(&self) -> &'static str {
        "considered_not"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        NOT_CONSIDERED
            .replace_all(text, "$1 considered not")
            .into_owned()
    }
}

/// Ages read `<N>-year-old`: hyphenated and singular.
pub struct AgePhraseRule;

impl Rule for AgePhraseRule {
    fn name(&self) -> &'static str {
        "age_phrase"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        AGE_PHRASE.replace_all(text, "${1}-year-old").into_owned()
    }
}

/// Any ISO date that reached the text is rewritten in display format.
pub struct IsoDateRule;

impl Rule for IsoDateRule {
    fn name(&self) -> &'static str {
        "iso_date"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        ISO_DATE
            .replace_all(text, |caps: &Captures| {
                let raw = &caps[0];
                parse_date(raw)
                    .map(format_date)
                    .unwrap_or_else(|| raw.to_string())
            })
            .into_owned()
    }
}

/// Adds the as-recorded term after "SAE of <preferred term>" when the
/// verbatim term differs from the preferred term. The preferred term is
/// matched in any case, since casing rules run later.
pub struct VerbatimTermRule;

impl Rule for VerbatimTermRule {
    fn name(&self) -> &'static str {
        "verbatim_term"
    }

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String {
        let (Some(preferred), Some(verbatim)) =
            (facts.get("preferred_term"), facts.get("verbatim_term"))
        else {
            return text.to_string();
        };
        if !facts.is_available("verbatim_term")
            || verbatim.trim().eq_ignore_ascii_case(preferred.trim())
            || text.contains("(verbatim term:")
        {
            return text.to_string();
        }
        let Ok(anchor) = Regex::new(&format!(r"SAE of (?i:{})", regex::escape(preferred.trim())))
        else {
            return text.to_string();
        };
        match anchor.find(text) {
            Some(found) => format!(
                "{} (verbatim term: {}){}",
                &text[..found.end()],
                verbatim.trim(),
                &text[found.end()..]
            ),
            None => text.to_string(),
        }
    }
}

/// An outcome "with sequelae" always states that the sequelae were not
/// specified.
pub struct SequelaeRule;

impl Rule for SequelaeRule {
    fn name(&self) -> &'static str {
        "sequelae"
    }

    fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
        WITH_SEQUELAE
            .replace_all(text, "with sequelae (sequelae not specified)")
            .into_owned()
    }
}
