/// The writing-convention rule engine: an ordered pipeline of pure text
/// transforms over the filled template and the resolved facts.
///
/// Every rule is idempotent, so running the pipeline on its own output
/// yields the same text.
pub mod casing;
pub mod clauses;
pub mod phrases;
pub mod tense;

use tracing::trace;

use crate::core::facts::ResolvedFactSet;

pub use clauses::CategorySets;

/// One text transform. Implementations must not depend on having run
/// before (no double application).
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String;
}

/// Rules applied in order.
pub struct RulePipeline {
    rules: Vec<Box<dyn Rule>>,
}

impl RulePipeline {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// The full convention set: verbatim term, required phrases, casing,
    /// sequelae, special-category clauses, then tense.
    ///
    /// Text inserted by a rule must already be in final form for every rule
    /// that runs before it, so the verbatim-term note goes first.
    pub fn standard(categories: CategorySets) -> Self {
        Self::empty()
            .with_rule(phrases::VerbatimTermRule)
            .with_rule(phrases::MostRecentDoseRule)
            .with_rule(phrases::ConsideredNotRule)
            .with_rule(phrases::AgePhraseRule)
            .with_rule(phrases::IsoDateRule)
            .with_rule(casing::RaceEthnicityCasingRule)
            .with_rule(casing::PreferredTermCasingRule)
            .with_rule(casing::ActionCausalityCasingRule)
            .with_rule(phrases::SequelaeRule)
            .with_rule(clauses::LiverClauseRule::new(categories.clone()))
            .with_rule(clauses::InfectionClauseRule::new(categories.clone()))
            .with_rule(clauses::WeightGainClauseRule::new(categories))
            .with_rule(tense::DechallengeTenseRule)
    }

    pub fn with_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn run(&self, text: &str, facts: &ResolvedFactSet) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            let next = rule.apply(&current, facts);
            if next != current {
                trace!(rule = rule.name(), "rule changed text");
                current = next;
            }
        }
        current
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Append a sentence to the paragraph that introduces the event (the first
/// one containing "SAE of"), or to the last paragraph when none does.
pub(crate) fn append_to_event_paragraph(text: &str, sentence: &str) -> String {
    let mut paragraphs: Vec<String> = text.split("\n\n").map(str::to_string).collect();
    let index = paragraphs
        .iter()
        .position(|p| p.contains("SAE of"))
        .unwrap_or(paragraphs.len().saturating_sub(1));
    if let Some(paragraph) = paragraphs.get_mut(index) {
        if !paragraph.is_empty() {
            paragraph.push(' ');
        }
        paragraph.push_str(sentence);
    }
    paragraphs.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shout;

    impl Rule for Shout {
        fn name(&self) -> &'static str {
            "shout"
        }

        fn apply(&self, text: &str, _facts: &ResolvedFactSet) -> String {
            text.to_uppercase()
        }
    }

    #[test]
    fn standard_order() {
        let pipeline = RulePipeline::standard(CategorySets::default());
        let names = pipeline.rule_names();
        assert_eq!(names.first(), Some(&"verbatim_term"));
        assert_eq!(names.last(), Some(&"dechallenge_tense"));
        let dates = names.iter().position(|n| *n == "iso_date").unwrap();
        let casing = names.iter().position(|n| *n == "race_ethnicity_casing").unwrap();
        assert!(dates < casing);
    }

    fn event_facts(verbatim: &str) -> ResolvedFactSet {
        let mut facts = ResolvedFactSet::default();
        facts.insert("preferred_term", "Neutropenia");
        facts.insert("verbatim_term", verbatim);
        facts.insert("race", "White");
        facts
    }

    const EVENT_TEXT: &str = "Subject S-1, a 58-year-old White Not Hispanic or Latino male, was enrolled.\n\n\
        On 12-Mar-2024, the subject experienced the SAE of Neutropenia (Grade 3).";

    #[test]
    fn verbatim_term_keeps_coded_words() {
        let pipeline = RulePipeline::standard(CategorySets::default());
        let facts = event_facts("LOW WHITE CELLS");
        let once = pipeline.run(EVENT_TEXT, &facts);
        assert!(
            once.contains("SAE of neutropenia (verbatim term: LOW WHITE CELLS)"),
            "{once}"
        );
        assert_eq!(pipeline.run(&once, &facts), once);
    }

    #[test]
    fn verbatim_term_dates_normalized_on_first_pass() {
        let pipeline = RulePipeline::standard(CategorySets::default());
        let facts = event_facts("ANC DROP ON 2024-03-11");
        let once = pipeline.run(EVENT_TEXT, &facts);
        assert!(once.contains("(verbatim term: ANC DROP ON 11-Mar-2024)"), "{once}");
        assert_eq!(pipeline.run(&once, &facts), once);
    }

    #[test]
    fn custom_rules_run_in_order() {
        let pipeline = RulePipeline::empty().with_rule(Shout);
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline.run("abc", &ResolvedFactSet::default()), "ABC");
    }

    #[test]
    fn append_targets_event_paragraph() {
        let text = "Intro.\n\nThe SAE of rash began.\n\nOutro.";
        assert_eq!(
            append_to_event_paragraph(text, "Extra."),
            "Intro.\n\nThe SAE of rash began. Extra.\n\nOutro."
        );
        assert_eq!(append_to_event_paragraph("Only.", "Extra."), "Only. Extra.");
    }
}
