/// Special-category clauses for liver, infection, and weight-gain events.
///
/// Each clause is emitted only when the supporting measurements exist.
/// Missing lab data is not an error; the clause is simply left out.
use rustc_hash::FxHashSet;
use serde::Deserialize;

use super::{append_to_event_paragraph, Rule};
use crate::core::dates::format_date;
use crate::core::facts::{ClinicalContext, ResolvedFactSet};
use crate::schema::measurement::Measurement;

/// Liver tests reported in the ULN clause, in reporting order.
const LIVER_TESTS: &[&str] = &["ALT", "AST", "BILI", "ALP", "GGT"];

/// Vocabularies that place an event in a special category. Matched against
/// the upper-cased preferred term and system organ class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CategorySets {
    pub liver: FxHashSet<String>,
    pub infection: FxHashSet<String>,
    pub weight_gain: FxHashSet<String>,
}

fn set(terms: &[&str]) -> FxHashSet<String> {
    terms.iter().map(|t| t.to_string()).collect()
}

impl Default for CategorySets {
    fn default() -> Self {
        Self {
            liver: set(&[
                "HEPATOBILIARY DISORDERS",
                "ALANINE AMINOTRANSFERASE INCREASED",
                "ASPARTATE AMINOTRANSFERASE INCREASED",
                "BLOOD BILIRUBIN INCREASED",
                "TRANSAMINASES INCREASED",
                "HEPATIC ENZYME INCREASED",
                "LIVER FUNCTION TEST INCREASED",
                "HEPATIC FUNCTION ABNORMAL",
                "HEPATOTOXICITY",
                "DRUG-INDUCED LIVER INJURY",
                "LIVER INJURY",
                "HEPATITIS",
            ]),
            infection: set(&[
                "INFECTIONS AND INFESTATIONS",
                "PNEUMONIA",
                "SEPSIS",
                "NEUTROPENIC SEPSIS",
                "FEBRILE NEUTROPENIA",
                "URINARY TRACT INFECTION",
                "CELLULITIS",
            ]),
            weight_gain: set(&["WEIGHT INCREASED", "WEIGHT GAIN", "ABNORMAL WEIGHT GAIN"]),
        }
    }
}

impl CategorySets {
    fn matches(terms: &FxHashSet<String>, context: &ClinicalContext) -> bool {
        [&context.preferred_term, &context.system_organ_class]
            .into_iter()
            .flatten()
            .any(|value| terms.contains(&value.trim().to_uppercase()))
    }

    pub fn is_liver(&self, context: &ClinicalContext) -> bool {
        Self::matches(&self.liver, context)
    }

    pub fn is_infection(&self, context: &ClinicalContext) -> bool {
        Self::matches(&self.infection, context)
    }

    pub fn is_weight_gain(&self, context: &ClinicalContext) -> bool {
        Self::matches(&self.weight_gain, context)
    }
}

fn of_test<'a>(measurements: &'a [Measurement], code: &'a str) -> impl Iterator<Item = &'a Measurement> {
    measurements.iter().filter(move |m| m.is_test(code))
}

/// The measurement closest to onset: latest on or before it, otherwise the
/// earliest after it.
fn nearest_onset<'a>(measurements: &'a [Measurement], code: &'a str, context: &ClinicalContext) -> Option<&'a Measurement> {
    let mut candidates: Vec<&Measurement> = of_test(measurements, code).collect();
    candidates.sort_by_key(|m| m.collected_on);
    match context.onset_date {
        Some(onset) => candidates
            .iter()
            .rev()
            .find(|m| m.collected_on <= onset)
            .or_else(|| candidates.first())
            .copied(),
        None => candidates.last().copied(),
    }
}

/// Baseline liver values against their ULN, plus post-onset peaks.
pub struct LiverClauseRule {
    categories: CategorySets,
}

impl LiverClauseRule {
    pub fn new(categories: CategorySets) -> Self {
        Self { categories }
    }

    fn clause(context: &ClinicalContext) -> Option<String> {
        let mut baseline = Vec::new();
        let mut peaks = Vec::new();
        for code in LIVER_TESTS {
            let Some(base) = of_test(&context.measurements, code)
                .filter(|m| m.baseline)
                .find(|m| m.upper_limit_normal.is_some())
            else {
                continue;
            };
            let uln = base.upper_limit_normal?;
            baseline.push(format!(
                "{code} was {} {} (ULN {uln} {})",
                base.value, base.unit, base.unit
            ));

            let peak = of_test(&context.measurements, code)
                .filter(|m| !m.baseline)
                .filter(|m| context.onset_date.map_or(true, |onset| m.collected_on >= onset))
                .max_by(|a, b| a.value.total_cmp(&b.value));
            if let Some(peak) = peak {
                let multiple = peak.uln_multiple().or_else(|| {
                    (uln > 0.0).then(|| peak.value / uln)
                });
                if let Some(multiple) = multiple {
                    peaks.push(format!(
                        "{code} {} {} ({multiple:.1} x ULN) on {}",
                        peak.value,
                        peak.unit,
                        format_date(peak.collected_on)
                    ));
                }
            }
        }
        if baseline.is_empty() {
            return None;
        }
        let mut clause = format!("At baseline, {}.", baseline.join(", "));
        if !peaks.is_empty() {
            clause.push_str(&format!(" Peak values after onset were {}.", peaks.join(", ")));
        }
        Some(clause)
    }
}

impl Rule for LiverClauseRule {
    fn name(&self) -> &'static str {
        "liver_clause"
    }

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String {
        if text.contains("At baseline, ") || !self.categories.is_liver(&facts.context) {
            return text.to_string();
        }
        match Self::clause(&facts.context) {
            Some(clause) => append_to_event_paragraph(text, &clause),
            None => text.to_string(),
        }
    }
}

/// White-cell and neutrophil counts at the time of an infection. Both must
/// be present.
pub struct InfectionClauseRule {
    categories: CategorySets,
}

impl InfectionClauseRule {
    pub fn new(categories: CategorySets) -> Self {
        Self { categories }
    }
}

const INFECTION_MARKER: &str = "At the time of the event, WBC was";

impl Rule for InfectionClauseRule {
    fn name(&self) -> &'static str {
        "infection_clause"
    }

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String {
        let context = &facts.context;
        if text.contains(INFECTION_MARKER) || !self.categories.is_infection(context) {
            return text.to_string();
        }
        let (Some(wbc), Some(anc)) = (
            nearest_onset(&context.measurements, "WBC", context),
            nearest_onset(&context.measurements, "ANC", context),
        ) else {
            return text.to_string();
        };
        let clause = format!(
            "{INFECTION_MARKER} {} {} and ANC was {} {}.",
            wbc.value, wbc.unit, anc.value, anc.unit
        );
        append_to_event_paragraph(text, &clause)
    }
}

/// Weight change from the first to the latest weight, with the rate of gain
/// per week in parentheses.
pub struct WeightGainClauseRule {
    categories: CategorySets,
}

impl WeightGainClauseRule {
    pub fn new(categories: CategorySets) -> Self {
        Self { categories }
    }

    fn clause(context: &ClinicalContext) -> Option<String> {
        let mut weights: Vec<&Measurement> = of_test(&context.measurements, "WEIGHT").collect();
        weights.sort_by_key(|m| (!m.baseline, m.collected_on));
        let start = *weights.first()?;
        let end = weights.iter().copied().max_by_key(|m| m.collected_on)?;
        let days = (end.collected_on - start.collected_on).num_days();
        if days <= 0 {
            return None;
        }
        let gain = end.value - start.value;
        if gain <= 0.0 {
            return None;
        }
        let per_week = gain / (days as f64 / 7.0);
        Some(format!(
            "Weight increased from {} {} on {} to {} {} on {} (rate of gain {per_week:.1} {}/week).",
            start.value,
            start.unit,
            format_date(start.collected_on),
            end.value,
            end.unit,
            format_date(end.collected_on),
            end.unit
        ))
    }
}

impl Rule for WeightGainClauseRule {
    fn name(&self) -> &'static str {
        "weight_gain_clause"
    }

    fn apply(&self, text: &str, facts: &ResolvedFactSet) -> String {
        if text.contains("(rate of gain ") || !self.categories.is_weight_gain(&facts.context) {
            return text.to_string();
        }
        match Self::clause(&facts.context) {
            Some(clause) => append_to_event_paragraph(text, &clause),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lab(code: &str, value: f64, unit: &str, uln: Option<f64>, on: NaiveDate, baseline: bool) -> Measurement {
        Measurement {
            test_code: code.to_string(),
            value,
            unit: unit.to_string(),
            upper_limit_normal: uln,
            collected_on: on,
            baseline,
        }
    }

    fn facts(pt: &str, measurements: Vec<Measurement>) -> ResolvedFactSet {
        ResolvedFactSet::new(ClinicalContext {
            preferred_term: Some(pt.to_string()),
            onset_date: Some(date(2024, 3, 15)),
            measurements,
            ..Default::default()
        })
    }

    const TEXT: &str = "Intro.\n\nOn 15-Mar-2024, the SAE of aspartate aminotransferase increased began.";

    #[test]
    fn liver_clause_with_baseline_and_peak() {
        let f = facts(
            "Aspartate aminotransferase increased",
            vec![
                lab("AST", 28.0, "U/L", Some(34.0), date(2024, 1, 2), true),
                lab("AST", 170.0, "U/L", Some(34.0), date(2024, 3, 16), false),
                lab("AST", 40.0, "U/L", Some(34.0), date(2024, 3, 1), false),
            ],
        );
        let rule = LiverClauseRule::new(CategorySets::default());
        let out = rule.apply(TEXT, &f);
        assert!(out.ends_with(
            "began. At baseline, AST was 28 U/L (ULN 34 U/L). Peak values after onset were AST 170 U/L (5.0 x ULN) on 16-Mar-2024."
        ), "{out}");
        assert_eq!(rule.apply(&out, &f), out);
    }

    #[test]
    fn liver_clause_omitted_without_baseline() {
        let f = facts(
            "Aspartate aminotransferase increased",
            vec![lab("AST", 170.0, "U/L", Some(34.0), date(2024, 3, 16), false)],
        );
        let rule = LiverClauseRule::new(CategorySets::default());
        assert_eq!(rule.apply(TEXT, &f), TEXT);
    }

    #[test]
    fn liver_clause_needs_liver_event() {
        let f = facts(
            "Pneumonia",
            vec![lab("AST", 28.0, "U/L", Some(34.0), date(2024, 1, 2), true)],
        );
        assert_eq!(LiverClauseRule::new(CategorySets::default()).apply(TEXT, &f), TEXT);
    }

    #[test]
    fn system_organ_class_also_matches() {
        let context = ClinicalContext {
            system_organ_class: Some("Hepatobiliary disorders".to_string()),
            ..Default::default()
        };
        assert!(CategorySets::default().is_liver(&context));
    }

    #[test]
    fn infection_clause_requires_both_counts() {
        let rule = InfectionClauseRule::new(CategorySets::default());
        let only_wbc = facts(
            "Pneumonia",
            vec![lab("WBC", 2.1, "10^9/L", None, date(2024, 3, 14), false)],
        );
        assert_eq!(rule.apply(TEXT, &only_wbc), TEXT);

        let both = facts(
            "Pneumonia",
            vec![
                lab("WBC", 2.1, "10^9/L", None, date(2024, 3, 14), false),
                lab("ANC", 0.8, "10^9/L", None, date(2024, 3, 14), false),
                lab("ANC", 3.0, "10^9/L", None, date(2024, 1, 2), true),
            ],
        );
        let out = rule.apply(TEXT, &both);
        assert!(out.ends_with("At the time of the event, WBC was 2.1 10^9/L and ANC was 0.8 10^9/L."));
        assert_eq!(rule.apply(&out, &both), out);
    }

    #[test]
    fn weight_gain_rate_in_parentheses() {
        let rule = WeightGainClauseRule::new(CategorySets::default());
        let f = facts(
            "Weight increased",
            vec![
                lab("WEIGHT", 70.0, "kg", None, date(2024, 1, 1), true),
                lab("WEIGHT", 77.0, "kg", None, date(2024, 3, 11), false),
            ],
        );
        let out = rule.apply(TEXT, &f);
        assert!(out.ends_with(
            "Weight increased from 70 kg on 01-Jan-2024 to 77 kg on 11-Mar-2024 (rate of gain 0.7 kg/week)."
        ), "{out}");
        assert_eq!(rule.apply(&out, &f), out);
    }

    #[test]
    fn weight_gain_needs_two_dates() {
        let rule = WeightGainClauseRule::new(CategorySets::default());
        let f = facts(
            "Weight increased",
            vec![lab("WEIGHT", 70.0, "kg", None, date(2024, 1, 1), true)],
        );
        assert_eq!(rule.apply(TEXT, &f), TEXT);
    }

    #[test]
    fn weight_loss_emits_no_gain_clause() {
        let rule = WeightGainClauseRule::new(CategorySets::default());
        let f = facts(
            "Weight increased",
            vec![
                lab("WEIGHT", 80.0, "kg", None, date(2024, 1, 1), true),
                lab("WEIGHT", 75.0, "kg", None, date(2024, 3, 11), false),
            ],
        );
        assert_eq!(rule.apply(TEXT, &f), TEXT);
    }

    #[test]
    fn categories_deserialize_with_defaults() {
        let sets: CategorySets = ron::from_str(r#"(liver: ["DRUG-INDUCED LIVER INJURY"])"#).unwrap();
        assert_eq!(sets.liver.len(), 1);
        assert!(!sets.infection.is_empty());
    }
}
