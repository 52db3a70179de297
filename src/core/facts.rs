/// The resolved fact set: display values keyed by placeholder name, plus
/// the typed clinical context that selection and rules read.
use chrono::NaiveDate;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::schema::event::SeriousnessCriteria;
use crate::schema::exposure::DosingReference;
use crate::schema::measurement::Measurement;

/// Typed facts that are not placeholders: seriousness flags, raw coded
/// terms for category matching, and optional measurements.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClinicalContext {
    pub seriousness: SeriousnessCriteria,
    pub treatment_emergent: bool,
    pub preferred_term: Option<String>,
    pub verbatim_term: Option<String>,
    pub system_organ_class: Option<String>,
    pub onset_date: Option<NaiveDate>,
    pub dosing: DosingReference,
    pub dechallenged: bool,
    pub measurements: Vec<Measurement>,
}

/// Output of the field resolver. Every stored value is non-empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedFactSet {
    values: BTreeMap<String, String>,
    study_days: BTreeMap<String, i64>,
    fallbacks: FxHashSet<String>,
    pub context: ClinicalContext,
}

impl ResolvedFactSet {
    pub fn new(context: ClinicalContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    /// Store a resolved display value. Blank values are rejected and
    /// reported as `false` so the caller can apply the field's fallback.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        if value.trim().is_empty() {
            return false;
        }
        let name = name.into();
        self.fallbacks.remove(&name);
        self.values.insert(name, value);
        true
    }

    /// Store a configured fallback literal in place of a missing value.
    pub fn insert_fallback(&mut self, name: impl Into<String>, literal: impl Into<String>) {
        let name = name.into();
        self.values.insert(name.clone(), literal.into());
        self.fallbacks.insert(name);
    }

    pub fn set_study_day(&mut self, name: impl Into<String>, day: i64) {
        self.study_days.insert(name.into(), day);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn study_day(&self, name: &str) -> Option<i64> {
        self.study_days.get(name).copied()
    }

    /// Present and resolved from source data rather than a fallback.
    pub fn is_available(&self, name: &str) -> bool {
        self.values.contains_key(name) && !self.fallbacks.contains(name)
    }

    pub fn is_fallback(&self, name: &str) -> bool {
        self.fallbacks.contains(name)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// One `- name: value` line per fact, sorted by name. Study days are
    /// listed as `name (study day): N`.
    pub fn listing(&self) -> String {
        let mut lines = Vec::with_capacity(self.values.len() + self.study_days.len());
        for (name, value) in &self.values {
            lines.push(format!("- {name}: {value}"));
            if let Some(day) = self.study_days.get(name) {
                lines.push(format!("- {name} (study day): {day}"));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_not_stored() {
        let mut facts = ResolvedFactSet::default();
        assert!(!facts.insert("sex", "   "));
        assert!(facts.get("sex").is_none());
        assert!(facts.insert("sex", "male"));
        assert_eq!(facts.get("sex"), Some("male"));
    }

    #[test]
    fn fallbacks_are_present_but_not_available() {
        let mut facts = ResolvedFactSet::default();
        facts.insert_fallback("outcome", "not available");
        assert_eq!(facts.get("outcome"), Some("not available"));
        assert!(facts.is_fallback("outcome"));
        assert!(!facts.is_available("outcome"));

        facts.insert("outcome", "recovered/resolved");
        assert!(facts.is_available("outcome"));
        assert!(!facts.is_fallback("outcome"));
    }

    #[test]
    fn listing_is_sorted_with_study_days() {
        let mut facts = ResolvedFactSet::default();
        facts.insert("sex", "male");
        facts.insert("onset_date", "22-Jan-2024");
        facts.set_study_day("onset_date", 34);
        assert_eq!(
            facts.listing(),
            "- onset_date: 22-Jan-2024\n- onset_date (study day): 34\n- sex: male"
        );
        assert_eq!(facts.len(), 2);
    }
}
