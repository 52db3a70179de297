use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::subject::SubjectId;

/// Composite key of an adverse event. Sequence numbers order events
/// within one subject and are not unique across subjects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub subject_id: SubjectId,
    pub sequence: u32,
}

impl EventKey {
    pub fn new(subject_id: impl Into<String>, sequence: u32) -> Self {
        Self {
            subject_id: SubjectId::new(subject_id),
            sequence,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq {}", self.subject_id, self.sequence)
    }
}

/// Seriousness criteria, each recorded independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriousnessCriteria {
    pub serious: bool,
    pub hospitalization: bool,
    pub life_threatening: bool,
    pub results_in_death: bool,
    pub disability: bool,
    pub medically_important: bool,
}

impl SeriousnessCriteria {
    /// Returns true if any individual criterion (not the overall flag) is set.
    pub fn any_criterion(&self) -> bool {
        self.hospitalization
            || self.life_threatening
            || self.results_in_death
            || self.disability
            || self.medically_important
    }
}

/// Parse a Y/N style flag. Anything other than an explicit yes is false.
pub fn parse_flag(raw: Option<&str>) -> bool {
    match raw.map(|s| s.trim().to_ascii_uppercase()) {
        Some(value) => matches!(value.as_str(), "Y" | "YES" | "TRUE" | "1"),
        None => false,
    }
}

/// One adverse event record as held by the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdverseEvent {
    pub subject_id: SubjectId,
    pub sequence: u32,
    pub verbatim_term: Option<String>,
    pub preferred_term: Option<String>,
    pub system_organ_class: Option<String>,
    pub severity_grade: Option<u8>,
    pub onset_date: Option<NaiveDate>,
    pub resolution_date: Option<NaiveDate>,
    /// Study day of onset as recorded upstream. The engine recomputes it.
    pub recorded_onset_day: Option<i64>,
    pub recorded_resolution_day: Option<i64>,
    pub outcome: Option<String>,
    pub action_taken: Option<String>,
    pub causality: Option<String>,
    pub seriousness: SeriousnessCriteria,
    pub treatment_emergent: bool,
}

impl AdverseEvent {
    /// An event with only its key populated.
    pub fn new(subject_id: SubjectId, sequence: u32) -> Self {
        Self {
            subject_id,
            sequence,
            verbatim_term: None,
            preferred_term: None,
            system_organ_class: None,
            severity_grade: None,
            onset_date: None,
            resolution_date: None,
            recorded_onset_day: None,
            recorded_resolution_day: None,
            outcome: None,
            action_taken: None,
            causality: None,
            seriousness: SeriousnessCriteria::default(),
            treatment_emergent: false,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            subject_id: self.subject_id.clone(),
            sequence: self.sequence,
        }
    }
}

/// Action-taken values that withdraw or reduce study drug after the event.
const DECHALLENGE_ACTIONS: &[&str] = &["DRUG WITHDRAWN", "DRUG INTERRUPTED", "DOSE REDUCED"];

/// Returns true if the recorded action removed or reduced study drug.
pub fn is_dechallenge(action_taken: Option<&str>) -> bool {
    action_taken
        .map(|action| {
            let action = action.trim();
            DECHALLENGE_ACTIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(action))
        })
        .unwrap_or(false)
}
