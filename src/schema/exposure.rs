use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::subject::SubjectId;

/// Study treatment exposure for one subject. One active exposure per
/// subject; cross-over designs are not represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentExposure {
    pub subject_id: SubjectId,
    pub treatment: Option<String>,
    pub first_dose_date: Option<NaiveDate>,
    pub last_dose_date: Option<NaiveDate>,
    /// Individual administrations, when the store records them.
    #[serde(default)]
    pub dose_dates: Vec<NaiveDate>,
}

/// Where the most recent dose sits relative to event onset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DosingReference {
    /// Latest known dose on or before onset.
    PriorDose(NaiveDate),
    /// Every known dose falls after onset.
    OnsetBeforeFirstDose,
    /// No dose dates or no onset date to compare against.
    #[default]
    Unknown,
}

impl DosingReference {
    pub fn prior_dose(&self) -> Option<NaiveDate> {
        match self {
            Self::PriorDose(date) => Some(*date),
            _ => None,
        }
    }
}

impl TreatmentExposure {
    pub fn new(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            treatment: None,
            first_dose_date: None,
            last_dose_date: None,
            dose_dates: Vec::new(),
        }
    }

    /// Every known administration date, ascending and de-duplicated.
    pub fn known_dose_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .first_dose_date
            .into_iter()
            .chain(self.dose_dates.iter().copied())
            .chain(self.last_dose_date)
            .collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    }

    /// Latest dose date on or before `onset`.
    pub fn most_recent_dose_before(&self, onset: NaiveDate) -> DosingReference {
        let dates = self.known_dose_dates();
        if dates.is_empty() {
            return DosingReference::Unknown;
        }
        match dates.into_iter().filter(|date| *date <= onset).max() {
            Some(date) => DosingReference::PriorDose(date),
            None => DosingReference::OnsetBeforeFirstDose,
        }
    }
}
