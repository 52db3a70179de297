use serde::{Deserialize, Serialize};
use std::fmt;

/// Newtype wrapper for unique subject identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Demographic reference data for one subject. Immutable for the duration
/// of a study; values are kept exactly as recorded (codes, casing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: SubjectId,
    pub study_id: Option<String>,
    pub site_id: Option<String>,
    pub age: Option<u32>,
    pub age_unit: Option<String>,
    pub sex: Option<String>,
    pub race: Option<String>,
    pub ethnicity: Option<String>,
}

impl Subject {
    /// A subject with only its identifier populated.
    pub fn new(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            study_id: None,
            site_id: None,
            age: None,
            age_unit: None,
            sex: None,
            race: None,
            ethnicity: None,
        }
    }
}
