use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::event::EventKey;

/// The narrative template variants this engine narrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    SaeHospitalization,
    SaeMedicallyImportant,
}

impl TemplateId {
    pub const ALL: [TemplateId; 2] = [Self::SaeHospitalization, Self::SaeMedicallyImportant];

    /// Key used in template files and persisted records.
    pub fn key(&self) -> &'static str {
        match self {
            Self::SaeHospitalization => "sae_hospitalization",
            Self::SaeMedicallyImportant => "sae_medically_important",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.key() == key)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether the optional refinement step touched the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStatus {
    /// No refiner configured; the baseline is final.
    NotRequested,
    /// The refiner returned accepted text.
    Applied,
    /// The refiner was attempted but the baseline was kept.
    FellBack,
}

impl RefinementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequested => "not_requested",
            Self::Applied => "applied",
            Self::FellBack => "fell_back",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "not_requested" => Some(Self::NotRequested),
            "applied" => Some(Self::Applied),
            "fell_back" => Some(Self::FellBack),
            _ => None,
        }
    }

    pub fn attempted(&self) -> bool {
        !matches!(self, Self::NotRequested)
    }
}

/// A generated narrative and the facts it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub key: EventKey,
    pub template: TemplateId,
    pub text: String,
    pub generated_at: DateTime<Utc>,
    pub refinement: RefinementStatus,
    /// Placeholder name → value for every fact the template consumed.
    pub facts_used: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_keys_round_trip() {
        for id in TemplateId::ALL {
            assert_eq!(TemplateId::from_key(id.key()), Some(id));
        }
        assert_eq!(TemplateId::from_key("ae_non_serious"), None);
    }

    #[test]
    fn refinement_status_strings() {
        for status in [
            RefinementStatus::NotRequested,
            RefinementStatus::Applied,
            RefinementStatus::FellBack,
        ] {
            assert_eq!(RefinementStatus::from_str_opt(status.as_str()), Some(status));
        }
        assert!(!RefinementStatus::NotRequested.attempted());
        assert!(RefinementStatus::FellBack.attempted());
    }

    #[test]
    fn template_id_serializes_snake_case() {
        let json = serde_json::to_string(&TemplateId::SaeMedicallyImportant).unwrap();
        assert_eq!(json, "\"sae_medically_important\"");
    }
}
