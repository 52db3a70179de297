/// Field mapping configuration: which source value feeds each placeholder,
/// how it is transformed for display, and what happens when it is missing.
use chrono::NaiveDate;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::core::dates::{format_date, parse_date};
use crate::core::rules::casing::title_case;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("duplicate field mapping '{0}'")]
    DuplicateField(String),
    #[error("field '{field}' maps {mapped:?}, which cannot carry a study day")]
    StudyDayNotAllowed { field: String, mapped: SourceField },
    #[error("field '{field}' maps date source {mapped:?} without the Date transform")]
    DateSourceNeedsDateTransform { field: String, mapped: SourceField },
    #[error("field '{field}' applies the Date transform to non-date source {mapped:?}")]
    DateTransformOnNonDate { field: String, mapped: SourceField },
    #[error("field '{0}' has a blank literal fallback")]
    BlankFallback(String),
    #[error("field '{0}' has an empty value map")]
    EmptyValueMap(String),
}

/// Failure to turn a raw value into display text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("field '{field}' has no display mapping for raw value '{value}'")]
    Unmapped { field: String, value: String },
    #[error("field '{field}' holds an unparseable date '{value}'")]
    InvalidDate { field: String, value: String },
}

/// Where a mapped field reads its raw value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceField {
    SubjectId,
    StudyId,
    SiteId,
    Age,
    /// Recorded age plus whole years from first dose to onset.
    AgeAtOnset,
    AgeUnit,
    Sex,
    Race,
    Ethnicity,
    Treatment,
    FirstDoseDate,
    LastDoseDate,
    /// Latest dose on or before onset, computed from dose dates.
    MostRecentDoseDate,
    VerbatimTerm,
    PreferredTerm,
    SystemOrganClass,
    SeverityGrade,
    OnsetDate,
    ResolutionDate,
    Outcome,
    ActionTaken,
    Causality,
}

impl SourceField {
    pub fn is_date(&self) -> bool {
        matches!(
            self,
            Self::FirstDoseDate
                | Self::LastDoseDate
                | Self::MostRecentDoseDate
                | Self::OnsetDate
                | Self::ResolutionDate
        )
    }

    /// Study days are only ever placed next to onset, resolution, and
    /// dosing dates.
    pub fn allows_study_day(&self) -> bool {
        self.is_date()
    }
}

/// A raw value as read from the store, before display transforms.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Int(i64),
    Date(NaiveDate),
}

impl RawValue {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(date) => Some(*date),
            _ => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Int(n) => n.to_string(),
            Self::Date(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Raw → display transform applied to a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    #[default]
    Verbatim,
    Lowercase,
    TitleCase,
    /// Table lookup, matched case-insensitively. Without a `default`, an
    /// unlisted raw value is an error rather than leaking a raw code.
    ValueMap {
        entries: BTreeMap<String, String>,
        #[serde(default)]
        default: Option<String>,
    },
    Date,
}

impl Transform {
    pub fn apply(&self, field: &str, raw: &RawValue) -> Result<String, TransformError> {
        match self {
            Self::Verbatim => Ok(raw.as_text()),
            Self::Lowercase => Ok(raw.as_text().to_lowercase()),
            Self::TitleCase => Ok(title_case(&raw.as_text())),
            Self::ValueMap { entries, default } => {
                let text = raw.as_text();
                entries
                    .iter()
                    .find(|(key, _)| key.trim().eq_ignore_ascii_case(&text))
                    .map(|(_, display)| display.clone())
                    .or_else(|| default.clone())
                    .ok_or_else(|| TransformError::Unmapped {
                        field: field.to_string(),
                        value: text,
                    })
            }
            Self::Date => match raw {
                RawValue::Date(date) => Ok(format_date(*date)),
                other => {
                    let text = other.as_text();
                    parse_date(&text)
                        .map(format_date)
                        .ok_or_else(|| TransformError::InvalidDate {
                            field: field.to_string(),
                            value: text,
                        })
                }
            },
        }
    }
}

/// What to do when a field's source value is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fallback {
    /// Resolution fails with the field named.
    Abort,
    /// Substitute this literal text.
    Literal(String),
    /// Leave the fact out. Any template text that needs it fails to fill.
    Omit,
}

/// One placeholder's mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    pub source: SourceField,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub study_day: bool,
    pub fallback: Fallback,
}

/// The full, validated set of field mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMappings {
    pub fields: Vec<FieldMapping>,
}

impl FieldMappings {
    /// Load and validate mappings from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<FieldMappings, MappingError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse and validate mappings from a RON string.
    pub fn parse_ron(input: &str) -> Result<FieldMappings, MappingError> {
        let mappings: FieldMappings = ron::from_str(input)?;
        mappings.validate()?;
        Ok(mappings)
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        let mut seen = FxHashSet::default();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(MappingError::DuplicateField(field.name.clone()));
            }
            if field.study_day && !field.source.allows_study_day() {
                return Err(MappingError::StudyDayNotAllowed {
                    field: field.name.clone(),
                    mapped: field.source,
                });
            }
            let is_date_transform = matches!(field.transform, Transform::Date);
            if field.source.is_date() && !is_date_transform {
                return Err(MappingError::DateSourceNeedsDateTransform {
                    field: field.name.clone(),
                    mapped: field.source,
                });
            }
            if !field.source.is_date() && is_date_transform {
                return Err(MappingError::DateTransformOnNonDate {
                    field: field.name.clone(),
                    mapped: field.source,
                });
            }
            if let Fallback::Literal(text) = &field.fallback {
                if text.trim().is_empty() {
                    return Err(MappingError::BlankFallback(field.name.clone()));
                }
            }
            if let Transform::ValueMap { entries, .. } = &field.transform {
                if entries.is_empty() {
                    return Err(MappingError::EmptyValueMap(field.name.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}
