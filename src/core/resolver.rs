/// Field resolution: store records → flat, display-ready fact set.
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::dates::{study_day, whole_years_between};
use crate::core::facts::{ClinicalContext, ResolvedFactSet};
use crate::core::mapping::{
    Fallback, FieldMapping, FieldMappings, RawValue, SourceField, TransformError,
};
use crate::schema::event::{is_dechallenge, AdverseEvent, EventKey};
use crate::schema::exposure::{DosingReference, TreatmentExposure};
use crate::schema::subject::{Subject, SubjectId};
use crate::store::{DataSource, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("subject not found: {0}")]
    SubjectNotFound(SubjectId),
    #[error("adverse event not found: {0}")]
    EventNotFound(EventKey),
    #[error("required field '{field}' has no value and no fallback")]
    IncompleteData { field: String },
    #[error("field '{field}' has no display mapping for raw value '{value}'")]
    UnmappedValue { field: String, value: String },
    #[error("field '{field}' holds an unparseable date '{value}'")]
    InvalidDate { field: String, value: String },
    #[error("field '{field}' holds placeholder delimiters in '{value}'")]
    DelimiterInValue { field: String, value: String },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidDate { column, value } => Self::InvalidDate {
                field: column.to_string(),
                value,
            },
            other => Self::Store(other),
        }
    }
}

impl From<TransformError> for ResolveError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Unmapped { field, value } => Self::UnmappedValue { field, value },
            TransformError::InvalidDate { field, value } => Self::InvalidDate { field, value },
        }
    }
}

/// Records read for one event, borrowed while each mapping is resolved.
struct SourceRecords<'a> {
    subject: &'a Subject,
    exposure: Option<&'a TreatmentExposure>,
    event: &'a AdverseEvent,
    dosing: DosingReference,
}

impl SourceRecords<'_> {
    fn raw(&self, source: SourceField) -> Option<RawValue> {
        let text = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| RawValue::Text(s.to_string()))
        };
        let first_dose = self.exposure.and_then(|e| e.first_dose_date);
        match source {
            SourceField::SubjectId => Some(RawValue::Text(self.subject.subject_id.to_string())),
            SourceField::StudyId => text(&self.subject.study_id),
            SourceField::SiteId => text(&self.subject.site_id),
            SourceField::Age => self.subject.age.map(|age| RawValue::Int(age.into())),
            SourceField::AgeAtOnset => {
                let age = self.subject.age?;
                let elapsed = match (first_dose, self.event.onset_date) {
                    (Some(first), Some(onset)) => whole_years_between(first, onset),
                    _ => 0,
                };
                Some(RawValue::Int(i64::from(age) + i64::from(elapsed)))
            }
            SourceField::AgeUnit => text(&self.subject.age_unit),
            SourceField::Sex => text(&self.subject.sex),
            SourceField::Race => text(&self.subject.race),
            SourceField::Ethnicity => text(&self.subject.ethnicity),
            SourceField::Treatment => self.exposure.and_then(|e| text(&e.treatment)),
            SourceField::FirstDoseDate => first_dose.map(RawValue::Date),
            SourceField::LastDoseDate => self
                .exposure
                .and_then(|e| e.last_dose_date)
                .map(RawValue::Date),
            SourceField::MostRecentDoseDate => self.dosing.prior_dose().map(RawValue::Date),
            SourceField::VerbatimTerm => text(&self.event.verbatim_term),
            SourceField::PreferredTerm => text(&self.event.preferred_term),
            SourceField::SystemOrganClass => text(&self.event.system_organ_class),
            SourceField::SeverityGrade => self
                .event
                .severity_grade
                .map(|grade| RawValue::Int(grade.into())),
            SourceField::OnsetDate => self.event.onset_date.map(RawValue::Date),
            SourceField::ResolutionDate => self.event.resolution_date.map(RawValue::Date),
            SourceField::Outcome => text(&self.event.outcome),
            SourceField::ActionTaken => text(&self.event.action_taken),
            SourceField::Causality => text(&self.event.causality),
        }
    }

    /// Study day as recorded upstream, for cross-checking.
    fn recorded_study_day(&self, source: SourceField) -> Option<i64> {
        match source {
            SourceField::OnsetDate => self.event.recorded_onset_day,
            SourceField::ResolutionDate => self.event.recorded_resolution_day,
            _ => None,
        }
    }
}

/// Resolves an event's mapped fields against a data source.
pub struct FieldResolver {
    source: Arc<dyn DataSource>,
    mappings: FieldMappings,
}

impl FieldResolver {
    pub fn new(source: Arc<dyn DataSource>, mappings: FieldMappings) -> Self {
        Self { source, mappings }
    }

    /// Gather the subject, exposure, and event records for `key` and apply
    /// every configured field mapping.
    pub fn resolve(&self, key: &EventKey) -> Result<ResolvedFactSet, ResolveError> {
        let subject = self
            .source
            .subject(&key.subject_id)?
            .ok_or_else(|| ResolveError::SubjectNotFound(key.subject_id.clone()))?;
        let event = self
            .source
            .event(key)?
            .ok_or_else(|| ResolveError::EventNotFound(key.clone()))?;
        let exposure = self.source.exposure(&key.subject_id)?;
        let measurements = self.source.measurements(&key.subject_id)?;

        let dosing = match (&exposure, event.onset_date) {
            (Some(exposure), Some(onset)) => exposure.most_recent_dose_before(onset),
            _ => DosingReference::Unknown,
        };

        let context = ClinicalContext {
            seriousness: event.seriousness,
            treatment_emergent: event.treatment_emergent,
            preferred_term: event.preferred_term.clone(),
            verbatim_term: event.verbatim_term.clone(),
            system_organ_class: event.system_organ_class.clone(),
            onset_date: event.onset_date,
            dosing,
            dechallenged: is_dechallenge(event.action_taken.as_deref()),
            measurements,
        };

        let records = SourceRecords {
            subject: &subject,
            exposure: exposure.as_ref(),
            event: &event,
            dosing,
        };
        let mut facts = ResolvedFactSet::new(context);
        for mapping in &self.mappings.fields {
            self.resolve_field(mapping, &records, &mut facts)?;
        }
        debug!(event = %key, facts = facts.len(), "resolved fact set");
        Ok(facts)
    }

    fn resolve_field(
        &self,
        mapping: &FieldMapping,
        records: &SourceRecords<'_>,
        facts: &mut ResolvedFactSet,
    ) -> Result<(), ResolveError> {
        let raw = records.raw(mapping.source);
        if let Some(raw) = &raw {
            let display = mapping.transform.apply(&mapping.name, raw)?;
            if display.contains(['{', '}']) {
                return Err(ResolveError::DelimiterInValue {
                    field: mapping.name.clone(),
                    value: display,
                });
            }
            if facts.insert(mapping.name.as_str(), display) {
                if mapping.study_day {
                    let day = self.study_day_for(mapping, raw, records)?;
                    facts.set_study_day(mapping.name.as_str(), day);
                }
                debug!(field = %mapping.name, source = ?mapping.source, "mapped field");
                return Ok(());
            }
        }

        match &mapping.fallback {
            Fallback::Abort => Err(ResolveError::IncompleteData {
                field: mapping.name.clone(),
            }),
            Fallback::Literal(text) => {
                warn!(field = %mapping.name, fallback = %text, "field missing, using fallback text");
                facts.insert_fallback(mapping.name.as_str(), text.as_str());
                Ok(())
            }
            Fallback::Omit => {
                debug!(field = %mapping.name, "field missing, omitted");
                Ok(())
            }
        }
    }

    fn study_day_for(
        &self,
        mapping: &FieldMapping,
        raw: &RawValue,
        records: &SourceRecords<'_>,
    ) -> Result<i64, ResolveError> {
        let first_dose = records
            .exposure
            .and_then(|e| e.first_dose_date)
            .ok_or_else(|| ResolveError::IncompleteData {
                field: "first_dose_date".to_string(),
            })?;
        let date = raw.as_date().ok_or_else(|| ResolveError::InvalidDate {
            field: mapping.name.clone(),
            value: format!("{raw:?}"),
        })?;
        let day = study_day(date, first_dose);
        if let Some(recorded) = records.recorded_study_day(mapping.source) {
            if recorded != day {
                warn!(
                    field = %mapping.name,
                    recorded,
                    computed = day,
                    "recorded study day disagrees with computed study day"
                );
            }
        }
        Ok(day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapping::Transform;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn field(name: &str, source: SourceField, transform: Transform, fallback: Fallback) -> FieldMapping {
        FieldMapping {
            name: name.to_string(),
            source,
            transform,
            study_day: false,
            fallback,
        }
    }

    fn mappings() -> FieldMappings {
        let mut onset = field("onset_date", SourceField::OnsetDate, Transform::Date, Fallback::Abort);
        onset.study_day = true;
        let mut recent = field(
            "most_recent_dose_date",
            SourceField::MostRecentDoseDate,
            Transform::Date,
            Fallback::Omit,
        );
        recent.study_day = true;
        FieldMappings {
            fields: vec![
                field("subject_id", SourceField::SubjectId, Transform::Verbatim, Fallback::Abort),
                field("age", SourceField::AgeAtOnset, Transform::Verbatim, Fallback::Abort),
                field(
                    "sex",
                    SourceField::Sex,
                    Transform::ValueMap {
                        entries: BTreeMap::from([
                            ("M".to_string(), "male".to_string()),
                            ("F".to_string(), "female".to_string()),
                        ]),
                        default: None,
                    },
                    Fallback::Abort,
                ),
                field(
                    "outcome",
                    SourceField::Outcome,
                    Transform::Lowercase,
                    Fallback::Literal("not available".to_string()),
                ),
                field(
                    "resolution_date",
                    SourceField::ResolutionDate,
                    Transform::Date,
                    Fallback::Omit,
                ),
                onset,
                recent,
            ],
        }
    }

    fn store(sex: &str) -> MemoryStore {
        let id = SubjectId::new("S-1");
        let mut subject = Subject::new(id.clone());
        subject.age = Some(59);
        subject.sex = Some(sex.to_string());

        let mut exposure = TreatmentExposure::new(id.clone());
        exposure.first_dose_date = Some(date(2023, 12, 20));
        exposure.dose_dates = vec![date(2024, 1, 3), date(2024, 1, 17)];

        let mut event = AdverseEvent::new(id, 15);
        event.onset_date = Some(date(2024, 1, 22));
        event.recorded_onset_day = Some(34);
        event.action_taken = Some("DRUG WITHDRAWN".to_string());
        event.treatment_emergent = true;

        MemoryStore::new()
            .with_subject(subject)
            .with_exposure(exposure)
            .with_event(event)
    }

    fn resolver(store: MemoryStore) -> FieldResolver {
        FieldResolver::new(Arc::new(store), mappings())
    }

    #[test]
    fn resolves_display_values() {
        let facts = resolver(store("M")).resolve(&EventKey::new("S-1", 15)).unwrap();
        assert_eq!(facts.get("subject_id"), Some("S-1"));
        assert_eq!(facts.get("sex"), Some("male"));
        assert_eq!(facts.get("age"), Some("59"));
        assert_eq!(facts.get("onset_date"), Some("22-Jan-2024"));
        assert_eq!(facts.study_day("onset_date"), Some(34));
        assert_eq!(facts.get("most_recent_dose_date"), Some("17-Jan-2024"));
        assert_eq!(facts.study_day("most_recent_dose_date"), Some(29));
        assert!(facts.context.dechallenged);
    }

    #[test]
    fn fallbacks_and_omissions() {
        let facts = resolver(store("F")).resolve(&EventKey::new("S-1", 15)).unwrap();
        assert_eq!(facts.get("outcome"), Some("not available"));
        assert!(facts.is_fallback("outcome"));
        assert!(facts.get("resolution_date").is_none());
    }

    #[test]
    fn unmapped_code_fails_loudly() {
        let err = resolver(store("U")).resolve(&EventKey::new("S-1", 15)).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UnmappedValue { ref field, ref value } if field == "sex" && value == "U"
        ));
    }

    #[test]
    fn missing_subject_or_event_is_not_found() {
        let r = resolver(store("M"));
        assert!(matches!(
            r.resolve(&EventKey::new("S-2", 15)),
            Err(ResolveError::SubjectNotFound(_))
        ));
        assert!(matches!(
            r.resolve(&EventKey::new("S-1", 16)),
            Err(ResolveError::EventNotFound(_))
        ));
    }

    #[test]
    fn abort_fallback_names_the_field() {
        let id = SubjectId::new("S-1");
        let mut subject = Subject::new(id.clone());
        subject.sex = Some("M".to_string());
        let mut event = AdverseEvent::new(id, 1);
        event.onset_date = Some(date(2024, 1, 22));
        let store = MemoryStore::new().with_subject(subject).with_event(event);

        let err = resolver(store).resolve(&EventKey::new("S-1", 1)).unwrap_err();
        assert!(matches!(err, ResolveError::IncompleteData { ref field } if field == "age"));
    }

    #[test]
    fn study_day_needs_first_dose() {
        let id = SubjectId::new("S-1");
        let mut subject = Subject::new(id.clone());
        subject.age = Some(40);
        subject.sex = Some("M".to_string());
        let mut event = AdverseEvent::new(id, 1);
        event.onset_date = Some(date(2024, 1, 22));
        let store = MemoryStore::new().with_subject(subject).with_event(event);

        let err = resolver(store).resolve(&EventKey::new("S-1", 1)).unwrap_err();
        assert!(
            matches!(err, ResolveError::IncompleteData { ref field } if field == "first_dose_date")
        );
    }

    #[test]
    fn age_at_onset_adds_elapsed_years() {
        let id = SubjectId::new("S-1");
        let mut subject = Subject::new(id.clone());
        subject.age = Some(59);
        subject.sex = Some("M".to_string());
        let mut exposure = TreatmentExposure::new(id.clone());
        exposure.first_dose_date = Some(date(2022, 1, 10));
        let mut event = AdverseEvent::new(id, 2);
        event.onset_date = Some(date(2024, 3, 1));
        let store = MemoryStore::new()
            .with_subject(subject)
            .with_exposure(exposure)
            .with_event(event);

        let facts = resolver(store).resolve(&EventKey::new("S-1", 2)).unwrap();
        assert_eq!(facts.get("age"), Some("61"));
        assert_eq!(facts.context.dosing, DosingReference::PriorDose(date(2022, 1, 10)));
    }

    #[test]
    fn braces_in_source_values_are_rejected() {
        let mut event = AdverseEvent::new(SubjectId::new("S-1"), 16);
        event.onset_date = Some(date(2024, 1, 22));
        event.outcome = Some("RECOVERED {LEFT ARM}".to_string());

        let err = resolver(store("M").with_event(event)).resolve(&EventKey::new("S-1", 16)).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::DelimiterInValue { ref field, ref value }
                if field == "outcome" && value == "recovered {left arm}"
        ));
    }

    #[test]
    fn store_date_errors_become_invalid_date() {
        let err: ResolveError = StoreError::InvalidDate {
            column: "onset_date",
            value: "UNK".to_string(),
        }
        .into();
        assert!(matches!(err, ResolveError::InvalidDate { ref field, .. } if field == "onset_date"));
    }
}
