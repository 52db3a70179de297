//! Shared fixtures: one liver-event subject with dosing history and labs.
#![allow(dead_code)]

use chrono::NaiveDate;
use sae_narrative::core::mapping::FieldMappings;
use sae_narrative::core::pipeline::{NarrativeAssembler, NarrativeAssemblerBuilder};
use sae_narrative::core::template::TemplateSet;
use sae_narrative::schema::event::{AdverseEvent, SeriousnessCriteria};
use sae_narrative::schema::exposure::TreatmentExposure;
use sae_narrative::schema::measurement::Measurement;
use sae_narrative::schema::subject::{Subject, SubjectId};
use sae_narrative::store::{DataSource, MemoryStore, SqliteStore};
use std::path::Path;
use std::sync::Arc;

pub const SUBJECT: &str = "C-906289-002-0422-001";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn subject() -> Subject {
    Subject {
        subject_id: SubjectId::new(SUBJECT),
        study_id: Some("C-906289".to_string()),
        site_id: Some("002".to_string()),
        age: Some(58),
        age_unit: Some("YEARS".to_string()),
        sex: Some("M".to_string()),
        race: Some("WHITE".to_string()),
        ethnicity: Some("NOT HISPANIC OR LATINO".to_string()),
    }
}

pub fn exposure() -> TreatmentExposure {
    TreatmentExposure {
        subject_id: SubjectId::new(SUBJECT),
        treatment: Some("Drug X 10 mg".to_string()),
        first_dose_date: Some(date(2024, 1, 10)),
        last_dose_date: Some(date(2024, 3, 20)),
        dose_dates: vec![
            date(2024, 1, 24),
            date(2024, 2, 7),
            date(2024, 2, 21),
            date(2024, 3, 6),
        ],
    }
}

/// Sequence 15: a medically important liver event with a dechallenge.
pub fn liver_event() -> AdverseEvent {
    AdverseEvent {
        subject_id: SubjectId::new(SUBJECT),
        sequence: 15,
        verbatim_term: Some("AST elevated".to_string()),
        preferred_term: Some("Aspartate aminotransferase increased".to_string()),
        system_organ_class: Some("Investigations".to_string()),
        severity_grade: Some(3),
        onset_date: Some(date(2024, 3, 12)),
        resolution_date: Some(date(2024, 4, 2)),
        recorded_onset_day: Some(63),
        recorded_resolution_day: None,
        outcome: Some("RECOVERED/RESOLVED".to_string()),
        action_taken: Some("DRUG INTERRUPTED".to_string()),
        causality: Some("RELATED".to_string()),
        seriousness: SeriousnessCriteria {
            serious: true,
            medically_important: true,
            ..Default::default()
        },
        treatment_emergent: true,
    }
}

/// Sequence 16: hospitalized pneumonia that was also fatal, no end date.
pub fn hospitalized_event() -> AdverseEvent {
    AdverseEvent {
        sequence: 16,
        verbatim_term: Some("Pneumonia".to_string()),
        preferred_term: Some("Pneumonia".to_string()),
        system_organ_class: Some("Infections and infestations".to_string()),
        onset_date: Some(date(2024, 3, 25)),
        resolution_date: None,
        recorded_onset_day: None,
        outcome: Some("FATAL".to_string()),
        action_taken: Some("DOSE NOT CHANGED".to_string()),
        causality: Some("NOT RELATED".to_string()),
        seriousness: SeriousnessCriteria {
            serious: true,
            hospitalization: true,
            results_in_death: true,
            ..Default::default()
        },
        ..liver_event()
    }
}

/// Sequence 17: treatment-emergent but not serious.
pub fn non_serious_event() -> AdverseEvent {
    AdverseEvent {
        sequence: 17,
        verbatim_term: Some("Headache".to_string()),
        preferred_term: Some("Headache".to_string()),
        system_organ_class: Some("Nervous system disorders".to_string()),
        severity_grade: Some(1),
        seriousness: SeriousnessCriteria::default(),
        action_taken: Some("DOSE NOT CHANGED".to_string()),
        ..liver_event()
    }
}

pub fn measurements() -> Vec<Measurement> {
    let lab = |code: &str, value: f64, unit: &str, uln: Option<f64>, on: NaiveDate, baseline: bool| {
        Measurement {
            test_code: code.to_string(),
            value,
            unit: unit.to_string(),
            upper_limit_normal: uln,
            collected_on: on,
            baseline,
        }
    };
    vec![
        lab("AST", 28.0, "U/L", Some(34.0), date(2024, 1, 8), true),
        lab("AST", 170.0, "U/L", Some(34.0), date(2024, 3, 16), false),
        lab("AST", 95.0, "U/L", Some(34.0), date(2024, 3, 27), false),
        lab("WBC", 14.2, "10^9/L", None, date(2024, 3, 25), false),
        lab("ANC", 11.8, "10^9/L", None, date(2024, 3, 25), false),
    ]
}

pub fn memory_store() -> MemoryStore {
    let id = SubjectId::new(SUBJECT);
    measurements().into_iter().fold(
        MemoryStore::new()
            .with_subject(subject())
            .with_exposure(exposure())
            .with_event(liver_event())
            .with_event(hospitalized_event())
            .with_event(non_serious_event()),
        |store, m| store.with_measurement(&id, m),
    )
}

pub fn sqlite_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    let id = SubjectId::new(SUBJECT);
    store.insert_subject(&subject()).unwrap();
    store.insert_exposure(&exposure()).unwrap();
    for event in [liver_event(), hospitalized_event(), non_serious_event()] {
        store.insert_event(&event).unwrap();
    }
    for m in measurements() {
        store.insert_measurement(&id, &m).unwrap();
    }
    store
}

pub fn shipped_templates() -> TemplateSet {
    TemplateSet::load_from_ron(Path::new("config/templates.ron")).unwrap()
}

pub fn shipped_mappings() -> FieldMappings {
    FieldMappings::load_from_ron(Path::new("config/field_mappings.ron")).unwrap()
}

/// Builder preloaded with the shipped templates, mappings, and guide.
pub fn builder(source: Arc<dyn DataSource>) -> NarrativeAssemblerBuilder {
    NarrativeAssembler::builder()
        .data_source(source)
        .templates("config/templates.ron")
        .field_mappings("config/field_mappings.ron")
        .guide("config/narrative_guide.txt")
}

pub fn assembler(source: Arc<dyn DataSource>) -> NarrativeAssembler {
    builder(source).build().unwrap()
}
