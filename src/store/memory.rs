use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{DataSource, EventScope, NarrativeSink, StoreError};
use crate::schema::event::{AdverseEvent, EventKey};
use crate::schema::exposure::TreatmentExposure;
use crate::schema::measurement::Measurement;
use crate::schema::narrative::Narrative;
use crate::schema::subject::{Subject, SubjectId};

/// In-process store implementing both collaborator traits. Used by tests
/// and by callers that already hold records in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    subjects: FxHashMap<SubjectId, Subject>,
    exposures: FxHashMap<SubjectId, TreatmentExposure>,
    events: BTreeMap<EventKey, AdverseEvent>,
    measurements: FxHashMap<SubjectId, Vec<Measurement>>,
    narratives: RwLock<BTreeMap<EventKey, Narrative>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subjects.insert(subject.subject_id.clone(), subject);
        self
    }

    pub fn with_exposure(mut self, exposure: TreatmentExposure) -> Self {
        self.exposures.insert(exposure.subject_id.clone(), exposure);
        self
    }

    pub fn with_event(mut self, event: AdverseEvent) -> Self {
        self.events.insert(event.key(), event);
        self
    }

    pub fn with_measurement(mut self, subject_id: &SubjectId, measurement: Measurement) -> Self {
        self.measurements
            .entry(subject_id.clone())
            .or_default()
            .push(measurement);
        self
    }

    /// The stored narrative for `key`, if one has been saved.
    pub fn narrative(&self, key: &EventKey) -> Result<Option<Narrative>, StoreError> {
        let narratives = self.narratives.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(narratives.get(key).cloned())
    }

    pub fn narrative_count(&self) -> Result<usize, StoreError> {
        let narratives = self.narratives.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(narratives.len())
    }
}

impl DataSource for MemoryStore {
    fn subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        Ok(self.subjects.get(id).cloned())
    }

    fn exposure(&self, id: &SubjectId) -> Result<Option<TreatmentExposure>, StoreError> {
        Ok(self.exposures.get(id).cloned())
    }

    fn event(&self, key: &EventKey) -> Result<Option<AdverseEvent>, StoreError> {
        Ok(self.events.get(key).cloned())
    }

    fn measurements(&self, id: &SubjectId) -> Result<Vec<Measurement>, StoreError> {
        Ok(self.measurements.get(id).cloned().unwrap_or_default())
    }

    fn event_keys(&self, scope: EventScope) -> Result<Vec<EventKey>, StoreError> {
        Ok(self
            .events
            .values()
            .filter(|event| scope.includes(event))
            .map(AdverseEvent::key)
            .collect())
    }
}

impl NarrativeSink for MemoryStore {
    fn save(&self, narrative: &Narrative) -> Result<(), StoreError> {
        let mut narratives = self.narratives.write().map_err(|_| StoreError::LockPoisoned)?;
        narratives.insert(narrative.key.clone(), narrative.clone());
        Ok(())
    }
}
