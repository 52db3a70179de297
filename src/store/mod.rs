/// Data store collaborators: the read-only record source the resolver reads
/// from, and the sink generated narratives are persisted to.
pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::schema::event::{AdverseEvent, EventKey};
use crate::schema::exposure::TreatmentExposure;
use crate::schema::measurement::Measurement;
use crate::schema::narrative::Narrative;
use crate::schema::subject::{Subject, SubjectId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("unparseable date in {column}: '{value}'")]
    InvalidDate { column: &'static str, value: String },
    #[error("corrupt stored value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Which events a bulk run narrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventScope {
    /// Overall serious flag and treatment-emergent flag both set.
    #[default]
    SeriousTreatmentEmergent,
    /// Every treatment-emergent event, serious or not.
    TreatmentEmergent,
}

impl EventScope {
    pub fn includes(&self, event: &AdverseEvent) -> bool {
        match self {
            Self::SeriousTreatmentEmergent => {
                event.seriousness.serious && event.treatment_emergent
            }
            Self::TreatmentEmergent => event.treatment_emergent,
        }
    }
}

/// Read access to subject, exposure, event, and lab records. Implementations
/// must be safe to share across batch workers.
pub trait DataSource: Send + Sync {
    fn subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError>;

    fn exposure(&self, id: &SubjectId) -> Result<Option<TreatmentExposure>, StoreError>;

    fn event(&self, key: &EventKey) -> Result<Option<AdverseEvent>, StoreError>;

    /// Lab and vital-sign values for a subject. Empty when none are held.
    fn measurements(&self, id: &SubjectId) -> Result<Vec<Measurement>, StoreError>;

    /// Keys of events in `scope`, ordered by subject then sequence.
    fn event_keys(&self, scope: EventScope) -> Result<Vec<EventKey>, StoreError>;
}

/// Persistence for generated narratives. Each save is one atomic upsert
/// keyed by (subject, sequence); a later save replaces the earlier record.
pub trait NarrativeSink: Send + Sync {
    fn save(&self, narrative: &Narrative) -> Result<(), StoreError>;
}
