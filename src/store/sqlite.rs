use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{DataSource, EventScope, NarrativeSink, StoreError};
use crate::core::dates::parse_date;
use crate::schema::event::{parse_flag, AdverseEvent, EventKey, SeriousnessCriteria};
use crate::schema::exposure::TreatmentExposure;
use crate::schema::measurement::Measurement;
use crate::schema::narrative::{Narrative, RefinementStatus, TemplateId};
use crate::schema::subject::{Subject, SubjectId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subjects (
    subject_id TEXT PRIMARY KEY,
    study_id TEXT,
    site_id TEXT,
    age INTEGER,
    age_unit TEXT,
    sex TEXT,
    race TEXT,
    ethnicity TEXT
);
CREATE TABLE IF NOT EXISTS treatment_exposure (
    subject_id TEXT PRIMARY KEY REFERENCES subjects(subject_id),
    treatment TEXT,
    first_dose_date TEXT,
    last_dose_date TEXT
);
CREATE TABLE IF NOT EXISTS dose_administrations (
    subject_id TEXT NOT NULL REFERENCES subjects(subject_id),
    dose_date TEXT NOT NULL,
    PRIMARY KEY (subject_id, dose_date)
);
CREATE TABLE IF NOT EXISTS adverse_events (
    subject_id TEXT NOT NULL REFERENCES subjects(subject_id),
    sequence_number INTEGER NOT NULL,
    verbatim_term TEXT,
    preferred_term TEXT,
    system_organ_class TEXT,
    severity_grade INTEGER,
    onset_date TEXT,
    resolution_date TEXT,
    onset_study_day INTEGER,
    resolution_study_day INTEGER,
    outcome TEXT,
    action_taken TEXT,
    causality TEXT,
    serious TEXT,
    hospitalization TEXT,
    life_threatening TEXT,
    results_in_death TEXT,
    disability TEXT,
    medically_important TEXT,
    treatment_emergent TEXT,
    PRIMARY KEY (subject_id, sequence_number)
);
CREATE TABLE IF NOT EXISTS lab_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL REFERENCES subjects(subject_id),
    test_code TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    upper_limit_normal REAL,
    collected_on TEXT NOT NULL,
    baseline TEXT
);
CREATE TABLE IF NOT EXISTS narratives (
    subject_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    template_used TEXT NOT NULL,
    narrative_text TEXT NOT NULL,
    generation_date TEXT NOT NULL,
    refinement TEXT NOT NULL,
    facts_used TEXT NOT NULL,
    PRIMARY KEY (subject_id, sequence_number)
);
";

const EVENT_COLUMNS: &str = "subject_id, sequence_number, verbatim_term, preferred_term, \
    system_organ_class, severity_grade, onset_date, resolution_date, onset_study_day, \
    resolution_study_day, outcome, action_taken, causality, serious, hospitalization, \
    life_threatening, results_in_death, disability, medically_important, treatment_emergent";

/// SQLite-backed record source and narrative sink. The connection sits
/// behind a mutex so one store can serve every batch worker.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Open an in-memory database (for tests and demos).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn insert_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO subjects
             (subject_id, study_id, site_id, age, age_unit, sex, race, ethnicity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                subject.subject_id.as_str(),
                subject.study_id,
                subject.site_id,
                subject.age,
                subject.age_unit,
                subject.sex,
                subject.race,
                subject.ethnicity,
            ],
        )?;
        Ok(())
    }

    /// Store an exposure and its individual administrations in one
    /// transaction.
    pub fn insert_exposure(&self, exposure: &TreatmentExposure) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO treatment_exposure
             (subject_id, treatment, first_dose_date, last_dose_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                exposure.subject_id.as_str(),
                exposure.treatment,
                exposure.first_dose_date.map(iso),
                exposure.last_dose_date.map(iso),
            ],
        )?;
        tx.execute(
            "DELETE FROM dose_administrations WHERE subject_id = ?1",
            params![exposure.subject_id.as_str()],
        )?;
        for date in &exposure.dose_dates {
            tx.execute(
                "INSERT OR IGNORE INTO dose_administrations (subject_id, dose_date)
                 VALUES (?1, ?2)",
                params![exposure.subject_id.as_str(), iso(*date)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_event(&self, event: &AdverseEvent) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let flags = &event.seriousness;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO adverse_events ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                event.subject_id.as_str(),
                event.sequence,
                event.verbatim_term,
                event.preferred_term,
                event.system_organ_class,
                event.severity_grade,
                event.onset_date.map(iso),
                event.resolution_date.map(iso),
                event.recorded_onset_day,
                event.recorded_resolution_day,
                event.outcome,
                event.action_taken,
                event.causality,
                yn(flags.serious),
                yn(flags.hospitalization),
                yn(flags.life_threatening),
                yn(flags.results_in_death),
                yn(flags.disability),
                yn(flags.medically_important),
                yn(event.treatment_emergent),
            ],
        )?;
        Ok(())
    }

    pub fn insert_measurement(
        &self,
        subject_id: &SubjectId,
        measurement: &Measurement,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO lab_results
             (subject_id, test_code, value, unit, upper_limit_normal, collected_on, baseline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                subject_id.as_str(),
                measurement.test_code,
                measurement.value,
                measurement.unit,
                measurement.upper_limit_normal,
                iso(measurement.collected_on),
                yn(measurement.baseline),
            ],
        )?;
        Ok(())
    }

    /// Read back the stored narrative for an event.
    pub fn narrative(&self, key: &EventKey) -> Result<Option<Narrative>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT template_used, narrative_text, generation_date, refinement, facts_used
                 FROM narratives WHERE subject_id = ?1 AND sequence_number = ?2",
                params![key.subject_id.as_str(), key.sequence],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((template, text, generated, refinement, facts)) = row else {
            return Ok(None);
        };
        let template = TemplateId::from_key(&template).ok_or(StoreError::Corrupt {
            column: "template_used",
            value: template.clone(),
        })?;
        let generated_at = DateTime::parse_from_rfc3339(&generated)
            .map_err(|_| StoreError::Corrupt {
                column: "generation_date",
                value: generated.clone(),
            })?
            .with_timezone(&Utc);
        let refinement =
            RefinementStatus::from_str_opt(&refinement).ok_or(StoreError::Corrupt {
                column: "refinement",
                value: refinement.clone(),
            })?;

        Ok(Some(Narrative {
            key: key.clone(),
            template,
            text,
            generated_at,
            refinement,
            facts_used: serde_json::from_str(&facts)?,
        }))
    }

    pub fn narrative_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM narratives", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn yn(flag: bool) -> &'static str {
    if flag {
        "Y"
    } else {
        "N"
    }
}

fn date_column(column: &'static str, raw: Option<String>) -> Result<Option<NaiveDate>, StoreError> {
    match raw {
        None => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) => parse_date(&text)
            .map(Some)
            .ok_or(StoreError::InvalidDate { column, value: text }),
    }
}

/// Raw text columns of an event row, converted after the row closure so
/// date failures surface as store errors rather than SQLite errors.
struct EventRow {
    subject_id: String,
    sequence: u32,
    verbatim_term: Option<String>,
    preferred_term: Option<String>,
    system_organ_class: Option<String>,
    severity_grade: Option<u8>,
    onset_date: Option<String>,
    resolution_date: Option<String>,
    onset_study_day: Option<i64>,
    resolution_study_day: Option<i64>,
    outcome: Option<String>,
    action_taken: Option<String>,
    causality: Option<String>,
    flags: [Option<String>; 7],
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: row.get(0)?,
            sequence: row.get(1)?,
            verbatim_term: row.get(2)?,
            preferred_term: row.get(3)?,
            system_organ_class: row.get(4)?,
            severity_grade: row.get(5)?,
            onset_date: row.get(6)?,
            resolution_date: row.get(7)?,
            onset_study_day: row.get(8)?,
            resolution_study_day: row.get(9)?,
            outcome: row.get(10)?,
            action_taken: row.get(11)?,
            causality: row.get(12)?,
            flags: [
                row.get(13)?,
                row.get(14)?,
                row.get(15)?,
                row.get(16)?,
                row.get(17)?,
                row.get(18)?,
                row.get(19)?,
            ],
        })
    }

    fn into_event(self) -> Result<AdverseEvent, StoreError> {
        let flag = |i: usize| parse_flag(self.flags[i].as_deref());
        let seriousness = SeriousnessCriteria {
            serious: flag(0),
            hospitalization: flag(1),
            life_threatening: flag(2),
            results_in_death: flag(3),
            disability: flag(4),
            medically_important: flag(5),
        };
        let treatment_emergent = flag(6);
        Ok(AdverseEvent {
            subject_id: SubjectId::new(self.subject_id),
            sequence: self.sequence,
            verbatim_term: self.verbatim_term,
            preferred_term: self.preferred_term,
            system_organ_class: self.system_organ_class,
            severity_grade: self.severity_grade,
            onset_date: date_column("onset_date", self.onset_date)?,
            resolution_date: date_column("resolution_date", self.resolution_date)?,
            recorded_onset_day: self.onset_study_day,
            recorded_resolution_day: self.resolution_study_day,
            outcome: self.outcome,
            action_taken: self.action_taken,
            causality: self.causality,
            seriousness,
            treatment_emergent,
        })
    }
}

impl DataSource for SqliteStore {
    fn subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        let conn = self.lock()?;
        let subject = conn
            .query_row(
                "SELECT study_id, site_id, age, age_unit, sex, race, ethnicity
                 FROM subjects WHERE subject_id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(Subject {
                        subject_id: id.clone(),
                        study_id: row.get(0)?,
                        site_id: row.get(1)?,
                        age: row.get(2)?,
                        age_unit: row.get(3)?,
                        sex: row.get(4)?,
                        race: row.get(5)?,
                        ethnicity: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(subject)
    }

    fn exposure(&self, id: &SubjectId) -> Result<Option<TreatmentExposure>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT treatment, first_dose_date, last_dose_date
                 FROM treatment_exposure WHERE subject_id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((treatment, first, last)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT dose_date FROM dose_administrations
             WHERE subject_id = ?1 ORDER BY dose_date",
        )?;
        let raw_dates = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut dose_dates = Vec::with_capacity(raw_dates.len());
        for raw in raw_dates {
            if let Some(date) = date_column("dose_date", Some(raw))? {
                dose_dates.push(date);
            }
        }

        Ok(Some(TreatmentExposure {
            subject_id: id.clone(),
            treatment,
            first_dose_date: date_column("first_dose_date", first)?,
            last_dose_date: date_column("last_dose_date", last)?,
            dose_dates,
        }))
    }

    fn event(&self, key: &EventKey) -> Result<Option<AdverseEvent>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM adverse_events
                     WHERE subject_id = ?1 AND sequence_number = ?2"
                ),
                params![key.subject_id.as_str(), key.sequence],
                EventRow::from_row,
            )
            .optional()?;
        row.map(EventRow::into_event).transpose()
    }

    fn measurements(&self, id: &SubjectId) -> Result<Vec<Measurement>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT test_code, value, unit, upper_limit_normal, collected_on, baseline
             FROM lab_results WHERE subject_id = ?1 ORDER BY collected_on, id",
        )?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut measurements = Vec::with_capacity(rows.len());
        for (test_code, value, unit, upper_limit_normal, collected, baseline) in rows {
            let Some(collected_on) = date_column("collected_on", Some(collected))? else {
                continue;
            };
            measurements.push(Measurement {
                test_code,
                value,
                unit,
                upper_limit_normal,
                collected_on,
                baseline: parse_flag(baseline.as_deref()),
            });
        }
        Ok(measurements)
    }

    fn event_keys(&self, scope: EventScope) -> Result<Vec<EventKey>, StoreError> {
        let conn = self.lock()?;
        let sql = match scope {
            EventScope::SeriousTreatmentEmergent => {
                "SELECT subject_id, sequence_number, serious, treatment_emergent FROM adverse_events
                 ORDER BY subject_id, sequence_number"
            }
            EventScope::TreatmentEmergent => {
                "SELECT subject_id, sequence_number, 'Y', treatment_emergent FROM adverse_events
                 ORDER BY subject_id, sequence_number"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let keys = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(_, _, serious, emergent)| {
                parse_flag(serious.as_deref()) && parse_flag(emergent.as_deref())
            })
            .map(|(subject, sequence, _, _)| EventKey::new(subject, sequence))
            .collect();
        Ok(keys)
    }
}

impl NarrativeSink for SqliteStore {
    fn save(&self, narrative: &Narrative) -> Result<(), StoreError> {
        let facts = serde_json::to_string(&narrative.facts_used)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO narratives
             (subject_id, sequence_number, template_used, narrative_text,
              generation_date, refinement, facts_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (subject_id, sequence_number) DO UPDATE SET
                template_used = excluded.template_used,
                narrative_text = excluded.narrative_text,
                generation_date = excluded.generation_date,
                refinement = excluded.refinement,
                facts_used = excluded.facts_used",
            params![
                narrative.key.subject_id.as_str(),
                narrative.key.sequence,
                narrative.template.key(),
                narrative.text,
                narrative.generated_at.to_rfc3339(),
                narrative.refinement.as_str(),
                facts,
            ],
        )?;
        Ok(())
    }
}
