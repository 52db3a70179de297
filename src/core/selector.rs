/// Template selection from seriousness criteria.
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::facts::ResolvedFactSet;
use crate::schema::event::SeriousnessCriteria;
use crate::schema::narrative::TemplateId;

/// The event does not meet the criteria any template in this set narrates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotApplicable {
    #[error("event is not treatment-emergent")]
    NotTreatmentEmergent,
    #[error("no hospitalization, medically important, life-threatening, or death criterion is set")]
    NoQualifyingCriterion,
}

/// Choose the template for a resolved fact set.
pub fn select(facts: &ResolvedFactSet) -> Result<TemplateId, NotApplicable> {
    if !facts.context.treatment_emergent {
        return Err(NotApplicable::NotTreatmentEmergent);
    }
    select_for(&facts.context.seriousness)
}

/// Hospitalization is checked first and wins over every other criterion.
/// Medically important, life-threatening, and death share the second
/// template. Disability alone, or the overall flag alone, is rejected.
pub fn select_for(criteria: &SeriousnessCriteria) -> Result<TemplateId, NotApplicable> {
    let selected = if criteria.hospitalization {
        Ok(TemplateId::SaeHospitalization)
    } else if criteria.medically_important
        || criteria.life_threatening
        || criteria.results_in_death
    {
        Ok(TemplateId::SaeMedicallyImportant)
    } else {
        Err(NotApplicable::NoQualifyingCriterion)
    };

    if criteria.any_criterion() != criteria.serious {
        warn!(
            serious = criteria.serious,
            any_criterion = criteria.any_criterion(),
            "overall serious flag disagrees with individual criteria"
        );
    }
    if let Ok(id) = &selected {
        debug!(template = %id, "selected template");
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::facts::ClinicalContext;

    fn criteria(bits: u8) -> SeriousnessCriteria {
        SeriousnessCriteria {
            serious: bits & 1 != 0,
            hospitalization: bits & 2 != 0,
            life_threatening: bits & 4 != 0,
            results_in_death: bits & 8 != 0,
            disability: bits & 16 != 0,
            medically_important: bits & 32 != 0,
        }
    }

    #[test]
    fn every_flag_combination_selects_or_rejects() {
        for bits in 0u8..64 {
            let c = criteria(bits);
            let result = select_for(&c);
            if c.hospitalization {
                assert_eq!(result, Ok(TemplateId::SaeHospitalization), "bits {bits:06b}");
            } else if c.medically_important || c.life_threatening || c.results_in_death {
                assert_eq!(result, Ok(TemplateId::SaeMedicallyImportant), "bits {bits:06b}");
            } else {
                assert_eq!(result, Err(NotApplicable::NoQualifyingCriterion), "bits {bits:06b}");
            }
        }
    }

    #[test]
    fn hospitalization_beats_death() {
        let c = SeriousnessCriteria {
            serious: true,
            hospitalization: true,
            results_in_death: true,
            medically_important: true,
            ..Default::default()
        };
        assert_eq!(select_for(&c), Ok(TemplateId::SaeHospitalization));
    }

    #[test]
    fn overall_flag_alone_is_rejected() {
        let c = SeriousnessCriteria {
            serious: true,
            ..Default::default()
        };
        assert_eq!(select_for(&c), Err(NotApplicable::NoQualifyingCriterion));
    }

    #[test]
    fn non_treatment_emergent_is_rejected() {
        let facts = ResolvedFactSet::new(ClinicalContext {
            seriousness: criteria(0b000011),
            treatment_emergent: false,
            ..Default::default()
        });
        assert_eq!(select(&facts), Err(NotApplicable::NotTreatmentEmergent));
    }

    #[test]
    fn select_reads_context() {
        let facts = ResolvedFactSet::new(ClinicalContext {
            seriousness: criteria(0b100001),
            treatment_emergent: true,
            ..Default::default()
        });
        assert_eq!(select(&facts), Ok(TemplateId::SaeMedicallyImportant));
    }
}
