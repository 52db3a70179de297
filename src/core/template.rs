/// Narrative templates: parsing, loading, conditional paragraphs, filling,
/// and lint against the field mappings.
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::core::facts::ResolvedFactSet;
use crate::core::mapping::{Fallback, FieldMappings};
use crate::schema::exposure::DosingReference;
use crate::schema::narrative::TemplateId;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("unknown template id '{0}'")]
    UnknownTemplate(String),
    #[error("no template configured for {0}")]
    MissingTemplate(TemplateId),
}

/// Why a template could not be filled from a fact set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FillError {
    #[error("placeholder '{0}' has no resolved value")]
    MissingFact(String),
    #[error("placeholder '{0}' needs a study day but none was resolved")]
    MissingStudyDay(String),
}

/// A segment of a parsed template text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    /// Literal text, emitted as-is.
    Literal(String),
    /// `{name}`
    Field { name: String },
    /// `{name:study_day}`: the date followed by `(Study Day N)`.
    FieldWithStudyDay { name: String },
}

/// A parsed template text, a sequence of segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateText {
    pub segments: Vec<Segment>,
}

impl TemplateText {
    /// Parse a template string into segments.
    ///
    /// Syntax:
    /// - `{name}` → `Field`
    /// - `{name:study_day}` → `FieldWithStudyDay`
    /// - `{{` / `}}` → literal brace
    /// - Everything else → `Literal`
    pub fn parse(input: &str) -> Result<TemplateText, TemplateError> {
        let mut segments = Vec::new();
        let mut literal_buf = String::new();
        let chars: Vec<char> = input.chars().collect();
        let len = chars.len();
        let mut i = 0;

        while i < len {
            if chars[i] == '{' {
                if i + 1 < len && chars[i + 1] == '{' {
                    literal_buf.push('{');
                    i += 2;
                    continue;
                }

                if !literal_buf.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal_buf)));
                }

                let start = i + 1;
                let mut end = start;
                while end < len && chars[end] != '}' {
                    if chars[end] == '{' {
                        return Err(TemplateError::Parse(
                            "nested braces are not allowed".to_string(),
                        ));
                    }
                    end += 1;
                }
                if end >= len {
                    return Err(TemplateError::Parse("unclosed brace".to_string()));
                }

                let content: String = chars[start..end].iter().collect();
                segments.push(Self::parse_placeholder(&content)?);
                i = end + 1;
            } else if chars[i] == '}' {
                if i + 1 < len && chars[i + 1] == '}' {
                    literal_buf.push('}');
                    i += 2;
                    continue;
                }
                return Err(TemplateError::Parse(
                    "unmatched closing brace".to_string(),
                ));
            } else {
                literal_buf.push(chars[i]);
                i += 1;
            }
        }

        if !literal_buf.is_empty() {
            segments.push(Segment::Literal(literal_buf));
        }

        Ok(TemplateText { segments })
    }

    fn parse_placeholder(content: &str) -> Result<Segment, TemplateError> {
        let (name, qualifier) = match content.split_once(':') {
            Some((name, qualifier)) => (name.trim(), Some(qualifier.trim())),
            None => (content.trim(), None),
        };
        if name.is_empty() {
            return Err(TemplateError::Parse("empty braces".to_string()));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TemplateError::Parse(format!(
                "invalid placeholder name '{name}'"
            )));
        }
        match qualifier {
            None => Ok(Segment::Field {
                name: name.to_string(),
            }),
            Some("study_day") => Ok(Segment::FieldWithStudyDay {
                name: name.to_string(),
            }),
            Some(other) => Err(TemplateError::Parse(format!(
                "unknown qualifier '{other}' on '{name}': expected study_day"
            ))),
        }
    }

    /// Placeholder names in order of appearance, with the study-day flag.
    pub fn placeholders(&self) -> impl Iterator<Item = (&str, bool)> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Literal(_) => None,
            Segment::Field { name } => Some((name.as_str(), false)),
            Segment::FieldWithStudyDay { name } => Some((name.as_str(), true)),
        })
    }

    fn has_literal_brace(&self) -> bool {
        self.segments.iter().any(|segment| {
            matches!(segment, Segment::Literal(text) if text.contains(['{', '}']))
        })
    }

    fn fill(
        &self,
        facts: &ResolvedFactSet,
        used: &mut BTreeMap<String, String>,
    ) -> Result<String, FillError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { name } => {
                    let value = facts
                        .get(name)
                        .ok_or_else(|| FillError::MissingFact(name.clone()))?;
                    out.push_str(value);
                    used.insert(name.clone(), value.to_string());
                }
                Segment::FieldWithStudyDay { name } => {
                    let value = facts
                        .get(name)
                        .ok_or_else(|| FillError::MissingFact(name.clone()))?;
                    match facts.study_day(name) {
                        Some(day) => out.push_str(&format!("{value} (Study Day {day})")),
                        None if facts.is_fallback(name) => out.push_str(value),
                        None => return Err(FillError::MissingStudyDay(name.clone())),
                    }
                    used.insert(name.clone(), value.to_string());
                }
            }
        }
        Ok(out)
    }
}

/// When a paragraph variation applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// The named fact was resolved from source data.
    Available(String),
    /// The named fact is absent or only a fallback literal.
    Missing(String),
    /// A dose precedes onset.
    DoseBeforeOnset,
    /// Every known dose follows onset.
    OnsetBeforeFirstDose,
    /// Study drug was withdrawn, interrupted, or reduced.
    Dechallenged,
}

impl Condition {
    pub fn holds(&self, facts: &ResolvedFactSet) -> bool {
        match self {
            Self::Available(name) => facts.is_available(name),
            Self::Missing(name) => !facts.is_available(name),
            Self::DoseBeforeOnset => {
                matches!(facts.context.dosing, DosingReference::PriorDose(_))
            }
            Self::OnsetBeforeFirstDose => {
                facts.context.dosing == DosingReference::OnsetBeforeFirstDose
            }
            Self::Dechallenged => facts.context.dechallenged,
        }
    }

    fn field(&self) -> Option<&str> {
        match self {
            Self::Available(name) | Self::Missing(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Text appended to a paragraph when its condition holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub when: Condition,
    pub text: TemplateText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    pub number: u32,
    pub body: TemplateText,
    pub variations: Vec<Variation>,
}

/// A filled template: text before rules, and the facts it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledTemplate {
    pub text: String,
    pub facts_used: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeTemplate {
    pub id: TemplateId,
    pub version: String,
    pub paragraphs: Vec<Paragraph>,
}

impl NarrativeTemplate {
    /// Fill every paragraph in order. Variations whose condition holds are
    /// appended to their paragraph; paragraphs are separated by a blank line.
    pub fn fill(&self, facts: &ResolvedFactSet) -> Result<FilledTemplate, FillError> {
        let mut used = BTreeMap::new();
        let mut paragraphs = Vec::with_capacity(self.paragraphs.len());
        for paragraph in &self.paragraphs {
            let mut text = paragraph.body.fill(facts, &mut used)?.trim().to_string();
            for variation in &paragraph.variations {
                if variation.when.holds(facts) {
                    let extra = variation.text.fill(facts, &mut used)?;
                    let extra = extra.trim();
                    if !extra.is_empty() {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(extra);
                    }
                }
            }
            if !text.is_empty() {
                paragraphs.push(text);
            }
        }
        Ok(FilledTemplate {
            text: paragraphs.join("\n\n"),
            facts_used: used,
        })
    }

    fn texts(&self) -> impl Iterator<Item = (u32, Option<&Condition>, &TemplateText)> {
        self.paragraphs.iter().flat_map(|p| {
            std::iter::once((p.number, None, &p.body)).chain(
                p.variations
                    .iter()
                    .map(move |v| (p.number, Some(&v.when), &v.text)),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintIssue {
    pub severity: Severity,
    pub message: String,
}

impl LintIssue {
    fn error(message: String) -> Self {
        Self {
            severity: Severity::Error,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            message,
        }
    }
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{label}: {}", self.message)
    }
}

/// One template per `TemplateId`.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: FxHashMap<TemplateId, NarrativeTemplate>,
}

// RON shape of the templates file. Paragraph text is parsed into segments
// after deserialization.

#[derive(Debug, Deserialize)]
#[serde(rename = "Variation")]
struct RonVariation {
    when: Condition,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Paragraph")]
struct RonParagraph {
    number: u32,
    text: String,
    #[serde(default)]
    variations: Vec<RonVariation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Template")]
struct RonTemplate {
    version: String,
    paragraphs: Vec<RonParagraph>,
}

impl TemplateSet {
    /// Load a template set from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<TemplateSet, TemplateError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a template set from a RON string.
    pub fn parse_ron(input: &str) -> Result<TemplateSet, TemplateError> {
        let raw: BTreeMap<String, RonTemplate> = ron::from_str(input)?;
        let mut set = TemplateSet::default();

        for (key, ron_template) in raw {
            let id = TemplateId::from_key(&key)
                .ok_or_else(|| TemplateError::UnknownTemplate(key.clone()))?;
            let mut paragraphs = Vec::with_capacity(ron_template.paragraphs.len());
            for p in ron_template.paragraphs {
                let mut variations = Vec::with_capacity(p.variations.len());
                for v in p.variations {
                    variations.push(Variation {
                        when: v.when,
                        text: TemplateText::parse(&v.text)?,
                    });
                }
                paragraphs.push(Paragraph {
                    number: p.number,
                    body: TemplateText::parse(&p.text)?,
                    variations,
                });
            }
            paragraphs.sort_by_key(|p| p.number);
            set.insert(NarrativeTemplate {
                id,
                version: ron_template.version,
                paragraphs,
            });
        }

        Ok(set)
    }

    pub fn insert(&mut self, template: NarrativeTemplate) {
        self.templates.insert(template.id, template);
    }

    pub fn get(&self, id: TemplateId) -> Result<&NarrativeTemplate, TemplateError> {
        self.templates
            .get(&id)
            .ok_or(TemplateError::MissingTemplate(id))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Check every template against the field mappings.
    pub fn lint(&self, mappings: &FieldMappings) -> Vec<LintIssue> {
        let mut issues = Vec::new();
        for id in TemplateId::ALL {
            let Some(template) = self.templates.get(&id) else {
                issues.push(LintIssue::error(format!("no template for {id}")));
                continue;
            };
            for (number, condition, text) in template.texts() {
                let place = format!("{id} paragraph {number}");
                if let Some(field) = condition.and_then(Condition::field) {
                    if mappings.get(field).is_none() {
                        issues.push(LintIssue::error(format!(
                            "{place}: condition references unmapped field '{field}'"
                        )));
                    }
                }
                if text.has_literal_brace() {
                    issues.push(LintIssue::error(format!(
                        "{place}: literal brace would fail output validation"
                    )));
                }
                for (name, with_day) in text.placeholders() {
                    let Some(mapping) = mappings.get(name) else {
                        issues.push(LintIssue::error(format!(
                            "{place}: placeholder '{name}' is not a mapped field"
                        )));
                        continue;
                    };
                    if with_day && !mapping.study_day {
                        issues.push(LintIssue::error(format!(
                            "{place}: '{name}:study_day' on a field without study days"
                        )));
                    }
                    if !with_day && mapping.study_day {
                        issues.push(LintIssue::warning(format!(
                            "{place}: '{name}' is rendered without its study day"
                        )));
                    }
                    let guarded = matches!(
                        condition,
                        Some(Condition::Available(field)) if field == name
                    );
                    if mapping.fallback == Fallback::Omit && !guarded {
                        issues.push(LintIssue::warning(format!(
                            "{place}: '{name}' may be omitted but is not guarded by Available(\"{name}\")"
                        )));
                    }
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::facts::ClinicalContext;
    use crate::core::mapping::{FieldMapping, SourceField, Transform};

    #[test]
    fn parse_literal_only() {
        let t = TemplateText::parse("No placeholders here.").unwrap();
        assert_eq!(
            t.segments,
            vec![Segment::Literal("No placeholders here.".to_string())]
        );
    }

    #[test]
    fn parse_fields_and_study_days() {
        let t = TemplateText::parse("On {onset_date:study_day}, {subject_id} was seen.").unwrap();
        assert_eq!(t.segments.len(), 5);
        assert_eq!(
            t.segments[1],
            Segment::FieldWithStudyDay {
                name: "onset_date".to_string()
            }
        );
        assert_eq!(
            t.segments[3],
            Segment::Field {
                name: "subject_id".to_string()
            }
        );
        assert_eq!(
            t.placeholders().collect::<Vec<_>>(),
            vec![("onset_date", true), ("subject_id", false)]
        );
    }

    #[test]
    fn parse_escaped_braces() {
        let t = TemplateText::parse("Use {{braces}} here.").unwrap();
        assert_eq!(
            t.segments,
            vec![Segment::Literal("Use {braces} here.".to_string())]
        );
    }

    #[test]
    fn parse_errors() {
        assert!(TemplateText::parse("Bad {} here").is_err());
        assert!(TemplateText::parse("Bad {outer{inner}} here").is_err());
        assert!(TemplateText::parse("Bad {unclosed here").is_err());
        assert!(TemplateText::parse("Bad } here").is_err());
        assert!(TemplateText::parse("Bad {onset_date:weekday}").is_err());
        assert!(TemplateText::parse("Bad {two words}").is_err());
    }

    fn facts() -> ResolvedFactSet {
        let mut facts = ResolvedFactSet::new(ClinicalContext {
            dechallenged: true,
            ..Default::default()
        });
        facts.insert("preferred_term", "Pneumonia");
        facts.insert("onset_date", "22-Jan-2024");
        facts.set_study_day("onset_date", 34);
        facts.insert_fallback("outcome", "not available");
        facts
    }

    fn template(paragraphs: Vec<Paragraph>) -> NarrativeTemplate {
        NarrativeTemplate {
            id: TemplateId::SaeHospitalization,
            version: "test".to_string(),
            paragraphs,
        }
    }

    fn paragraph(number: u32, body: &str, variations: Vec<(Condition, &str)>) -> Paragraph {
        Paragraph {
            number,
            body: TemplateText::parse(body).unwrap(),
            variations: variations
                .into_iter()
                .map(|(when, text)| Variation {
                    when,
                    text: TemplateText::parse(text).unwrap(),
                })
                .collect(),
        }
    }

    #[test]
    fn fill_renders_study_days_and_variations() {
        let t = template(vec![
            paragraph(1, "On {onset_date:study_day}, the SAE of {preferred_term} began.", vec![
                (Condition::Available("resolution_date".into()), "It ended on {resolution_date}."),
                (Condition::Missing("resolution_date".into()), "The outcome was {outcome}."),
            ]),
            paragraph(2, "Study drug action was recorded.", vec![
                (Condition::Dechallenged, "Study drug was withdrawn."),
            ]),
        ]);
        let filled = t.fill(&facts()).unwrap();
        assert_eq!(
            filled.text,
            "On 22-Jan-2024 (Study Day 34), the SAE of Pneumonia began. The outcome was not available.\n\nStudy drug action was recorded. Study drug was withdrawn."
        );
        assert_eq!(filled.facts_used.len(), 3);
        assert_eq!(filled.facts_used["outcome"], "not available");
    }

    #[test]
    fn fill_fails_on_missing_fact() {
        let t = template(vec![paragraph(1, "Ended {resolution_date}.", vec![])]);
        assert_eq!(
            t.fill(&facts()),
            Err(FillError::MissingFact("resolution_date".to_string()))
        );
    }

    #[test]
    fn study_day_required_unless_fallback() {
        let mut f = facts();
        f.insert("first_dose_date", "20-Dec-2023");
        let t = template(vec![paragraph(1, "{first_dose_date:study_day}", vec![])]);
        assert_eq!(
            t.fill(&f),
            Err(FillError::MissingStudyDay("first_dose_date".to_string()))
        );

        let t = template(vec![paragraph(1, "{outcome:study_day}", vec![])]);
        assert_eq!(t.fill(&f).unwrap().text, "not available");
    }

    fn mapping(name: &str, source: SourceField, study_day: bool, fallback: Fallback) -> FieldMapping {
        FieldMapping {
            name: name.to_string(),
            source,
            transform: if source.is_date() {
                Transform::Date
            } else {
                Transform::Verbatim
            },
            study_day,
            fallback,
        }
    }

    #[test]
    fn lint_flags_unmapped_and_misplaced_study_days() {
        let ron = r#"{
            "sae_hospitalization": Template(
                version: "1",
                paragraphs: [
                    Paragraph(number: 1, text: "{preferred_term:study_day} on {onset_date:study_day} by {unknown}."),
                ],
            ),
        }"#;
        let set = TemplateSet::parse_ron(ron).unwrap();
        let mappings = FieldMappings {
            fields: vec![
                mapping("preferred_term", SourceField::PreferredTerm, false, Fallback::Abort),
                mapping("onset_date", SourceField::OnsetDate, true, Fallback::Abort),
            ],
        };
        let issues = set.lint(&mappings);
        let errors: Vec<_> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| i.message.as_str())
            .collect();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|m| m.contains("no template for sae_medically_important")));
        assert!(errors.iter().any(|m| m.contains("'unknown' is not a mapped field")));
        assert!(errors.iter().any(|m| m.contains("'preferred_term:study_day'")));
    }

    #[test]
    fn lint_warns_on_unguarded_omitted_field() {
        let ron = r#"{
            "sae_hospitalization": Template(version: "1", paragraphs: [
                Paragraph(number: 1, text: "Ended {resolution_date}.", variations: [
                    Variation(when: Available("resolution_date"), text: "Ended {resolution_date}."),
                ]),
            ]),
            "sae_medically_important": Template(version: "1", paragraphs: []),
        }"#;
        let set = TemplateSet::parse_ron(ron).unwrap();
        let mappings = FieldMappings {
            fields: vec![mapping("resolution_date", SourceField::ResolutionDate, false, Fallback::Omit)],
        };
        let issues = set.lint(&mappings);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn unknown_template_key_rejected() {
        let ron = r#"{"ae_non_serious": Template(version: "1", paragraphs: [])}"#;
        assert!(matches!(
            TemplateSet::parse_ron(ron),
            Err(TemplateError::UnknownTemplate(key)) if key == "ae_non_serious"
        ));
    }

    #[test]
    fn paragraphs_sorted_by_number() {
        let ron = r#"{"sae_hospitalization": Template(version: "1", paragraphs: [
            Paragraph(number: 2, text: "Second."),
            Paragraph(number: 1, text: "First."),
        ])}"#;
        let set = TemplateSet::parse_ron(ron).unwrap();
        let t = set.get(TemplateId::SaeHospitalization).unwrap();
        assert_eq!(t.fill(&ResolvedFactSet::default()).unwrap().text, "First.\n\nSecond.");
        assert!(set.get(TemplateId::SaeMedicallyImportant).is_err());
    }
}
