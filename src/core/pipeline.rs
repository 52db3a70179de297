/// The narrative assembler: event key → validated narrative.
///
/// Wires together field resolution, template selection, template fill,
/// the rule pipeline, output validation, and optional refinement.
use chrono::Utc;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::core::facts::ResolvedFactSet;
use crate::core::mapping::{FieldMappings, MappingError};
use crate::core::refine::{refine_within, RefinementJob, RefinementOutcome, Refiner};
use crate::core::resolver::{FieldResolver, ResolveError};
use crate::core::rules::{CategorySets, RulePipeline};
use crate::core::selector::{self, NotApplicable};
use crate::core::template::{FillError, LintIssue, Severity, TemplateError, TemplateSet};
use crate::schema::event::EventKey;
use crate::schema::narrative::{Narrative, RefinementStatus, TemplateId};
use crate::schema::subject::SubjectId;
use crate::store::{DataSource, NarrativeSink, StoreError};

/// Local wait for the refiner when none is configured.
const DEFAULT_REFINEMENT_BUDGET: Duration = Duration::from_secs(45);

#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{key}: {reason}")]
    NotApplicable { key: EventKey, reason: NotApplicable },
    #[error("{key}: {source}")]
    Fill { key: EventKey, source: FillError },
    #[error("{key}: output still contains a placeholder marker near '{marker}'")]
    UnresolvedPlaceholder { key: EventKey, marker: String },
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("field mapping error: {0}")]
    Mapping(#[from] MappingError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("template lint failed: {}", .0.join("; "))]
    Lint(Vec<String>),
    #[error("no data source configured")]
    MissingDataSource,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}: batch cancelled before this event was dispatched")]
    Cancelled(EventKey),
}

/// The error taxonomy callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    NotFound,
    IncompleteData,
    NotApplicable,
    /// A configuration or rule-coverage defect. The only kind that
    /// warrants investigation.
    UnresolvedOutput,
    Configuration,
    Storage,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::IncompleteData => "incomplete_data",
            Self::NotApplicable => "not_applicable",
            Self::UnresolvedOutput => "unresolved_output",
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NarrativeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolve(ResolveError::SubjectNotFound(_) | ResolveError::EventNotFound(_)) => {
                ErrorKind::NotFound
            }
            Self::Resolve(
                ResolveError::IncompleteData { .. }
                | ResolveError::UnmappedValue { .. }
                | ResolveError::InvalidDate { .. }
                | ResolveError::DelimiterInValue { .. },
            ) => ErrorKind::IncompleteData,
            Self::Resolve(ResolveError::Store(_)) | Self::Store(_) => ErrorKind::Storage,
            Self::NotApplicable { .. } => ErrorKind::NotApplicable,
            Self::Fill { .. } => ErrorKind::IncompleteData,
            Self::UnresolvedPlaceholder { .. } => ErrorKind::UnresolvedOutput,
            Self::Template(_)
            | Self::Mapping(_)
            | Self::Config(_)
            | Self::Lint(_)
            | Self::MissingDataSource => ErrorKind::Configuration,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// The deterministic narrative before refinement.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub key: EventKey,
    pub template: TemplateId,
    pub text: String,
    pub facts: ResolvedFactSet,
    pub facts_used: BTreeMap<String, String>,
}

/// Outcome of one event in a batch.
#[derive(Debug)]
pub struct BatchItem {
    pub key: EventKey,
    pub result: Result<Narrative, NarrativeError>,
}

/// Per-item results of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures_by_kind(&self) -> BTreeMap<ErrorKind, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            if let Err(e) = &item.result {
                *counts.entry(e.kind()).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Fails if any placeholder delimiter survived into the output.
pub fn validate_output(key: &EventKey, text: &str) -> Result<(), NarrativeError> {
    match text.find(['{', '}']) {
        None => Ok(()),
        Some(at) => {
            let marker: String = text[at..].chars().take(40).collect();
            Err(NarrativeError::UnresolvedPlaceholder {
                key: key.clone(),
                marker,
            })
        }
    }
}

/// The top-level assembler. Built via `NarrativeAssembler::builder()`.
pub struct NarrativeAssembler {
    resolver: FieldResolver,
    templates: TemplateSet,
    rules: RulePipeline,
    guide: Arc<str>,
    refiner: Option<Arc<dyn Refiner>>,
    refinement_budget: Duration,
}

impl NarrativeAssembler {
    pub fn builder() -> NarrativeAssemblerBuilder {
        NarrativeAssemblerBuilder {
            data_source: None,
            templates_path: None,
            mappings_path: None,
            guide_path: None,
            templates: None,
            mappings: None,
            guide: None,
            categories: CategorySets::default(),
            refiner: None,
            refinement_budget: DEFAULT_REFINEMENT_BUDGET,
        }
    }

    pub fn guide(&self) -> &str {
        &self.guide
    }

    pub fn rules(&self) -> &RulePipeline {
        &self.rules
    }

    pub fn has_refiner(&self) -> bool {
        self.refiner.is_some()
    }

    /// Resolve an event's facts without generating text.
    pub fn resolve_facts(&self, key: &EventKey) -> Result<ResolvedFactSet, NarrativeError> {
        Ok(self.resolver.resolve(key)?)
    }

    /// Resolve, select, fill, apply rules, and validate.
    pub fn baseline(&self, key: &EventKey) -> Result<Baseline, NarrativeError> {
        let facts = self.resolver.resolve(key)?;
        let template_id = selector::select(&facts).map_err(|reason| NarrativeError::NotApplicable {
            key: key.clone(),
            reason,
        })?;
        let template = self.templates.get(template_id)?;
        let filled = template.fill(&facts).map_err(|source| NarrativeError::Fill {
            key: key.clone(),
            source,
        })?;
        let text = self.rules.run(&filled.text, &facts);
        validate_output(key, &text)?;
        Ok(Baseline {
            key: key.clone(),
            template: template_id,
            text,
            facts,
            facts_used: filled.facts_used,
        })
    }

    /// Generate the narrative for one adverse event.
    pub fn generate(&self, subject_id: &SubjectId, sequence: u32) -> Result<Narrative, NarrativeError> {
        self.generate_for(&EventKey {
            subject_id: subject_id.clone(),
            sequence,
        })
    }

    pub fn generate_for(&self, key: &EventKey) -> Result<Narrative, NarrativeError> {
        let baseline = self.baseline(key)?;
        let (text, refinement) = self.refine(&baseline);
        info!(
            event = %key,
            template = %baseline.template,
            refinement = refinement.as_str(),
            "generated narrative"
        );
        Ok(Narrative {
            key: baseline.key,
            template: baseline.template,
            text,
            generated_at: Utc::now(),
            refinement,
            facts_used: baseline.facts_used,
        })
    }

    fn refine(&self, baseline: &Baseline) -> (String, RefinementStatus) {
        let Some(refiner) = &self.refiner else {
            return (baseline.text.clone(), RefinementStatus::NotRequested);
        };
        let job = RefinementJob {
            key: baseline.key.clone(),
            template: baseline.template,
            baseline: baseline.text.clone(),
            facts: baseline.facts.listing(),
            guide: Arc::clone(&self.guide),
        };
        match refine_within(Arc::clone(refiner), job, self.refinement_budget) {
            RefinementOutcome::Refined(text) => (text, RefinementStatus::Applied),
            RefinementOutcome::UseBaseline(reason) => {
                warn!(event = %baseline.key, %reason, "refinement unavailable, keeping baseline");
                (baseline.text.clone(), RefinementStatus::FellBack)
            }
        }
    }

    /// Generate every key in parallel. Each item succeeds or fails on its
    /// own; once `cancel` is set, undispatched items report `Cancelled`.
    /// When a sink is given, each narrative is saved as it is produced.
    pub fn generate_batch(
        &self,
        keys: &[EventKey],
        sink: Option<&dyn NarrativeSink>,
        cancel: &AtomicBool,
    ) -> BatchReport {
        let items: Vec<BatchItem> = keys
            .par_iter()
            .map(|key| {
                if cancel.load(Ordering::Relaxed) {
                    return BatchItem {
                        key: key.clone(),
                        result: Err(NarrativeError::Cancelled(key.clone())),
                    };
                }
                let result = self.generate_for(key).and_then(|narrative| {
                    if let Some(sink) = sink {
                        sink.save(&narrative)?;
                    }
                    Ok(narrative)
                });
                if let Err(e) = &result {
                    if e.kind() == ErrorKind::UnresolvedOutput {
                        error!(event = %key, error = %e, "unresolved placeholder in output");
                    } else {
                        warn!(event = %key, kind = %e.kind(), error = %e, "narrative not generated");
                    }
                }
                BatchItem {
                    key: key.clone(),
                    result,
                }
            })
            .collect();

        let report = BatchReport { items };
        info!(
            total = report.items.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch finished"
        );
        report
    }
}

/// Builder for constructing a `NarrativeAssembler`.
pub struct NarrativeAssemblerBuilder {
    data_source: Option<Arc<dyn DataSource>>,
    templates_path: Option<PathBuf>,
    mappings_path: Option<PathBuf>,
    guide_path: Option<PathBuf>,
    /// Directly provided templates (for testing without files).
    templates: Option<TemplateSet>,
    /// Directly provided mappings (for testing without files).
    mappings: Option<FieldMappings>,
    /// Directly provided guide text (for testing without files).
    guide: Option<String>,
    categories: CategorySets,
    refiner: Option<Arc<dyn Refiner>>,
    refinement_budget: Duration,
}

impl NarrativeAssemblerBuilder {
    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    pub fn templates(mut self, path: impl AsRef<Path>) -> Self {
        self.templates_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn field_mappings(mut self, path: impl AsRef<Path>) -> Self {
        self.mappings_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn guide(mut self, path: impl AsRef<Path>) -> Self {
        self.guide_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Provide templates directly (for testing without files).
    pub fn with_templates(mut self, templates: TemplateSet) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Provide mappings directly (for testing without files).
    pub fn with_mappings(mut self, mappings: FieldMappings) -> Self {
        self.mappings = Some(mappings);
        self
    }

    /// Provide the guide text directly (for testing without files).
    pub fn with_guide(mut self, guide: impl Into<String>) -> Self {
        self.guide = Some(guide.into());
        self
    }

    pub fn categories(mut self, categories: CategorySets) -> Self {
        self.categories = categories;
        self
    }

    pub fn refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn refinement_budget(mut self, budget: Duration) -> Self {
        self.refinement_budget = budget;
        self
    }

    /// Take file paths, categories, and the refinement budget from an
    /// engine config. The refiner itself is attached separately.
    pub fn from_config(self, config: &EngineConfig) -> Self {
        self.templates(&config.templates)
            .field_mappings(&config.field_mappings)
            .guide(&config.guide)
            .categories(config.categories.clone())
            .refinement_budget(config.refinement.timeout())
    }

    pub fn build(self) -> Result<NarrativeAssembler, NarrativeError> {
        let source = self.data_source.ok_or(NarrativeError::MissingDataSource)?;

        let templates = match (self.templates, &self.templates_path) {
            (Some(templates), _) => templates,
            (None, Some(path)) => TemplateSet::load_from_ron(path)?,
            (None, None) => TemplateSet::default(),
        };
        let mappings = match (self.mappings, &self.mappings_path) {
            (Some(mappings), _) => mappings,
            (None, Some(path)) => FieldMappings::load_from_ron(path)?,
            (None, None) => FieldMappings::default(),
        };
        mappings.validate()?;
        let guide = match (self.guide, &self.guide_path) {
            (Some(guide), _) => guide,
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|source| {
                ConfigError::Io {
                    path: path.clone(),
                    source,
                }
            })?,
            (None, None) => String::new(),
        };

        let issues = templates.lint(&mappings);
        for issue in issues.iter().filter(|i| i.severity == Severity::Warning) {
            warn!(issue = %issue.message, "template lint warning");
        }
        let errors: Vec<String> = issues
            .into_iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i: LintIssue| i.message)
            .collect();
        if !errors.is_empty() {
            return Err(NarrativeError::Lint(errors));
        }

        Ok(NarrativeAssembler {
            resolver: FieldResolver::new(source, mappings),
            templates,
            rules: RulePipeline::standard(self.categories),
            guide: Arc::from(guide),
            refiner: self.refiner,
            refinement_budget: self.refinement_budget,
        })
    }
}
