//! SAE Narrative: regulatory-style prose for serious adverse events.
//!
//! Resolves subject, exposure, and event records into a flat fact set,
//! selects a narrative template from the seriousness criteria, fills it,
//! and runs an ordered pipeline of writing-convention rules over the
//! result. An optional refinement step may rewrite the baseline text; the
//! deterministic baseline is always the fallback.

pub mod config;
pub mod core;
pub mod logging;
pub mod schema;
pub mod store;
