//! narrate: generate SAE narratives from the study database.
//!
//! Narrative text goes to stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use sae_narrative::config::EngineConfig;
use sae_narrative::core::pipeline::{NarrativeAssembler, NarrativeError};
use sae_narrative::core::refine::ChatCompletionRefiner;
use sae_narrative::logging::{init_logging, LogConfig};
use sae_narrative::schema::event::EventKey;
use sae_narrative::schema::narrative::Narrative;
use sae_narrative::store::{DataSource, EventScope, NarrativeSink, SqliteStore};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "narrate",
    version,
    about = "Generate serious adverse event narratives"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file.
    #[arg(long, value_name = "PATH", default_value = "config/engine.ron", global = true)]
    config: PathBuf,

    /// SQLite database (overrides the configured one).
    #[arg(long, value_name = "PATH", global = true)]
    database: Option<PathBuf>,

    /// Run the refinement step after the deterministic narrative.
    #[arg(long, global = true)]
    refine: bool,

    /// Print narratives without saving them.
    #[arg(long = "no-save", global = true)]
    no_save: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long = "log-level", default_value = "info", global = true)]
    log_level: String,

    /// Log output format (pretty, compact, json).
    #[arg(long = "log-format", default_value = "pretty", global = true)]
    log_format: String,
}

#[derive(Subcommand)]
enum Command {
    /// Narrate one adverse event.
    Single {
        subject_id: String,
        sequence: u32,
    },
    /// Narrate every serious treatment-emergent event.
    All {
        /// Include treatment-emergent events without the serious flag.
        #[arg(long = "include-non-serious")]
        include_non_serious: bool,
    },
    /// Print the resolved facts for one event without generating text.
    Facts {
        subject_id: String,
        sequence: u32,
    },
}

fn main() {
    let cli = Cli::parse();
    let log_config = match LogConfig::from_args(&cli.log_level, &cli.log_format) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("error: failed to initialize logging: {e}");
        process::exit(1);
    }

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error [{}]: {e}", e.kind());
            process::exit(1);
        }
    }
}

/// Returns whether every requested narrative was produced.
fn run(cli: &Cli) -> Result<bool, NarrativeError> {
    let config = EngineConfig::load(&cli.config)?;
    let database = cli
        .database
        .clone()
        .or_else(|| config.database.clone())
        .ok_or(NarrativeError::MissingDataSource)?;
    let store = Arc::new(SqliteStore::open(&database)?);

    let mut builder = NarrativeAssembler::builder()
        .from_config(&config)
        .data_source(store.clone());
    if cli.refine || config.refine {
        match ChatCompletionRefiner::from_config(config.refinement.clone()) {
            Ok(refiner) => builder = builder.refiner(Arc::new(refiner)),
            Err(e) => tracing::warn!(error = %e, "refinement disabled"),
        }
    }
    let assembler = builder.build()?;
    let sink: Option<&dyn NarrativeSink> = if cli.no_save {
        None
    } else {
        Some(&*store as &dyn NarrativeSink)
    };

    match &cli.command {
        Command::Single {
            subject_id,
            sequence,
        } => {
            let narrative = assembler.generate_for(&EventKey::new(subject_id.as_str(), *sequence))?;
            if let Some(sink) = sink {
                sink.save(&narrative)?;
            }
            print_narrative(&narrative);
            Ok(true)
        }
        Command::Facts {
            subject_id,
            sequence,
        } => {
            let facts = assembler.resolve_facts(&EventKey::new(subject_id.as_str(), *sequence))?;
            println!("{}", facts.listing());
            Ok(true)
        }
        Command::All {
            include_non_serious,
        } => {
            let scope = if *include_non_serious {
                EventScope::TreatmentEmergent
            } else {
                EventScope::SeriousTreatmentEmergent
            };
            let keys = store.event_keys(scope)?;
            info!(events = keys.len(), "narrating events");
            let cancel = AtomicBool::new(false);
            let report = assembler.generate_batch(&keys, sink, &cancel);
            for item in &report.items {
                match &item.result {
                    Ok(narrative) => print_narrative(narrative),
                    Err(e) => eprintln!("{} [{}]: {e}", item.key, e.kind()),
                }
            }
            eprintln!(
                "{} generated, {} failed",
                report.succeeded(),
                report.failed()
            );
            for (kind, count) in report.failures_by_kind() {
                eprintln!("  {kind}: {count}");
            }
            Ok(report.is_success())
        }
    }
}

fn print_narrative(narrative: &Narrative) {
    println!("=== {} ({}) ===", narrative.key, narrative.template);
    println!("{}", narrative.text);
    println!();
}
