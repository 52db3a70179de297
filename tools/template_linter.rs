/// Template Linter: checks narrative templates against the field mappings.
///
/// Usage: template_linter <templates.ron> <field_mappings.ron>
use sae_narrative::core::mapping::FieldMappings;
use sae_narrative::core::template::{Severity, TemplateSet};
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        println!("Usage: template_linter <templates.ron> <field_mappings.ron>");
        process::exit(0);
    }
    if args.len() != 3 {
        eprintln!("Usage: template_linter <templates.ron> <field_mappings.ron>");
        process::exit(2);
    }

    let templates = match TemplateSet::load_from_ron(Path::new(&args[1])) {
        Ok(templates) => templates,
        Err(e) => {
            eprintln!("ERROR: failed to load templates: {e}");
            process::exit(1);
        }
    };
    let mappings = match FieldMappings::load_from_ron(Path::new(&args[2])) {
        Ok(mappings) => mappings,
        Err(e) => {
            eprintln!("ERROR: failed to load field mappings: {e}");
            process::exit(1);
        }
    };

    println!(
        "Loaded {} templates and {} field mappings",
        templates.len(),
        mappings.fields.len()
    );

    let issues = templates.lint(&mappings);
    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    let warnings = issues.len() - errors;
    for issue in &issues {
        println!("{issue}");
    }
    println!("\n{errors} errors, {warnings} warnings");

    if errors > 0 {
        process::exit(1);
    }
}
