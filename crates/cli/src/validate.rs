use colored::Colorize;
use idn_flows::{FlowDeps, FlowKind, FlowOutline};
use serde::Serialize;

/// Validation result for a single flow definition
#[derive(Debug, Serialize)]
pub struct ValidationResult {
    pub flow: String,
    pub success: bool,
    pub states: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn success(outline: &FlowOutline) -> Self {
        Self {
            flow: outline.id.clone(),
            success: true,
            states: outline.states.len(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn failure(flow: FlowKind, error: String) -> Self {
        Self {
            flow: flow.name().to_string(),
            success: false,
            states: 0,
            errors: vec![error],
            warnings: Vec::new(),
        }
    }
}

/// Build every flow definition against `deps`
pub fn validate_all(deps: &FlowDeps) -> Vec<ValidationResult> {
    FlowKind::ALL
        .into_iter()
        .map(|kind| validate_flow(kind, deps))
        .collect()
}

pub fn validate_flow(kind: FlowKind, deps: &FlowDeps) -> ValidationResult {
    match kind.outline(deps) {
        Ok(outline) => {
            let mut result = ValidationResult::success(&outline);
            check_outline(&outline, &mut result);
            result
        }
        Err(e) => ValidationResult::failure(kind, e.to_string()),
    }
}

/// Warnings for definitions that build but look suspicious
fn check_outline(outline: &FlowOutline, result: &mut ValidationResult) {
    for entry in &outline.states {
        if entry.kind == "atomic" && entry.invoke.is_none() && entry.events.is_empty() {
            result
                .warnings
                .push(format!("State '{}' has no way out", entry.path));
        }
    }
    if outline.events.is_empty() {
        result.warnings.push("Flow accepts no events".to_string());
    }
}

/// Print validation results in a human-readable format
pub fn print_results(results: &[ValidationResult], verbose: bool) {
    let total = results.len();
    let successful = results.iter().filter(|r| r.success).count();
    let failed = total - successful;

    println!();
    println!("{}", "Validation Results".bold());
    println!("{}", "==================".bold());
    println!();

    for result in results {
        if result.success {
            println!(
                "{} {} {}",
                "✓".green().bold(),
                result.flow.green(),
                format!("({} states)", result.states).dimmed()
            );
        } else {
            println!("{} {}", "✗".red().bold(), result.flow.red());
            for error in &result.errors {
                println!("  {} {}", "✗".red(), error.red());
            }
        }

        if verbose {
            for warning in &result.warnings {
                println!("  {} {}", "⚠".yellow(), warning.yellow());
            }
        }
    }

    println!();
    println!("{}", "Summary".bold());
    println!("{}", "-------".bold());
    println!("Total:      {}", total);
    println!("Successful: {}", successful.to_string().green());
    if failed > 0 {
        println!("Failed:     {}", failed.to_string().red());
    } else {
        println!("Failed:     {}", failed);
    }
    println!();

    if failed == 0 {
        println!("{}", "All flow definitions are valid ✓".green().bold());
    } else {
        println!("{}", format!("{} definition(s) failed", failed).red().bold());
    }
}

#[derive(Serialize)]
struct Summary {
    total: usize,
    successful: usize,
    failed: usize,
}

#[derive(Serialize)]
struct Report<'a> {
    summary: Summary,
    results: &'a [ValidationResult],
}

/// Print results in JSON format
pub fn print_results_json(results: &[ValidationResult]) -> serde_json::Result<()> {
    let successful = results.iter().filter(|r| r.success).count();
    let report = Report {
        summary: Summary {
            total: results.len(),
            successful,
            failed: results.len() - successful,
        },
        results,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print the state tree of one flow
pub fn print_outline(outline: &FlowOutline) {
    println!("{} {}", "Flow".bold(), outline.id.cyan().bold());
    println!();

    for entry in &outline.states {
        let indent = "  ".repeat(entry.path.depth().saturating_sub(1));
        let name = entry.path.leaf().unwrap_or_default();
        let mut line = format!("{}{} {}", indent, name.bold(), format!("[{}]", entry.kind).dimmed());
        if let Some(initial) = &entry.initial {
            line.push_str(&format!(" initial={}", initial));
        }
        if let Some(invoke) = &entry.invoke {
            line.push_str(&format!(" invoke={}", invoke.magenta()));
        }
        println!("{}", line);
        for event in &entry.events {
            println!("{}  {} {}", indent, "on".dimmed(), event.yellow());
        }
    }

    println!();
    println!("{} {}", "Events:".bold(), outline.events.join(", "));
}
