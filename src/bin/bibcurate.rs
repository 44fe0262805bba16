use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use bibcurate::curate::{CurateOptions, curate_bibliography};
use bibcurate::validate::{ValidationReport, validate_bibliography};
use bibcurate::project;

/// Curate and validate BibTeX bibliographies alongside LaTeX documents.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Action>,

    /// Project directory to operate on
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Skip creating backup files during curation
    #[arg(long, global = true)]
    no_backup: bool,

    /// Skip the confirmation prompt and proceed automatically
    #[arg(short, long, global = true)]
    yes: bool,

    /// Do not modify citation keys (skip sanitization and consolidation)
    #[arg(long, global = true)]
    preserve_keys: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Action {
    /// Only check the bibliography; modifies nothing
    Validate,
    /// Clean up the bibliography in place
    Curate,
    /// Validate, curate, then validate again (the default)
    Polish,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let root = cli.root.clone();

    let bib_files = project::collect_bib_files(&root);
    if bib_files.is_empty() {
        eprintln!(
            "No .bib files found in {} (sections/ or project root)",
            root.display()
        );
        return ExitCode::FAILURE;
    }

    let options = CurateOptions {
        create_backups: !cli.no_backup,
        preserve_keys: cli.preserve_keys,
        use_external_tools: true,
    };

    match cli.command.unwrap_or(Action::Polish) {
        Action::Validate => {
            let report = validate_bibliography(&root);
            print_report(&report);
            exit_for(&report)
        }
        Action::Curate => {
            if !confirmed(cli.yes, "curation") {
                println!("Aborted.");
                return ExitCode::SUCCESS;
            }
            curate_bibliography(&root, &bib_files, &options);
            ExitCode::SUCCESS
        }
        Action::Polish => {
            if !confirmed(cli.yes, "polishing") {
                println!("Aborted.");
                return ExitCode::SUCCESS;
            }
            banner("Step 1: Initial validation");
            print_report(&validate_bibliography(&root));

            banner("Step 2: Curation and cleanup");
            curate_bibliography(&root, &bib_files, &options);

            banner("Step 3: Final validation");
            let report = validate_bibliography(&root);
            print_report(&report);
            exit_for(&report)
        }
    }
}

fn confirmed(skip_prompt: bool, action: &str) -> bool {
    if skip_prompt {
        return true;
    }
    Confirm::new()
        .with_prompt(format!(
            "Proceed with {action}? This will modify files in place."
        ))
        .default(false)
        .interact()
        .unwrap_or(false)
}

fn banner(title: &str) {
    println!("\n{}", "=".repeat(70));
    println!("{title}");
    println!("{}", "=".repeat(70));
}

fn print_report(report: &ValidationReport) {
    for issue in &report.issues {
        println!("{}", issue.to_string().red());
    }
    println!(
        "Summary: {}/{} citations valid",
        report.citations_valid, report.citations_total
    );
    for stats in &report.stats {
        println!("\n{}:", stats.path.display());
        println!("  Total entries: {}", stats.entry_count);
        if stats.entry_count > 0 {
            let pct = 100.0 * stats.with_doi as f64 / stats.entry_count as f64;
            println!("  Entries with DOI: {} ({pct:.1}%)", stats.with_doi);
        } else {
            println!("  Entries with DOI: 0 (N/A)");
        }
    }
    if report.passed() {
        println!("\n{}", "No issues found.".green());
    } else {
        println!(
            "\n{}",
            format!("{} issue(s) found.", report.issues.len()).yellow()
        );
    }
}

fn exit_for(report: &ValidationReport) -> ExitCode {
    if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
