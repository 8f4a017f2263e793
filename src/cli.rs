use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::RunConfig;
use crate::engine::MutationTest;
use crate::isolate::IsolationStrategy;
use crate::report::ReportMode;
use crate::scan::{scan_assembly, AssemblyOverview};
use crate::turtles::TurtleKind;
use crate::ui::Ui;

const EXIT_ERROR: i32 = 1;
const EXIT_SURVIVORS: i32 = 2;

/// Top-level CLI arguments for the `cil-mutant` binary.
#[derive(Debug, Parser)]
#[command(
    name = "cil-mutant",
    version,
    about = "Mutation testing for CLR assemblies"
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands supported by `cil-mutant`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Summarize a module image and its mutation opportunities.
    Scan {
        /// Path to the module image to scan.
        #[arg(long)]
        assembly: PathBuf,
    },

    /// Run mutation testing against one target method.
    Run {
        /// Module image of the assembly under test.
        #[arg(long)]
        assembly: PathBuf,

        /// Module image of the test assembly.
        #[arg(long)]
        test_assembly: PathBuf,

        /// Full name of the type declaring the target method.
        #[arg(long = "type")]
        type_name: String,

        /// Name of the target method.
        #[arg(long)]
        method: String,

        /// Parameter type names disambiguating an overloaded target
        /// (repeat the flag, in order).
        #[arg(long = "parameter-type")]
        parameter_types: Vec<String>,

        /// Mutation operators to apply (default: all built-in operators).
        #[arg(long = "turtle", value_enum)]
        turtles: Vec<TurtleKind>,

        /// Test-runner program name or path.
        #[arg(long, default_value = "nunit3-console")]
        runner: String,

        /// Per-mutant test-run timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Bounded worker pool size for mutant execution.
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Isolation strategy for per-mutant test directories.
        #[arg(long, value_enum, default_value = "full-copy")]
        isolation: IsolationStrategy,

        /// Write the mutation report to this file.
        #[arg(long)]
        report: Option<PathBuf>,

        /// What to do with an existing report file.
        #[arg(long, value_enum, default_value = "overwrite")]
        report_mode: ReportMode,

        /// Run only the first N mutants of each operator.
        #[arg(long)]
        limit: Option<usize>,
    },
}

/// Parse CLI arguments and dispatch the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scan { assembly } => {
            println!("cil-mutant: scan");
            match scan_assembly(&assembly) {
                Ok(overview) => print_scan_summary(&overview),
                Err(e) => {
                    eprintln!("failed to analyze module image {:?}: {e}", assembly);
                    std::process::exit(EXIT_ERROR);
                }
            }
            Ok(())
        }

        Command::Run {
            assembly,
            test_assembly,
            type_name,
            method,
            parameter_types,
            turtles,
            runner,
            timeout_secs,
            workers,
            isolation,
            report,
            report_mode,
            limit,
        } => {
            let mut builder = RunConfig::for_method(assembly, test_assembly, type_name, method)
                .with_turtles(turtles)
                .with_runner(runner)
                .with_timeout(Duration::from_secs(timeout_secs))
                .with_workers(workers)
                .with_isolation(isolation);
            if !parameter_types.is_empty() {
                builder = builder.with_parameter_types(parameter_types);
            }
            if let Some(path) = report {
                builder = builder.write_report_to(path, report_mode);
            }
            if let Some(limit) = limit {
                builder = builder.with_limit(limit);
            }

            let mut ui = Ui::new();
            ui.line("cil-mutant: run");

            match MutationTest::new(builder.build()).run(&mut ui) {
                Ok(summary) if summary.passed() => Ok(()),
                Ok(summary) => {
                    ui.error(format!(
                        "mutation testing failed: {} mutant(s) survived",
                        summary.survived
                    ));
                    std::process::exit(EXIT_SURVIVORS);
                }
                Err(e) => {
                    ui.error(format!("{e:#}"));
                    std::process::exit(EXIT_ERROR);
                }
            }
        }
    }
}

/// Print a short summary based on the assembly overview.
fn print_scan_summary(overview: &AssemblyOverview) {
    println!("--- assembly overview ---");
    println!("image:                {}", overview.path.display());
    println!("assembly:             {}", overview.assembly_name);
    println!("types:                {}", overview.types);
    println!("methods:              {}", overview.methods);
    println!("methods with body:    {}", overview.methods_with_body);
    println!("instructions:         {}", overview.instructions);
    println!("methods with symbols: {}", overview.methods_with_symbols);
    for (name, count) in &overview.operator_candidates {
        println!("{name:<21} {count} candidate mutation(s)");
    }
}
