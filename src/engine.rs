//! Orchestration of a mutation-test run.
//!
//! Discovery and mutant generation are single-threaded: they share the
//! in-memory method-body template and must not interleave. Execution fans
//! out to a bounded worker pool per operator stream; each worker owns one
//! isolated directory and one external process, and appends results to the
//! shared report under a lock. Operators run strictly one after another —
//! all of an operator's mutants are scored before the next operator touches
//! the template.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded};

use crate::assembly::{MethodLocation, Module, ModuleCache};
use crate::config::RunConfig;
use crate::discovery::{build_closure, find_candidate_tests};
use crate::il::SequencePoint;
use crate::isolate::{IsolatedTestArea, Isolator};
use crate::process::{run_with_timeout, SystemProcessTree};
use crate::report::MutationReport;
use crate::resolve::resolve_method;
use crate::runner::{ConsoleRunner, TestRunner};
use crate::source::source_excerpt;
use crate::turtles::{expand_targets, MutantStream};
use crate::ui::Ui;

/// Aggregate counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Mutants planned across all operators (before any limit).
    pub discovered: usize,
    pub killed: usize,
    pub survived: usize,
}

impl RunSummary {
    pub fn executed(&self) -> usize {
        self.killed + self.survived
    }

    /// The run passes when no mutant survived. Zero mutants is a pass.
    pub fn passed(&self) -> bool {
        self.survived == 0
    }
}

struct ExecutableMutant {
    id: usize,
    description: String,
    location: Option<SequencePoint>,
    area: IsolatedTestArea,
}

struct MutantResult {
    id: usize,
    description: String,
    killed: bool,
    duration_ms: u64,
    retained_dir: Option<PathBuf>,
    location: Option<SequencePoint>,
    error: Option<String>,
}

/// One configured mutation-test run.
pub struct MutationTest {
    config: RunConfig,
}

impl MutationTest {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, ui: &mut Ui) -> Result<RunSummary> {
        let mut module = Module::load(&self.config.assembly)?;
        let test_module = Module::load(&self.config.test_assembly)?;

        let search_dir = self
            .config
            .assembly
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let mut cache = ModuleCache::new(search_dir);

        let location =
            resolve_method(&module, &self.config.target).into_location(&self.config.target)?;
        let qualified = qualified_signature(&module, &location);
        ui.line(format!("target: {qualified}"));

        // Fail fast when the runner is not installed.
        let runner = ConsoleRunner::new(self.config.runner_program.clone());
        runner.self_check()?;

        let mut report = MutationReport::default();

        let closure = build_closure(&module, &mut cache, &location);
        let target_type_name = module.type_at(&location.type_path).full_name.clone();
        let tests = match find_candidate_tests(&test_module, &target_type_name, &closure) {
            Ok(tests) => tests,
            Err(e) => {
                report.register_method(&qualified, false);
                self.write_report(&report)?;
                return Err(e.into());
            }
        };
        ui.line(format!("found {} candidate test(s)", tests.len()));

        report.register_method(&qualified, true);

        let assembly_file = file_name_of(&self.config.assembly)?;
        let test_assembly_file = file_name_of(&self.config.test_assembly)?;
        let test_dir = self
            .config
            .test_assembly
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let isolator = Isolator::new(
            self.config.isolation,
            test_dir,
            vec![assembly_file.clone()],
        );

        let expanded = expand_targets(&module, &location);

        let report = Mutex::new(report);
        let killed_count = AtomicUsize::new(0);
        let survived_count = AtomicUsize::new(0);
        let mut summary = RunSummary::default();
        let mut next_id = 1usize;

        for kind in &self.config.turtles {
            let turtle = kind.instantiate();
            ui.title(format!("--- {}: {} ---", turtle.name(), turtle.description()));

            let mut remaining = self.config.mutant_limit;
            let mut planned_for_turtle = 0usize;
            for loc in &expanded {
                let Some(mut stream) = MutantStream::new(&mut module, loc.clone(), turtle.as_ref())
                else {
                    continue;
                };
                planned_for_turtle += stream.len();
                summary.discovered += stream.len();
                if stream.is_empty() {
                    continue;
                }
                self.run_stream(StreamContext {
                    stream: &mut stream,
                    isolator: &isolator,
                    assembly_file: &assembly_file,
                    runner: &runner,
                    test_assembly_file: &test_assembly_file,
                    tests: &tests,
                    qualified: &qualified,
                    report: &report,
                    killed_count: &killed_count,
                    survived_count: &survived_count,
                    remaining: &mut remaining,
                    next_id: &mut next_id,
                    ui: &mut *ui,
                })?;
            }
            if planned_for_turtle == 0 {
                // Not a failure: the pattern simply does not occur.
                ui.line(format!("{}: no mutations generated", turtle.name()));
            }
        }

        summary.killed = killed_count.load(Ordering::SeqCst);
        summary.survived = survived_count.load(Ordering::SeqCst);

        let report = report.into_inner().unwrap_or_else(|p| p.into_inner());
        self.write_report(&report)?;

        ui.line(format!(
            "mutants: {} discovered, {} executed, {} killed, {} survived",
            summary.discovered,
            summary.executed(),
            summary.killed,
            summary.survived
        ));
        Ok(summary)
    }

    fn write_report(&self, report: &MutationReport) -> Result<()> {
        if let Some(path) = &self.config.report_path {
            report.write(path, self.config.report_mode)?;
        }
        Ok(())
    }

    /// Generate mutants on this thread (the template is not thread-safe) and
    /// fan their evaluation out to the worker pool.
    fn run_stream(&self, ctx: StreamContext<'_, '_>) -> Result<()> {
        let StreamContext {
            stream,
            isolator,
            assembly_file,
            runner,
            test_assembly_file,
            tests,
            qualified,
            report,
            killed_count,
            survived_count,
            remaining,
            next_id,
            ui,
        } = ctx;

        let timeout = self.config.timeout;
        let workers = self.config.workers;
        let original_sps = stream.original_sequence_points().to_vec();

        let (work_tx, work_rx) = bounded::<ExecutableMutant>(workers);
        let (res_tx, res_rx) = unbounded::<MutantResult>();

        std::thread::scope(|scope| -> Result<()> {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let res_tx = res_tx.clone();
                scope.spawn(move || {
                    let mut tree = SystemProcessTree::new();
                    while let Ok(mutant) = work_rx.recv() {
                        let result =
                            evaluate(mutant, runner, test_assembly_file, tests, timeout, &mut tree);
                        {
                            let mut rep = report.lock().unwrap_or_else(|p| p.into_inner());
                            rep.add_result(
                                qualified,
                                result.location.as_ref(),
                                &result.description,
                                result.killed,
                            );
                        }
                        if result.killed {
                            killed_count.fetch_add(1, Ordering::SeqCst);
                        } else {
                            survived_count.fetch_add(1, Ordering::SeqCst);
                        }
                        if res_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(res_tx);

            loop {
                if matches!(remaining, Some(0)) {
                    break;
                }
                let Some(pending) = stream.advance() else {
                    break;
                };

                let area = isolator.prepare()?;
                pending
                    .module
                    .write(&area.path().join(assembly_file))
                    .context("failed to materialize mutated assembly")?;

                let mutant = ExecutableMutant {
                    id: *next_id,
                    description: pending.description.clone(),
                    location: location_for(&original_sps, pending.offset),
                    area,
                };
                *next_id += 1;
                if let Some(r) = remaining.as_mut() {
                    *r -= 1;
                }
                drop(pending);

                if work_tx.send(mutant).is_err() {
                    break;
                }
                while let Ok(result) = res_rx.try_recv() {
                    print_result(ui, result);
                }
            }
            drop(work_tx);
            stream.finish();

            while let Ok(result) = res_rx.recv() {
                print_result(ui, result);
            }
            Ok(())
        })
    }
}

struct StreamContext<'a, 'm> {
    stream: &'a mut MutantStream<'m>,
    isolator: &'a Isolator,
    assembly_file: &'a str,
    runner: &'a ConsoleRunner,
    test_assembly_file: &'a str,
    tests: &'a [String],
    qualified: &'a str,
    report: &'a Mutex<MutationReport>,
    killed_count: &'a AtomicUsize,
    survived_count: &'a AtomicUsize,
    remaining: &'a mut Option<usize>,
    next_id: &'a mut usize,
    ui: &'a mut Ui,
}

/// Run one mutant's candidate tests and classify the outcome. Survival
/// requires a normal exit with code 0 inside the deadline; every fault —
/// timeout, crash, unreadable exit code — conservatively counts as killed
/// and never aborts the run.
fn evaluate(
    mutant: ExecutableMutant,
    runner: &dyn TestRunner,
    test_assembly_file: &str,
    tests: &[String],
    timeout: Duration,
    tree: &mut SystemProcessTree,
) -> MutantResult {
    let outcome = runner
        .command(mutant.area.path(), test_assembly_file, tests)
        .map_err(anyhow::Error::from)
        .and_then(|mut cmd| run_with_timeout(&mut cmd, timeout, tree));

    match outcome {
        Ok(run) => {
            let survived = survives(&run);
            let retained_dir = if survived {
                Some(mutant.area.retain())
            } else {
                None
            };
            MutantResult {
                id: mutant.id,
                description: mutant.description,
                killed: !survived,
                duration_ms: run.duration.as_millis() as u64,
                retained_dir,
                location: mutant.location,
                error: None,
            }
        }
        Err(e) => MutantResult {
            id: mutant.id,
            description: mutant.description,
            killed: true,
            duration_ms: 0,
            retained_dir: None,
            location: mutant.location,
            error: Some(e.to_string()),
        },
    }
}

fn print_result(ui: &mut Ui, result: MutantResult) {
    if let Some(error) = &result.error {
        ui.runner_error(format!("mutant {}: {error}", result.id));
    }
    if result.killed {
        ui.mutant_killed(result.id, &result.description, result.duration_ms);
    } else if let Some(dir) = &result.retained_dir {
        let excerpt = result
            .location
            .as_ref()
            .and_then(|sp| source_excerpt(sp, 2));
        ui.mutant_survived(result.id, &result.description, dir, excerpt.as_deref());
    }
}

/// A mutant survives iff the runner exited inside the deadline with the
/// success exit code. Timeouts, kills, and non-zero exits all kill.
fn survives(run: &crate::process::BoundedRun) -> bool {
    !run.timed_out && run.exit_code == Some(0)
}

fn location_for(points: &[SequencePoint], offset: u32) -> Option<SequencePoint> {
    points
        .iter()
        .filter(|sp| sp.offset <= offset)
        .max_by_key(|sp| sp.offset)
        .cloned()
}

fn qualified_signature(module: &Module, location: &MethodLocation) -> String {
    let type_def = module.type_at(&location.type_path);
    let method = &type_def.methods[location.method_index];
    format!(
        "{} {}::{}({})",
        method.return_type,
        type_def.runner_name(),
        method.name,
        method.parameter_type_names().join(", ")
    )
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("path {:?} has no file name", path))
}
