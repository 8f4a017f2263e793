use std::path::PathBuf;
use std::time::Duration;

use crate::isolate::IsolationStrategy;
use crate::report::ReportMode;
use crate::resolve::TargetDescriptor;
use crate::turtles::TurtleKind;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 4;

/// Immutable configuration for one mutation-test run. Built once through
/// [`RunConfigBuilder`] and handed to the engine; nothing here is mutated
/// after the run begins.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Module image of the assembly under test.
    pub assembly: PathBuf,
    /// Module image of the test assembly.
    pub test_assembly: PathBuf,
    pub target: TargetDescriptor,
    pub turtles: Vec<TurtleKind>,
    pub runner_program: String,
    pub timeout: Duration,
    pub workers: usize,
    pub isolation: IsolationStrategy,
    pub report_path: Option<PathBuf>,
    pub report_mode: ReportMode,
    /// Run only the first N mutants of each operator.
    pub mutant_limit: Option<usize>,
}

impl RunConfig {
    pub fn for_method(
        assembly: impl Into<PathBuf>,
        test_assembly: impl Into<PathBuf>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> RunConfigBuilder {
        RunConfigBuilder {
            config: RunConfig {
                assembly: assembly.into(),
                test_assembly: test_assembly.into(),
                target: TargetDescriptor::new(type_name, method_name),
                turtles: TurtleKind::all(),
                runner_program: "nunit3-console".to_string(),
                timeout: DEFAULT_TIMEOUT,
                workers: DEFAULT_WORKERS,
                isolation: IsolationStrategy::FullCopy,
                report_path: None,
                report_mode: ReportMode::Overwrite,
                mutant_limit: None,
            },
        }
    }
}

/// Fluent builder yielding a [`RunConfig`] value.
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Disambiguate an overloaded target method.
    pub fn with_parameter_types(mut self, parameter_types: Vec<String>) -> Self {
        self.config.target.parameter_types = Some(parameter_types);
        self
    }

    pub fn with_return_type(mut self, return_type: impl Into<String>) -> Self {
        self.config.target.return_type = Some(return_type.into());
        self
    }

    pub fn with_generic_arity(mut self, arity: u16) -> Self {
        self.config.target.generic_arity = Some(arity);
        self
    }

    pub fn with_turtles(mut self, turtles: Vec<TurtleKind>) -> Self {
        if !turtles.is_empty() {
            self.config.turtles = turtles;
        }
        self
    }

    pub fn with_runner(mut self, program: impl Into<String>) -> Self {
        self.config.runner_program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn with_isolation(mut self, strategy: IsolationStrategy) -> Self {
        self.config.isolation = strategy;
        self
    }

    pub fn write_report_to(mut self, path: impl Into<PathBuf>, mode: ReportMode) -> Self {
        self.config.report_path = Some(path.into());
        self.config.report_mode = mode;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.config.mutant_limit = Some(limit);
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}
