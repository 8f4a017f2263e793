//! External test-runner processes.
//!
//! The engine never interprets test output: a runner is a program that takes
//! the test assembly and a test list and reports overall success through exit
//! code 0. Locating the executable is the expensive part, so it is memoized
//! for the lifetime of the runner value (one per mutation-test run).

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use crate::error::EngineError;

pub trait TestRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Validate that the runner is installed and discoverable. Raises a
    /// setup error naming every searched location when it is not.
    fn self_check(&self) -> Result<PathBuf, EngineError>;

    /// A not-yet-started process that executes exactly `tests` against the
    /// test assembly inside `test_dir`.
    fn command(
        &self,
        test_dir: &Path,
        test_assembly_file: &str,
        tests: &[String],
    ) -> Result<Command, EngineError>;
}

/// Conventional console runner: found on `PATH` (or in explicit extra
/// directories), invoked as `<exe> <assembly> --test=<comma list>`.
pub struct ConsoleRunner {
    program: String,
    extra_search_dirs: Vec<PathBuf>,
    located: OnceLock<Option<PathBuf>>,
}

impl ConsoleRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_search_dirs: Vec::new(),
            located: OnceLock::new(),
        }
    }

    /// The default unit-test runner.
    pub fn nunit() -> Self {
        Self::new("nunit3-console")
    }

    pub fn with_search_dir(mut self, dir: PathBuf) -> Self {
        self.extra_search_dirs.push(dir);
        self
    }

    fn executable_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.program)
        } else {
            self.program.clone()
        }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.extra_search_dirs.clone();
        if let Some(path) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&path));
        }
        dirs
    }

    fn locate(&self) -> Option<PathBuf> {
        self.located
            .get_or_init(|| {
                // A program given as a path is used as-is.
                let direct = Path::new(&self.program);
                if direct.components().count() > 1 && direct.is_file() {
                    return Some(direct.to_path_buf());
                }
                let exe = self.executable_name();
                self.search_dirs()
                    .into_iter()
                    .map(|dir| dir.join(&exe))
                    .find(|candidate| candidate.is_file())
            })
            .clone()
    }
}

impl TestRunner for ConsoleRunner {
    fn name(&self) -> &str {
        &self.program
    }

    fn self_check(&self) -> Result<PathBuf, EngineError> {
        self.locate().ok_or_else(|| EngineError::RunnerNotFound {
            program: self.program.clone(),
            searched: self.search_dirs(),
        })
    }

    fn command(
        &self,
        test_dir: &Path,
        test_assembly_file: &str,
        tests: &[String],
    ) -> Result<Command, EngineError> {
        let exe = self.self_check()?;
        let mut cmd = Command::new(exe);
        cmd.current_dir(test_dir);
        cmd.arg(test_assembly_file);
        if !tests.is_empty() {
            cmd.arg(format!("--test={}", tests.join(",")));
        }
        Ok(cmd)
    }
}
