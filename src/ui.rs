use std::env;
use std::fmt::Display;
use std::path::Path;

use console::{style, Term};

/// Small UI helper: human output to stdout, errors to stderr, fancy styling
/// only on a real TTY with `NO_COLOR`/`CI` unset. Outcome counters make the
/// behavior observable for unit tests without parsing terminal output.
#[derive(Debug, Clone)]
pub struct Ui {
    out: Term,
    err: Term,
    fancy: bool,
    enabled: bool,

    killed: u64,
    survived: u64,
    runner_errors: u64,
}

impl Ui {
    pub fn new() -> Self {
        let out = Term::stdout();
        let err = Term::stderr();

        let no_color = env::var_os("NO_COLOR").is_some();
        let in_ci = env::var_os("CI").is_some();
        let fancy = out.is_term() && !no_color && !in_ci;

        Self {
            out,
            err,
            fancy,
            enabled: true,
            killed: 0,
            survived: 0,
            runner_errors: 0,
        }
    }

    /// Counting-only Ui for unit tests.
    #[cfg(test)]
    pub fn silent() -> Self {
        Self {
            out: Term::stdout(),
            err: Term::stderr(),
            fancy: false,
            enabled: false,
            killed: 0,
            survived: 0,
            runner_errors: 0,
        }
    }

    fn write_out(&self, s: &str) {
        if self.enabled {
            let _ = self.out.write_line(s);
        }
    }

    fn write_err(&self, s: &str) {
        if self.enabled {
            let _ = self.err.write_line(s);
        }
    }

    pub fn line(&self, msg: impl Display) {
        self.write_out(&msg.to_string());
    }

    pub fn title(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_out(&style(s).bold().to_string());
        } else {
            self.write_out(&s);
        }
    }

    pub fn error(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_err(&style(s).red().bold().to_string());
        } else {
            self.write_err(&s);
        }
    }

    pub fn runner_error(&mut self, msg: impl Display) {
        self.runner_errors += 1;
        self.error(msg);
    }

    pub fn mutant_killed(&mut self, id: usize, description: &str, duration_ms: u64) {
        self.killed = self.killed.saturating_add(1);
        if self.fancy {
            let tag = style("KILLED").red().bold();
            self.line(format!("{tag} {duration_ms:>6}ms  #{id} {description}"));
        } else {
            self.line(format!(
                "mutant {id} killed (tests failed under mutation): {description}"
            ));
        }
    }

    /// A survivor is the interesting case: print where the retained copy
    /// lives and the source around the mutation when symbols allow it.
    pub fn mutant_survived(
        &mut self,
        id: usize,
        description: &str,
        retained_dir: &Path,
        excerpt: Option<&str>,
    ) {
        self.survived = self.survived.saturating_add(1);
        if self.fancy {
            let tag = style("SURVIVED").green().bold();
            self.line(format!("{tag} #{id} {description}"));
        } else {
            self.line(format!(
                "mutant {id} survived (tests still pass): {description}"
            ));
        }
        self.line(format!("  retained: {}", retained_dir.display()));
        match excerpt {
            Some(text) => {
                for l in text.lines() {
                    self.line(format!("  {l}"));
                }
            }
            None => self.line("  source unavailable"),
        }
    }

    pub fn killed_count(&self) -> u64 {
        self.killed
    }

    pub fn survived_count(&self) -> u64 {
        self.survived
    }

    #[allow(dead_code)]
    pub fn is_fancy(&self) -> bool {
        self.fancy && self.enabled
    }
}

impl Default for Ui {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn outcome_counters_track_progress_lines() {
        let mut ui = Ui::silent();
        ui.mutant_killed(1, "IL_0002: add -> sub", 12);
        ui.mutant_killed(2, "IL_0002: add -> mul", 9);
        ui.mutant_survived(3, "IL_0002: add -> div", &PathBuf::from("/tmp/x"), None);

        assert_eq!(ui.killed_count(), 2);
        assert_eq!(ui.survived_count(), 1);
    }

    #[test]
    fn runner_errors_are_counted() {
        let mut ui = Ui::silent();
        assert_eq!(ui.runner_errors, 0);
        ui.runner_error("boom");
        ui.runner_error("boom again");
        assert_eq!(ui.runner_errors, 2);
    }
}
