//! Bounded execution of external test-runner processes.
//!
//! Runners may spawn worker children; a timeout therefore kills the whole
//! descendant tree, not just the direct child. OS process enumeration sits
//! behind the small [`ProcessTree`] capability trait so the pipeline stays
//! platform-agnostic.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sysinfo::{Pid, System};
use wait_timeout::ChildExt;

/// Platform capability: enumerate direct children of a process and
/// force-kill one.
pub trait ProcessTree {
    fn children_of(&mut self, pid: u32) -> Vec<u32>;
    fn force_kill(&mut self, pid: u32) -> bool;
}

/// sysinfo-backed implementation.
pub struct SystemProcessTree {
    sys: System,
}

impl SystemProcessTree {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SystemProcessTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTree for SystemProcessTree {
    fn children_of(&mut self, pid: u32) -> Vec<u32> {
        self.sys.refresh_processes();
        let parent = Pid::from_u32(pid);
        self.sys
            .processes()
            .iter()
            .filter(|(_, p)| p.parent() == Some(parent))
            .map(|(child, _)| child.as_u32())
            .collect()
    }

    fn force_kill(&mut self, pid: u32) -> bool {
        self.sys
            .process(Pid::from_u32(pid))
            .map(|p| p.kill())
            .unwrap_or(false)
    }
}

/// Kill `root` and every transitive descendant, deepest first so children
/// cannot be reparented mid-walk.
pub fn kill_process_tree(tree: &mut dyn ProcessTree, root: u32) {
    let mut order = vec![root];
    let mut i = 0;
    while i < order.len() {
        let mut kids = tree.children_of(order[i]);
        kids.retain(|k| !order.contains(k));
        order.extend(kids);
        i += 1;
    }
    for pid in order.iter().rev() {
        let _ = tree.force_kill(*pid);
    }
}

/// Outcome of one bounded process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedRun {
    /// Exit code, when the process exited normally within the deadline.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Start the process and wait up to `timeout`. On expiry the process tree is
/// forcibly terminated; errors reading state after a kill are swallowed and
/// the run reports as timed out.
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
    tree: &mut dyn ProcessTree,
) -> Result<BoundedRun> {
    let start = Instant::now();
    let mut child = command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to start test runner process")?;

    match child
        .wait_timeout(timeout)
        .context("failed to wait for test runner process")?
    {
        Some(status) => Ok(BoundedRun {
            exit_code: status.code(),
            timed_out: false,
            duration: start.elapsed(),
        }),
        None => {
            kill_process_tree(tree, child.id());
            let _ = child.kill();
            let _ = child.wait();
            Ok(BoundedRun {
                exit_code: None,
                timed_out: true,
                duration: start.elapsed(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeTree {
        children: HashMap<u32, Vec<u32>>,
        killed: Vec<u32>,
    }

    impl ProcessTree for FakeTree {
        fn children_of(&mut self, pid: u32) -> Vec<u32> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }

        fn force_kill(&mut self, pid: u32) -> bool {
            self.killed.push(pid);
            true
        }
    }

    #[test]
    fn tree_kill_reaches_descendants_before_the_root() {
        let mut tree = FakeTree {
            children: HashMap::from([(1, vec![2, 3]), (3, vec![4])]),
            killed: Vec::new(),
        };
        kill_process_tree(&mut tree, 1);
        assert_eq!(tree.killed, vec![4, 3, 2, 1]);
    }

    #[test]
    fn cyclic_parent_links_do_not_loop_forever() {
        let mut tree = FakeTree {
            children: HashMap::from([(1, vec![2]), (2, vec![1])]),
            killed: Vec::new(),
        };
        kill_process_tree(&mut tree, 1);
        assert_eq!(tree.killed, vec![2, 1]);
    }

    #[cfg(unix)]
    #[test]
    fn fast_processes_report_their_exit_code() {
        let mut tree = FakeTree {
            children: HashMap::new(),
            killed: Vec::new(),
        };
        let run = run_with_timeout(
            &mut Command::new("true"),
            Duration::from_secs(5),
            &mut tree,
        )
        .unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert!(!run.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn hung_processes_are_killed_and_flagged() {
        let mut tree = FakeTree {
            children: HashMap::new(),
            killed: Vec::new(),
        };
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let run = run_with_timeout(&mut cmd, Duration::from_millis(200), &mut tree).unwrap();
        assert!(run.timed_out);
        assert_eq!(run.exit_code, None);
        assert_eq!(tree.killed.len(), 1);
    }
}
