//! Per-mutant filesystem isolation.
//!
//! Every mutant gets a private directory holding the test assembly's
//! directory contents. [`IsolationStrategy::FullCopy`] copies everything;
//! [`IsolationStrategy::LinkWithOverrides`] symlinks all files except the
//! ones the mutation overwrites, which must be real copies. Killed mutants'
//! directories vanish on drop; survivors' are retained for inspection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsolationStrategy {
    /// Copy the whole test directory per mutant.
    FullCopy,
    /// Symlink everything except the override list. Cheaper when only the
    /// mutated assembly actually differs.
    LinkWithOverrides,
}

/// Private directory for a single mutant. Deleted on drop unless retained.
pub struct IsolatedTestArea {
    temp: Option<TempDir>,
    path: PathBuf,
}

impl IsolatedTestArea {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory on disk (a surviving mutant is worth inspecting)
    /// and return its path.
    pub fn retain(mut self) -> PathBuf {
        match self.temp.take() {
            Some(temp) => temp.keep(),
            None => self.path.clone(),
        }
    }
}

/// Prepares isolated test areas from one source directory.
pub struct Isolator {
    strategy: IsolationStrategy,
    source_dir: PathBuf,
    overrides: Vec<String>,
}

impl Isolator {
    /// `overrides` lists the file names the caller will overwrite inside each
    /// area; under the link strategy those are the only real copies.
    pub fn new(strategy: IsolationStrategy, source_dir: PathBuf, overrides: Vec<String>) -> Self {
        Self {
            strategy,
            source_dir,
            overrides,
        }
    }

    pub fn prepare(&self) -> Result<IsolatedTestArea> {
        let temp = TempDir::new().context("failed to create isolated test directory")?;
        match self.strategy {
            IsolationStrategy::FullCopy => copy_dir_recursive(&self.source_dir, temp.path())
                .with_context(|| {
                    format!(
                        "failed to copy test directory {:?} to {:?}",
                        self.source_dir,
                        temp.path()
                    )
                })?,
            IsolationStrategy::LinkWithOverrides => {
                link_dir_recursive(&self.source_dir, temp.path(), &self.overrides).with_context(
                    || {
                        format!(
                            "failed to link test directory {:?} into {:?}",
                            self.source_dir,
                            temp.path()
                        )
                    },
                )?
            }
        }
        let path = temp.path().to_path_buf();
        Ok(IsolatedTestArea {
            temp: Some(temp),
            path,
        })
    }
}

/// Recursively copy all files and directories from `src` into `dst`.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create dir {:?}", dst))?;

    for entry in fs::read_dir(src).with_context(|| format!("failed to read dir {:?}", src))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());

        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target)
                .with_context(|| format!("failed to copy file {:?} to {:?}", path, target))?;
        }
    }

    Ok(())
}

/// Recreate the directory tree, symlinking files unless their name is in the
/// override list.
fn link_dir_recursive(src: &Path, dst: &Path, overrides: &[String]) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create dir {:?}", dst))?;

    for entry in fs::read_dir(src).with_context(|| format!("failed to read dir {:?}", src))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());

        if path.is_dir() {
            link_dir_recursive(&path, &target, overrides)?;
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        if overrides.contains(&name) {
            fs::copy(&path, &target)
                .with_context(|| format!("failed to copy override {:?} to {:?}", path, target))?;
        } else {
            let absolute = path
                .canonicalize()
                .with_context(|| format!("failed to resolve {:?}", path))?;
            link_file(&absolute, &target)
                .with_context(|| format!("failed to link {:?} as {:?}", absolute, target))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn link_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn link_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    // Symlink creation needs a privilege Windows does not always grant;
    // fall back to a copy.
    std::os::windows::fs::symlink_file(src, dst).or_else(|_| fs::copy(src, dst).map(|_| ()))
}
