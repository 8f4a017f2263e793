//! Durable XML mutation reports.
//!
//! One `TestedMethod` record per target method: whether tests were found at
//! all, the source locations touched, and one `AppliedMutant` entry per
//! executed mutant with its kill verdict. Reports merge: loading a prior
//! file replaces the record for the same method and leaves every other
//! method's history untouched, so CI shards can accumulate into one file.
//! Merge reads tolerate a missing prior file; write faults propagate.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::il::SequencePoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MutationReport {
    #[serde(rename = "TestedMethod", default)]
    pub methods: Vec<MethodRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    #[serde(rename = "@Name")]
    pub name: String,
    #[serde(rename = "@TestsFound")]
    pub tests_found: bool,
    #[serde(rename = "SourceFile", default)]
    pub source_files: Vec<SourceFileRecord>,
    #[serde(rename = "AppliedMutant", default)]
    pub applied_mutants: Vec<AppliedMutantRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileRecord {
    #[serde(rename = "@Path")]
    pub path: String,
    #[serde(rename = "SequencePoint", default)]
    pub sequence_points: Vec<SequencePointRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePointRecord {
    #[serde(rename = "@StartLine")]
    pub start_line: u32,
    #[serde(rename = "@EndLine")]
    pub end_line: u32,
    #[serde(rename = "@StartColumn")]
    pub start_column: u32,
    #[serde(rename = "@EndColumn")]
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMutantRecord {
    #[serde(rename = "@Killed")]
    pub killed: bool,
    #[serde(rename = "$text")]
    pub description: String,
}

/// What to do with the report file at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportMode {
    /// Replace the file contents.
    Overwrite,
    /// Load the prior file, replace this run's method record, keep the rest.
    Merge,
    /// Discard the report.
    None,
}

impl MutationReport {
    /// Establish (or reset) the record for a method. Any prior record with
    /// the same name is dropped first.
    pub fn register_method(&mut self, name: &str, tests_found: bool) {
        self.methods.retain(|m| m.name != name);
        self.methods.push(MethodRecord {
            name: name.to_string(),
            tests_found,
            source_files: Vec::new(),
            applied_mutants: Vec::new(),
        });
    }

    /// Append one mutant outcome. A missing location (no debug symbols) still
    /// records the outcome, just without attribution.
    pub fn add_result(
        &mut self,
        method: &str,
        location: Option<&SequencePoint>,
        description: &str,
        killed: bool,
    ) {
        let Some(record) = self.methods.iter_mut().find(|m| m.name == method) else {
            return;
        };

        if let Some(sp) = location {
            let path = sp.document.display().to_string();
            let index = match record.source_files.iter().position(|f| f.path == path) {
                Some(i) => i,
                None => {
                    record.source_files.push(SourceFileRecord {
                        path,
                        sequence_points: Vec::new(),
                    });
                    record.source_files.len() - 1
                }
            };
            let file = &mut record.source_files[index];
            let point = SequencePointRecord {
                start_line: sp.start_line,
                end_line: sp.end_line,
                start_column: sp.start_column,
                end_column: sp.end_column,
            };
            if !file.sequence_points.contains(&point) {
                file.sequence_points.push(point);
            }
        }

        record.applied_mutants.push(AppliedMutantRecord {
            killed,
            description: description.to_string(),
        });
    }

    pub fn load(path: &Path) -> Result<MutationReport> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read report file {:?}", path))?;
        let report = quick_xml::de::from_str(&contents)
            .with_context(|| format!("failed to parse report file {:?}", path))?;
        Ok(report)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = quick_xml::se::to_string(self).context("serialize mutation report")?;
        let contents = format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}");
        fs::write(path, contents)
            .with_context(|| format!("failed to write report file {:?}", path))?;
        Ok(())
    }

    /// Pull in records from a prior report file for every method this run did
    /// not touch. A missing file is an empty prior report.
    pub fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let prior = MutationReport::load(path)?;
        let mut merged: Vec<MethodRecord> = prior
            .methods
            .into_iter()
            .filter(|m| !self.methods.iter().any(|mine| mine.name == m.name))
            .collect();
        merged.append(&mut self.methods);
        self.methods = merged;
        Ok(())
    }

    /// Apply the selected write policy.
    pub fn write(&self, path: &Path, mode: ReportMode) -> Result<()> {
        match mode {
            ReportMode::Overwrite => self.save(path),
            ReportMode::Merge => {
                let mut merged = self.clone();
                merged.merge_from_file(path)?;
                merged.save(path)
            }
            ReportMode::None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sequence_point() -> SequencePoint {
        SequencePoint {
            offset: 4,
            document: PathBuf::from("src/Calc.cs"),
            start_line: 12,
            end_line: 12,
            start_column: 9,
            end_column: 32,
        }
    }

    fn report_for(method: &str, killed: &[bool]) -> MutationReport {
        let mut report = MutationReport::default();
        report.register_method(method, true);
        let sp = sequence_point();
        for (i, &k) in killed.iter().enumerate() {
            report.add_result(method, Some(&sp), &format!("mutant {i}"), k);
        }
        report
    }

    #[test]
    fn save_then_load_roundtrips() {
        let report = report_for("System.Int32 Lib.Calc::Add(System.Int32, System.Int32)", &[true, false]);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.xml");

        report.save(&path).unwrap();
        let loaded = MutationReport::load(&path).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn xml_carries_killed_attribute_and_description_text() {
        let report = report_for("Lib.Calc::Add", &[true]);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.xml");
        report.save(&path).unwrap();

        let xml = fs::read_to_string(&path).unwrap();
        assert!(xml.contains("Killed=\"true\""));
        assert!(xml.contains("mutant 0"));
        assert!(xml.contains("TestsFound=\"true\""));
        assert!(xml.contains("StartLine=\"12\""));
    }

    #[test]
    fn sequence_points_are_deduplicated_per_source_file() {
        let report = report_for("Lib.Calc::Add", &[true, true, false]);
        assert_eq!(report.methods[0].source_files.len(), 1);
        assert_eq!(report.methods[0].source_files[0].sequence_points.len(), 1);
        assert_eq!(report.methods[0].applied_mutants.len(), 3);
    }

    #[test]
    fn register_method_replaces_an_existing_record() {
        let mut report = report_for("Lib.Calc::Add", &[false]);
        report.register_method("Lib.Calc::Add", true);
        assert_eq!(report.methods.len(), 1);
        assert!(report.methods[0].applied_mutants.is_empty());
    }

    #[test]
    fn merge_replaces_same_method_and_keeps_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.xml");

        // First run covers A and B.
        let mut first = report_for("Lib.Calc::Add", &[true]);
        let mut b = report_for("Lib.Calc::Sub", &[false]);
        first.methods.append(&mut b.methods);
        first.write(&path, ReportMode::Overwrite).unwrap();

        // Second run covers only B, now with a kill.
        let second = report_for("Lib.Calc::Sub", &[true]);
        second.write(&path, ReportMode::Merge).unwrap();

        let merged = MutationReport::load(&path).unwrap();
        assert_eq!(merged.methods.len(), 2);
        let add = merged.methods.iter().find(|m| m.name == "Lib.Calc::Add").unwrap();
        assert!(add.applied_mutants[0].killed);
        let sub = merged.methods.iter().find(|m| m.name == "Lib.Calc::Sub").unwrap();
        assert_eq!(sub.applied_mutants.len(), 1);
        assert!(sub.applied_mutants[0].killed, "record must reflect the latest run");
    }

    #[test]
    fn merging_twice_with_identical_input_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.xml");

        report_for("Lib.Calc::Add", &[true])
            .write(&path, ReportMode::Overwrite)
            .unwrap();

        let update = report_for("Lib.Calc::Sub", &[false]);
        update.write(&path, ReportMode::Merge).unwrap();
        let once = fs::read_to_string(&path).unwrap();

        update.write(&path, ReportMode::Merge).unwrap();
        let twice = fs::read_to_string(&path).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_tolerates_a_missing_prior_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.xml");

        let report = report_for("Lib.Calc::Add", &[true]);
        report.write(&path, ReportMode::Merge).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn none_mode_discards_the_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.xml");
        report_for("Lib.Calc::Add", &[true])
            .write(&path, ReportMode::None)
            .unwrap();
        assert!(!path.exists());
    }
}
