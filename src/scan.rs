use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::assembly::Module;
use crate::il::dispose_pattern_indices;
use crate::turtles::TurtleKind;

/// High-level overview of a module image, printed by the `scan` subcommand
/// before anyone commits to a full mutation run.
#[derive(Debug, Clone)]
pub struct AssemblyOverview {
    pub path: PathBuf,
    pub assembly_name: String,
    pub types: usize,
    pub methods: usize,
    pub methods_with_body: usize,
    pub instructions: usize,
    pub methods_with_symbols: usize,
    /// (operator name, number of mutations it would plan) per built-in
    /// operator.
    pub operator_candidates: Vec<(String, usize)>,
}

pub fn scan_assembly(path: &Path) -> Result<AssemblyOverview> {
    let module = Module::load(path)?;

    let mut methods = 0;
    let mut methods_with_body = 0;
    let mut instructions = 0;
    let mut methods_with_symbols = 0;

    let type_paths = module.type_paths();
    for p in &type_paths {
        let t = module.type_at(p);
        methods += t.methods.len();
        for m in &t.methods {
            if let Some(body) = &m.body {
                methods_with_body += 1;
                instructions += body.instructions.len();
                if !body.sequence_points.is_empty() {
                    methods_with_symbols += 1;
                }
            }
        }
    }

    let mut operator_candidates = Vec::new();
    for kind in TurtleKind::all() {
        let turtle = kind.instantiate();
        let mut count = 0;
        for p in &type_paths {
            for m in &module.type_at(p).methods {
                let Some(body) = &m.body else { continue };
                let original_offsets: Vec<u32> =
                    body.instructions.iter().map(|i| i.offset).collect();
                let mut simplified = body.clone();
                simplified.simplify_macros();
                let dispose = dispose_pattern_indices(&simplified);
                count += turtle
                    .plan(&simplified, &original_offsets)
                    .iter()
                    .filter(|p| !dispose.contains(&p.index))
                    .count();
            }
        }
        operator_candidates.push((turtle.name().to_string(), count));
    }

    Ok(AssemblyOverview {
        path: path.to_path_buf(),
        assembly_name: module.name,
        types: type_paths.len(),
        methods,
        methods_with_body,
        instructions,
        methods_with_symbols,
        operator_candidates,
    })
}
