//! Decoded module images.
//!
//! The binary PE/metadata codec is an external front end: this engine
//! consumes a *decoded module image* (`.ilmod`, a JSON document) and writes
//! mutated images back in the same form. Instruction offsets inside an image
//! are derived from the canonical encoding sizes, so a round trip through
//! [`Module::load`]/[`Module::write`] is stable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::il::MethodBody;

/// Reference to a type defined in this or another assembly. `scope` is the
/// assembly name the reference resolves through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub full_name: String,
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDef {
    #[serde(default)]
    pub name: String,
    pub parameter_type: String,
}

fn system_void() -> String {
    "System.Void".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default = "system_void")]
    pub return_type: String,
    #[serde(default)]
    pub generic_arity: u16,
    #[serde(default)]
    pub is_static: bool,
    /// Custom-attribute names the decoder surfaced, e.g. `Test` or
    /// `MutationTest`.
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default)]
    pub body: Option<MethodBody>,
}

impl MethodDef {
    pub fn parameter_type_names(&self) -> Vec<String> {
        self.parameters
            .iter()
            .map(|p| p.parameter_type.clone())
            .collect()
    }
}

/// A type definition. Nested types use `/` as the nesting separator in
/// `full_name` (decoder convention); runner-facing names use `+` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub full_name: String,
    #[serde(default)]
    pub base_type: Option<TypeRef>,
    #[serde(default)]
    pub interfaces: Vec<TypeRef>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub nested_types: Vec<TypeDef>,
}

impl TypeDef {
    /// Leaf name: the segment after the last nesting separator.
    pub fn leaf_name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map(|(_, leaf)| leaf)
            .unwrap_or(&self.full_name)
    }

    /// Runner-facing qualified name (`+` nesting separator).
    pub fn runner_name(&self) -> String {
        self.full_name.replace('/', "+")
    }
}

/// Index path of a type within a module: the first element indexes the
/// top-level `types`, each further element indexes `nested_types`.
pub type TypePath = Vec<usize>;

/// Stable address of a method inside a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodLocation {
    pub type_path: TypePath,
    pub method_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub assembly_references: Vec<String>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

impl Module {
    /// File name an assembly image is stored under.
    pub fn file_name(assembly_name: &str) -> String {
        format!("{assembly_name}.ilmod")
    }

    pub fn load(path: &Path) -> Result<Module> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read module image {:?}", path))?;
        let mut module: Module = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse module image {:?}", path))?;
        for t in &mut module.types {
            refresh_type_offsets(t);
        }
        Ok(module)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serialize module image")?;
        fs::write(path, json).with_context(|| format!("failed to write module image {:?}", path))?;
        Ok(())
    }

    pub fn type_at(&self, path: &[usize]) -> &TypeDef {
        let mut t = &self.types[path[0]];
        for &idx in &path[1..] {
            t = &t.nested_types[idx];
        }
        t
    }

    pub fn type_at_mut(&mut self, path: &[usize]) -> &mut TypeDef {
        let mut t = &mut self.types[path[0]];
        for &idx in &path[1..] {
            t = &mut t.nested_types[idx];
        }
        t
    }

    pub fn method_at(&self, location: &MethodLocation) -> &MethodDef {
        &self.type_at(&location.type_path).methods[location.method_index]
    }

    pub fn method_at_mut(&mut self, location: &MethodLocation) -> &mut MethodDef {
        &mut self.type_at_mut(&location.type_path).methods[location.method_index]
    }

    /// Depth-first paths of every type in the module, nested types included.
    pub fn type_paths(&self) -> Vec<TypePath> {
        let mut out = Vec::new();
        for (i, t) in self.types.iter().enumerate() {
            collect_type_paths(t, vec![i], &mut out);
        }
        out
    }

    /// Find a type by decoder-convention full name (`/` nesting separator).
    /// Accepts `+` as a synonym since user input usually carries it.
    pub fn find_type(&self, full_name: &str) -> Option<TypePath> {
        let wanted = full_name.replace('+', "/");
        self.type_paths()
            .into_iter()
            .find(|p| self.type_at(p).full_name == wanted)
    }
}

fn collect_type_paths(t: &TypeDef, path: TypePath, out: &mut Vec<TypePath>) {
    out.push(path.clone());
    for (i, nested) in t.nested_types.iter().enumerate() {
        let mut p = path.clone();
        p.push(i);
        collect_type_paths(nested, p, out);
    }
}

fn refresh_type_offsets(t: &mut TypeDef) {
    for m in &mut t.methods {
        if let Some(body) = &mut m.body {
            body.update_offsets();
        }
    }
    for nested in &mut t.nested_types {
        refresh_type_offsets(nested);
    }
}

/// Lazily loads referenced assemblies' images from the directory the main
/// assembly lives in. Used when a base type's reference scope names another
/// assembly.
pub struct ModuleCache {
    search_dir: PathBuf,
    loaded: HashMap<String, Option<Module>>,
}

impl ModuleCache {
    pub fn new(search_dir: PathBuf) -> Self {
        Self {
            search_dir,
            loaded: HashMap::new(),
        }
    }

    /// Resolve a type by (assembly scope, full name), loading the referenced
    /// image on first use. Returns a clone so callers do not hold borrows
    /// across further cache loads.
    pub fn find_type(&mut self, scope: &str, full_name: &str) -> Option<TypeDef> {
        if !self.loaded.contains_key(scope) {
            let path = self.search_dir.join(Module::file_name(scope));
            self.loaded.insert(scope.to_string(), Module::load(&path).ok());
        }
        let module = self.loaded.get(scope)?.as_ref()?;
        let path = module.find_type(full_name)?;
        Some(module.type_at(&path).clone())
    }
}
