use crate::assembly::{MethodLocation, Module};
use crate::error::EngineError;

/// What the user asked to mutate. Parameter types are only required when the
/// method name alone is ambiguous among overloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub type_name: String,
    pub method_name: String,
    pub parameter_types: Option<Vec<String>>,
    pub return_type: Option<String>,
    pub generic_arity: Option<u16>,
}

impl TargetDescriptor {
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
            parameter_types: None,
            return_type: None,
            generic_arity: None,
        }
    }
}

/// Typed outcome of target resolution. Ambiguity and absence are values, not
/// exceptions; callers branch explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Unique(MethodLocation),
    TypeNotFound,
    MethodNotFound,
    Ambiguous { candidates: Vec<String> },
}

impl Resolution {
    /// Collapse into the error taxonomy at the orchestration boundary.
    pub fn into_location(self, descriptor: &TargetDescriptor) -> Result<MethodLocation, EngineError> {
        match self {
            Resolution::Unique(location) => Ok(location),
            Resolution::TypeNotFound => {
                Err(EngineError::TypeNotFound(descriptor.type_name.clone()))
            }
            Resolution::MethodNotFound => Err(EngineError::MethodNotFound {
                type_name: descriptor.type_name.clone(),
                method: descriptor.method_name.clone(),
            }),
            Resolution::Ambiguous { candidates } => Err(EngineError::AmbiguousMethod {
                type_name: descriptor.type_name.clone(),
                method: descriptor.method_name.clone(),
                candidates,
            }),
        }
    }
}

/// Resolve a target descriptor against a loaded module.
pub fn resolve_method(module: &Module, descriptor: &TargetDescriptor) -> Resolution {
    let Some(type_path) = module.find_type(&descriptor.type_name) else {
        return Resolution::TypeNotFound;
    };
    let type_def = module.type_at(&type_path);

    let mut matches: Vec<usize> = type_def
        .methods
        .iter()
        .enumerate()
        .filter(|(_, m)| m.name == descriptor.method_name)
        .filter(|(_, m)| {
            descriptor
                .generic_arity
                .is_none_or(|arity| m.generic_arity == arity)
        })
        .filter(|(_, m)| {
            descriptor
                .return_type
                .as_ref()
                .is_none_or(|rt| &m.return_type == rt)
        })
        .map(|(i, _)| i)
        .collect();

    if let Some(params) = &descriptor.parameter_types {
        matches.retain(|&i| &type_def.methods[i].parameter_type_names() == params);
    }

    match matches.len() {
        0 => Resolution::MethodNotFound,
        1 => Resolution::Unique(MethodLocation {
            type_path,
            method_index: matches[0],
        }),
        _ => Resolution::Ambiguous {
            candidates: matches
                .iter()
                .map(|&i| {
                    let m = &type_def.methods[i];
                    format!(
                        "{} {}({})",
                        m.return_type,
                        m.name,
                        m.parameter_type_names().join(", ")
                    )
                })
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{MethodDef, ParameterDef, TypeDef};

    fn method(name: &str, params: &[&str]) -> MethodDef {
        MethodDef {
            name: name.to_string(),
            parameters: params
                .iter()
                .map(|p| ParameterDef {
                    name: String::new(),
                    parameter_type: p.to_string(),
                })
                .collect(),
            return_type: "System.Int32".to_string(),
            generic_arity: 0,
            is_static: false,
            markers: Vec::new(),
            body: None,
        }
    }

    fn module_with_overloads() -> Module {
        Module {
            name: "Sample".to_string(),
            assembly_references: Vec::new(),
            types: vec![TypeDef {
                full_name: "Sample.Calc".to_string(),
                base_type: None,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: vec![
                    method("Add", &["System.Int32", "System.Int32"]),
                    method("Add", &["System.Double", "System.Double"]),
                    method("Negate", &["System.Int32"]),
                ],
                nested_types: Vec::new(),
            }],
        }
    }

    #[test]
    fn unique_method_resolves() {
        let module = module_with_overloads();
        let r = resolve_method(&module, &TargetDescriptor::new("Sample.Calc", "Negate"));
        assert_eq!(
            r,
            Resolution::Unique(MethodLocation {
                type_path: vec![0],
                method_index: 2,
            })
        );
    }

    #[test]
    fn overload_without_parameters_is_ambiguous() {
        let module = module_with_overloads();
        let r = resolve_method(&module, &TargetDescriptor::new("Sample.Calc", "Add"));
        match r {
            Resolution::Ambiguous { candidates } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn overload_with_parameters_resolves() {
        let module = module_with_overloads();
        let mut descriptor = TargetDescriptor::new("Sample.Calc", "Add");
        descriptor.parameter_types = Some(vec![
            "System.Double".to_string(),
            "System.Double".to_string(),
        ]);
        let r = resolve_method(&module, &descriptor);
        assert_eq!(
            r,
            Resolution::Unique(MethodLocation {
                type_path: vec![0],
                method_index: 1,
            })
        );
    }

    #[test]
    fn missing_names_map_to_typed_results() {
        let module = module_with_overloads();
        assert_eq!(
            resolve_method(&module, &TargetDescriptor::new("Sample.Nope", "Add")),
            Resolution::TypeNotFound
        );
        assert_eq!(
            resolve_method(&module, &TargetDescriptor::new("Sample.Calc", "Nope")),
            Resolution::MethodNotFound
        );
    }

    #[test]
    fn ambiguity_becomes_a_resolution_error() {
        let module = module_with_overloads();
        let descriptor = TargetDescriptor::new("Sample.Calc", "Add");
        let err = resolve_method(&module, &descriptor)
            .into_location(&descriptor)
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }
}
