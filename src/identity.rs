use serde::{Deserialize, Serialize};

use crate::assembly::MethodDef;
use crate::il::MethodRef;

/// Identity of a method for call-graph purposes: declaring-type full name,
/// method name, parameter-type names, and generic-parameter count.
///
/// Full equality (derived `Eq`/`Hash`) includes the declaring type and is the
/// dedup key for closure membership. [`MethodIdentity::matches_signature`] is
/// the deliberately loose policy used while walking base chains and
/// interfaces: it compares name, parameter-type *names*, and generic arity
/// only, because exact type-reference identity differs across assemblies
/// after resolution. Spurious matches are tolerated in favor of never missing
/// a real override relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodIdentity {
    pub declaring_type: String,
    pub name: String,
    pub parameter_types: Vec<String>,
    pub generic_arity: u16,
}

impl MethodIdentity {
    pub fn of_def(declaring_type: &str, method: &MethodDef) -> Self {
        Self {
            declaring_type: declaring_type.to_string(),
            name: method.name.clone(),
            parameter_types: method.parameter_type_names(),
            generic_arity: method.generic_arity,
        }
    }

    pub fn of_ref(r: &MethodRef) -> Self {
        Self {
            declaring_type: r.declaring_type.clone(),
            name: r.name.clone(),
            parameter_types: r.parameter_types.clone(),
            generic_arity: r.generic_arity,
        }
    }

    /// Loose structural match ignoring the declaring type.
    pub fn matches_signature(&self, other: &MethodIdentity) -> bool {
        self.name == other.name
            && self.parameter_types == other.parameter_types
            && self.generic_arity == other.generic_arity
    }

    /// Does `method` on some other type carry the same signature?
    pub fn matches_def(&self, method: &MethodDef) -> bool {
        self.name == method.name
            && self.parameter_types == method.parameter_type_names()
            && self.generic_arity == method.generic_arity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(declaring: &str, name: &str, params: &[&str], arity: u16) -> MethodIdentity {
        MethodIdentity {
            declaring_type: declaring.to_string(),
            name: name.to_string(),
            parameter_types: params.iter().map(|s| s.to_string()).collect(),
            generic_arity: arity,
        }
    }

    #[test]
    fn identity_shape_is_stable() {
        let id = identity("Ns.Base", "Frob", &["System.Int32"], 0);
        insta::assert_debug_snapshot!(id, @r#"
        MethodIdentity {
            declaring_type: "Ns.Base",
            name: "Frob",
            parameter_types: [
                "System.Int32",
            ],
            generic_arity: 0,
        }
        "#);
    }

    #[test]
    fn full_equality_includes_declaring_type() {
        let a = identity("Ns.Base", "Frob", &["System.Int32"], 0);
        let b = identity("Ns.Derived", "Frob", &["System.Int32"], 0);
        assert_ne!(a, b);
        assert!(a.matches_signature(&b));
    }

    #[test]
    fn signature_match_requires_parameter_names_and_arity() {
        let a = identity("Ns.Base", "Frob", &["System.Int32"], 0);
        assert!(!a.matches_signature(&identity("Ns.Base", "Frob", &["System.Int64"], 0)));
        assert!(!a.matches_signature(&identity("Ns.Base", "Frob", &["System.Int32"], 1)));
        assert!(!a.matches_signature(&identity("Ns.Base", "Grob", &["System.Int32"], 0)));
    }
}
