//! Call-graph closure construction and candidate-test discovery.
//!
//! The closure of a target method contains the target, every method in the
//! assembly under test that can reach it through calls, constructions, or
//! delegate references, the nearest matching base-chain override, and
//! matching interface methods. A test is a candidate when its body invokes
//! any closure member.

use std::collections::HashSet;

use crate::assembly::{MethodDef, MethodLocation, Module, ModuleCache, TypeDef, TypeRef};
use crate::error::EngineError;
use crate::identity::MethodIdentity;
use crate::il::{MethodBody, Operand};

/// Marker excluding a method from candidate-test discovery: mutation tests
/// must not recursively drive mutation runs.
pub const MUTATION_TEST_MARKER: &str = "MutationTest";

/// Build the call-graph closure for the method at `location`.
pub fn build_closure(
    module: &Module,
    cache: &mut ModuleCache,
    location: &MethodLocation,
) -> HashSet<MethodIdentity> {
    let mut closure = HashSet::new();
    let declaring = module.type_at(&location.type_path);
    let method = &declaring.methods[location.method_index];
    add_method(module, cache, declaring, method, &mut closure);
    closure
}

/// Recursive closure-builder: the target itself, its callers, the nearest
/// matching base-chain ancestor, and interface methods at every level
/// visited.
fn add_method(
    module: &Module,
    cache: &mut ModuleCache,
    declaring: &TypeDef,
    method: &MethodDef,
    closure: &mut HashSet<MethodIdentity>,
) {
    let identity = MethodIdentity::of_def(&declaring.full_name, method);
    if !closure.insert(identity.clone()) {
        return;
    }

    add_calling_methods(module, cache, &identity, closure);
    add_methods_for_interfaces(module, cache, declaring, method, closure);

    // Walk the base chain; the nearest matching ancestor models what virtual
    // dispatch may actually invoke, so the walk stops at the first match.
    let mut base = declaring.base_type.clone();
    while let Some(base_ref) = base {
        let Some(base_def) = resolve_type(module, cache, &base_ref) else {
            break;
        };
        if let Some(base_method) = base_def
            .methods
            .iter()
            .find(|candidate| identity.matches_def(candidate))
        {
            add_method(module, cache, &base_def, base_method, closure);
            break;
        }
        add_methods_for_interfaces(module, cache, &base_def, method, closure);
        base = base_def.base_type.clone();
    }
}

/// Add every method in the assembly under test whose body can trigger
/// `target` via a call, construction, or delegate reference.
fn add_calling_methods(
    module: &Module,
    cache: &mut ModuleCache,
    target: &MethodIdentity,
    closure: &mut HashSet<MethodIdentity>,
) {
    for path in module.type_paths() {
        let type_def = module.type_at(&path);
        for method in &type_def.methods {
            let Some(body) = &method.body else { continue };
            if body_invokes(body, target) {
                add_method(module, cache, type_def, method, closure);
            }
        }
    }
}

fn add_methods_for_interfaces(
    module: &Module,
    cache: &mut ModuleCache,
    type_def: &TypeDef,
    method: &MethodDef,
    closure: &mut HashSet<MethodIdentity>,
) {
    let identity = MethodIdentity::of_def(&type_def.full_name, method);
    for interface_ref in &type_def.interfaces {
        let Some(interface_def) = resolve_type(module, cache, interface_ref) else {
            continue;
        };
        if let Some(interface_method) = interface_def
            .methods
            .iter()
            .find(|candidate| identity.matches_def(candidate))
        {
            add_method(module, cache, &interface_def, interface_method, closure);
        }
    }
}

/// Resolve a type reference, crossing the assembly boundary through the
/// cache when the scope names another assembly.
fn resolve_type(module: &Module, cache: &mut ModuleCache, r: &TypeRef) -> Option<TypeDef> {
    if r.scope == module.name {
        let path = module.find_type(&r.full_name)?;
        Some(module.type_at(&path).clone())
    } else {
        cache.find_type(&r.scope, &r.full_name)
    }
}

fn body_invokes(body: &MethodBody, target: &MethodIdentity) -> bool {
    body.instructions.iter().any(|ins| {
        ins.opcode.is_call_like()
            && matches!(&ins.operand, Operand::Method(m) if &MethodIdentity::of_ref(m) == target)
    })
}

fn body_references_type(body: &MethodBody, type_full_name: &str) -> bool {
    body.instructions.iter().any(|ins| match &ins.operand {
        Operand::Method(m) => {
            m.declaring_type == type_full_name
                || m.generic_args.iter().any(|a| a == type_full_name)
        }
        _ => false,
    })
}

/// Unwrap compiler-generated state-machine names to the logical test name the
/// runner understands: `Ns.Tests/<TestFoo>d__3` + `MoveNext` becomes
/// `Ns.Tests.TestFoo`. Nested types use `+` in the emitted name.
pub fn normalized_test_name(type_full_name: &str, method_name: &str) -> String {
    if method_name == "MoveNext" {
        if let Some((outer, leaf)) = type_full_name.rsplit_once('/') {
            if let Some(logical) = generated_logical_name(leaf) {
                return format!("{}.{}", outer.replace('/', "+"), logical);
            }
        }
    }
    format!("{}.{}", type_full_name.replace('/', "+"), method_name)
}

fn generated_logical_name(leaf: &str) -> Option<&str> {
    let rest = leaf.strip_prefix('<')?;
    let (name, _) = rest.split_once('>')?;
    (!name.is_empty()).then_some(name)
}

/// Scan the test assembly for methods whose body invokes a closure member.
///
/// Outside `force` mode a cheap filter applies first: the method must
/// reference the target's declaring type by name (as a call, constructor, or
/// generic argument). Methods carrying the mutation-test marker are excluded.
pub fn matching_tests_from_tree(
    test_module: &Module,
    target_type_full_name: &str,
    closure: &HashSet<MethodIdentity>,
    force: bool,
) -> Vec<String> {
    let mut tests = Vec::new();
    for path in test_module.type_paths() {
        let type_def = test_module.type_at(&path);
        for method in &type_def.methods {
            let Some(body) = &method.body else { continue };
            if method.markers.iter().any(|m| m == MUTATION_TEST_MARKER) {
                continue;
            }
            if !force && !body_references_type(body, target_type_full_name) {
                continue;
            }
            let invokes_closure = body.instructions.iter().any(|ins| {
                ins.opcode.is_call_like()
                    && matches!(&ins.operand, Operand::Method(m) if closure.contains(&MethodIdentity::of_ref(m)))
            });
            if invokes_closure {
                tests.push(normalized_test_name(&type_def.full_name, &method.name));
            }
        }
    }
    tests.sort();
    tests.dedup();
    tests
}

/// Two-pass candidate-test discovery: the heuristic pass first, the forced
/// pass only when it comes up empty, and a hard failure when both do.
pub fn find_candidate_tests(
    test_module: &Module,
    target_type_full_name: &str,
    closure: &HashSet<MethodIdentity>,
) -> Result<Vec<String>, EngineError> {
    let tests = matching_tests_from_tree(test_module, target_type_full_name, closure, false);
    if !tests.is_empty() {
        return Ok(tests);
    }
    let tests = matching_tests_from_tree(test_module, target_type_full_name, closure, true);
    if !tests.is_empty() {
        return Ok(tests);
    }
    Err(EngineError::NoMatchingTests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{FieldDef, MethodDef, ParameterDef, TypeDef};
    use crate::il::{Instruction, MethodRef, OpCode};

    fn int_params(count: usize) -> Vec<ParameterDef> {
        (0..count)
            .map(|i| ParameterDef {
                name: format!("p{i}"),
                parameter_type: "System.Int32".to_string(),
            })
            .collect()
    }

    fn call_to(declaring: &str, name: &str, params: usize) -> Instruction {
        Instruction::new(
            OpCode::Call,
            Operand::Method(MethodRef {
                declaring_type: declaring.to_string(),
                name: name.to_string(),
                parameter_types: vec!["System.Int32".to_string(); params],
                return_type: "System.Int32".to_string(),
                generic_arity: 0,
                generic_args: Vec::new(),
            }),
        )
    }

    fn plain_method(name: &str, params: usize, body: Option<MethodBody>) -> MethodDef {
        MethodDef {
            name: name.to_string(),
            parameters: int_params(params),
            return_type: "System.Int32".to_string(),
            generic_arity: 0,
            is_static: true,
            markers: Vec::new(),
            body,
        }
    }

    fn plain_type(full_name: &str, methods: Vec<MethodDef>) -> TypeDef {
        TypeDef {
            full_name: full_name.to_string(),
            base_type: None,
            interfaces: Vec::new(),
            fields: Vec::<FieldDef>::new(),
            methods,
            nested_types: Vec::new(),
        }
    }

    fn library_module() -> Module {
        let add_body = MethodBody::new(vec![
            Instruction::simple(OpCode::Ldarg0),
            Instruction::simple(OpCode::Ldarg1),
            Instruction::simple(OpCode::Add),
            Instruction::simple(OpCode::Ret),
        ]);
        let caller_body = MethodBody::new(vec![
            Instruction::simple(OpCode::Ldarg0),
            Instruction::simple(OpCode::Ldarg1),
            call_to("Lib.Calc", "Add", 2),
            Instruction::simple(OpCode::Ret),
        ]);

        let mut calc = plain_type(
            "Lib.Calc",
            vec![plain_method("Add", 2, Some(add_body))],
        );
        calc.base_type = Some(TypeRef {
            full_name: "Lib.CalcBase".to_string(),
            scope: "Lib".to_string(),
        });
        calc.interfaces.push(TypeRef {
            full_name: "Lib.IAdder".to_string(),
            scope: "Lib".to_string(),
        });

        let base = plain_type("Lib.CalcBase", vec![plain_method("Add", 2, None)]);
        let interface = plain_type("Lib.IAdder", vec![plain_method("Add", 2, None)]);
        let helper = plain_type(
            "Lib.Helper",
            vec![plain_method("CallsAdd", 2, Some(caller_body))],
        );

        Module {
            name: "Lib".to_string(),
            assembly_references: Vec::new(),
            types: vec![calc, base, interface, helper],
        }
    }

    fn closure_for_add(module: &Module) -> HashSet<MethodIdentity> {
        let mut cache = ModuleCache::new(std::env::temp_dir());
        let location = MethodLocation {
            type_path: vec![0],
            method_index: 0,
        };
        build_closure(module, &mut cache, &location)
    }

    #[test]
    fn closure_contains_target_callers_base_and_interface() {
        let module = library_module();
        let closure = closure_for_add(&module);

        let declaring: HashSet<&str> = closure
            .iter()
            .map(|id| id.declaring_type.as_str())
            .collect();
        assert_eq!(
            declaring,
            HashSet::from(["Lib.Calc", "Lib.CalcBase", "Lib.IAdder", "Lib.Helper"])
        );
    }

    #[test]
    fn closure_members_all_relate_to_target() {
        let module = library_module();
        let closure = closure_for_add(&module);
        // Soundness: every member is Add-shaped or a caller of Add.
        for id in &closure {
            assert!(id.name == "Add" || id.name == "CallsAdd", "spurious: {id:?}");
        }
    }

    fn test_module(calls: Vec<(&str, Instruction, Vec<String>)>) -> Module {
        let methods = calls
            .into_iter()
            .map(|(name, call, markers)| {
                let mut m = plain_method(
                    name,
                    0,
                    Some(MethodBody::new(vec![call, Instruction::simple(OpCode::Ret)])),
                );
                m.markers = markers;
                m
            })
            .collect();
        Module {
            name: "Lib.Tests".to_string(),
            assembly_references: vec!["Lib".to_string()],
            types: vec![plain_type("LibTests.CalcTests", methods)],
        }
    }

    #[test]
    fn heuristic_pass_finds_direct_test() {
        let module = library_module();
        let closure = closure_for_add(&module);
        let tests = test_module(vec![(
            "AddsSmallNumbers",
            call_to("Lib.Calc", "Add", 2),
            Vec::new(),
        )]);

        let found = find_candidate_tests(&tests, "Lib.Calc", &closure).unwrap();
        assert_eq!(found, vec!["LibTests.CalcTests.AddsSmallNumbers".to_string()]);
    }

    #[test]
    fn forced_pass_runs_only_when_heuristic_is_empty() {
        let module = library_module();
        let closure = closure_for_add(&module);
        // The test exercises Add through Helper and never names Lib.Calc.
        let tests = test_module(vec![(
            "AddsViaHelper",
            call_to("Lib.Helper", "CallsAdd", 2),
            Vec::new(),
        )]);

        assert!(matching_tests_from_tree(&tests, "Lib.Calc", &closure, false).is_empty());
        let found = find_candidate_tests(&tests, "Lib.Calc", &closure).unwrap();
        assert_eq!(found, vec!["LibTests.CalcTests.AddsViaHelper".to_string()]);
    }

    #[test]
    fn mutation_test_marker_is_excluded() {
        let module = library_module();
        let closure = closure_for_add(&module);
        let tests = test_module(vec![(
            "MutationAdd",
            call_to("Lib.Calc", "Add", 2),
            vec![MUTATION_TEST_MARKER.to_string()],
        )]);

        match find_candidate_tests(&tests, "Lib.Calc", &closure) {
            Err(EngineError::NoMatchingTests) => {}
            other => panic!("expected NoMatchingTests, got {other:?}"),
        }
    }

    #[test]
    fn no_tests_at_all_is_a_hard_failure() {
        let module = library_module();
        let closure = closure_for_add(&module);
        let tests = test_module(vec![(
            "Unrelated",
            call_to("Lib.Other", "Nope", 0),
            Vec::new(),
        )]);

        let err = find_candidate_tests(&tests, "Lib.Calc", &closure).unwrap_err();
        assert_eq!(err.to_string(), "no matching tests were found to run");
    }

    #[test]
    fn state_machine_move_next_unwraps_to_logical_name() {
        assert_eq!(
            normalized_test_name("LibTests.CalcTests/<AddsAsync>d__4", "MoveNext"),
            "LibTests.CalcTests.AddsAsync"
        );
        assert_eq!(
            normalized_test_name("LibTests.CalcTests/Nested", "Adds"),
            "LibTests.CalcTests+Nested.Adds"
        );
        assert_eq!(
            normalized_test_name("LibTests.CalcTests", "MoveNext"),
            "LibTests.CalcTests.MoveNext"
        );
    }

    #[test]
    fn state_machine_tests_are_discovered_under_their_logical_name() {
        let module = library_module();
        let closure = closure_for_add(&module);

        let mut outer = plain_type("LibTests.CalcTests", Vec::new());
        outer.nested_types.push(plain_type(
            "LibTests.CalcTests/<AddsAsync>d__0",
            vec![plain_method(
                "MoveNext",
                0,
                Some(MethodBody::new(vec![
                    call_to("Lib.Calc", "Add", 2),
                    Instruction::simple(OpCode::Ret),
                ])),
            )],
        ));
        let tests = Module {
            name: "Lib.Tests".to_string(),
            assembly_references: vec!["Lib".to_string()],
            types: vec![outer],
        };

        let found = find_candidate_tests(&tests, "Lib.Calc", &closure).unwrap();
        assert_eq!(found, vec!["LibTests.CalcTests.AddsAsync".to_string()]);
    }
}
