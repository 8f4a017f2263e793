use std::collections::{HashMap, HashSet};

use crate::il::{FieldRef, MethodBody, OpCode, Operand};

use super::{offset_tag, MethodTurtle, Patch, PlannedMutation};

/// Redirects each variable write to every other variable of the same
/// declared type that is read somewhere in the method.
///
/// Substitution stays within storage kind (local for local, instance field
/// for instance field of the same declaring type, static field for static
/// field): crossing kinds would change the evaluation-stack shape and
/// produce unverifiable bodies. Zero-initializing writes are skipped since
/// the runtime zero-initializes anyway.
pub struct VariableWriteTurtle;

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
enum FieldKey {
    Instance(String, String),
    Static(String, String),
}

impl FieldKey {
    fn of(f: &FieldRef, static_access: bool) -> FieldKey {
        if static_access {
            FieldKey::Static(f.declaring_type.clone(), f.name.clone())
        } else {
            FieldKey::Instance(f.declaring_type.clone(), f.name.clone())
        }
    }
}

impl MethodTurtle for VariableWriteTurtle {
    fn name(&self) -> &'static str {
        "variable-write"
    }

    fn description(&self) -> &'static str {
        "redirects variable writes to other variables of the same type"
    }

    fn plan(&self, body: &MethodBody, original_offsets: &[u32]) -> Vec<PlannedMutation> {
        let local_types: HashMap<u16, &str> = body
            .locals
            .iter()
            .map(|l| (l.index, l.var_type.as_str()))
            .collect();
        let local_names: HashMap<u16, String> = body
            .locals
            .iter()
            .map(|l| {
                let name = if l.name.is_empty() {
                    format!("V_{}", l.index)
                } else {
                    l.name.clone()
                };
                (l.index, name)
            })
            .collect();

        let mut read_locals: HashSet<u16> = HashSet::new();
        let mut read_fields: HashSet<FieldKey> = HashSet::new();
        let mut known_fields: HashMap<FieldKey, FieldRef> = HashMap::new();

        for ins in &body.instructions {
            match (&ins.opcode, &ins.operand) {
                (OpCode::Ldloc, Operand::Local(n)) => {
                    read_locals.insert(*n);
                }
                (OpCode::Ldfld, Operand::Field(f)) => {
                    let key = FieldKey::of(f, false);
                    read_fields.insert(key.clone());
                    known_fields.insert(key, f.clone());
                }
                (OpCode::Ldsfld, Operand::Field(f)) => {
                    let key = FieldKey::of(f, true);
                    read_fields.insert(key.clone());
                    known_fields.insert(key, f.clone());
                }
                (OpCode::Stfld, Operand::Field(f)) => {
                    known_fields.insert(FieldKey::of(f, false), f.clone());
                }
                (OpCode::Stsfld, Operand::Field(f)) => {
                    known_fields.insert(FieldKey::of(f, true), f.clone());
                }
                _ => {}
            }
        }

        let mut out = Vec::new();
        for (index, ins) in body.instructions.iter().enumerate() {
            if is_zero_store(body, index) {
                continue;
            }
            match (&ins.opcode, &ins.operand) {
                (OpCode::Stloc, Operand::Local(n)) => {
                    let Some(&store_type) = local_types.get(n) else {
                        continue;
                    };
                    for local in &body.locals {
                        if local.index == *n
                            || local.var_type != store_type
                            || !read_locals.contains(&local.index)
                        {
                            continue;
                        }
                        out.push(PlannedMutation {
                            patch: Patch::SetOperand {
                                index,
                                operand: Operand::Local(local.index),
                            },
                            index,
                            description: format!(
                                "{}: stloc {} -> {}",
                                offset_tag(original_offsets[index]),
                                local_names[n],
                                local_names[&local.index]
                            ),
                        });
                    }
                }
                (OpCode::Stfld | OpCode::Stsfld, Operand::Field(f)) => {
                    let static_access = ins.opcode == OpCode::Stsfld;
                    let own_key = FieldKey::of(f, static_access);
                    for (key, candidate) in &known_fields {
                        let same_kind = matches!(
                            (key, static_access),
                            (FieldKey::Instance(..), false) | (FieldKey::Static(..), true)
                        );
                        if *key == own_key
                            || !same_kind
                            || candidate.field_type != f.field_type
                            || (!static_access && candidate.declaring_type != f.declaring_type)
                            || !read_fields.contains(key)
                        {
                            continue;
                        }
                        out.push(PlannedMutation {
                            patch: Patch::SetOperand {
                                index,
                                operand: Operand::Field(candidate.clone()),
                            },
                            index,
                            description: format!(
                                "{}: {} {} -> {}",
                                offset_tag(original_offsets[index]),
                                ins.opcode.mnemonic(),
                                f.name,
                                candidate.name
                            ),
                        });
                    }
                }
                _ => {}
            }
        }

        // known_fields iteration order is arbitrary; keep output stable.
        out.sort_by(|a, b| (a.index, &a.description).cmp(&(b.index, &b.description)));
        out
    }
}

/// A store whose value operand is the default value for the slot.
fn is_zero_store(body: &MethodBody, index: usize) -> bool {
    let ins = &body.instructions[index];
    let is_store = matches!(ins.opcode, OpCode::Stloc | OpCode::Stfld | OpCode::Stsfld);
    if !is_store || index == 0 {
        return false;
    }
    let prev = &body.instructions[index - 1];
    matches!(
        (&prev.opcode, &prev.operand),
        (OpCode::LdcI4, Operand::Int(0))
    ) || prev.opcode == OpCode::Ldnull
}
