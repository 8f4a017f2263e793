//! Mutation operators ("turtles") and the machinery they share.
//!
//! A turtle scans a method body for a pattern and plans one mutation per
//! match. [`MutantStream`] drives a plan against the in-memory template:
//! advancing the stream reverts the previous mutation before applying the
//! next one, so the revert contract is structural rather than a property of
//! generator control flow. The template is byte-for-byte pristine between
//! mutants and after the stream finishes.

mod arithmetic;
mod boundary;
mod sequence;
mod variable;

pub use arithmetic::ArithmeticOperatorTurtle;
pub use boundary::ConditionalBoundaryTurtle;
pub use sequence::SequencePointDeletionTurtle;
pub use variable::VariableWriteTurtle;

use std::collections::HashSet;

use clap::ValueEnum;

use crate::assembly::{MethodLocation, Module};
use crate::identity::MethodIdentity;
use crate::il::{
    dispose_pattern_indices, Instruction, MethodBody, OpCode, Operand, SequencePoint,
};

/// A mutation operator over a method's instruction stream.
pub trait MethodTurtle {
    /// Stable operator name used in output and reports.
    fn name(&self) -> &'static str;

    /// Generic description of the change category.
    fn description(&self) -> &'static str;

    /// Scan a macro-simplified body and plan every mutation this operator
    /// yields. `original_offsets[i]` is the pre-simplification offset of
    /// instruction `i`, used for user-facing descriptions and source
    /// attribution.
    fn plan(&self, body: &MethodBody, original_offsets: &[u32]) -> Vec<PlannedMutation>;
}

/// One planned change: what to patch, where it anchors, and how to describe
/// it to a human.
#[derive(Debug, Clone)]
pub struct PlannedMutation {
    pub patch: Patch,
    /// Anchor instruction index in the simplified body.
    pub index: usize,
    pub description: String,
}

/// Structural edit a turtle applies to the template body.
#[derive(Debug, Clone)]
pub enum Patch {
    /// Substitute the opcode, keeping the operand.
    SetOpcode { index: usize, opcode: OpCode },
    /// Substitute the operand, keeping the opcode.
    SetOperand { index: usize, operand: Operand },
    /// Overwrite the whole instruction. Branch targets in the replacement are
    /// expressed against the body's current layout.
    Replace { index: usize, instruction: Instruction },
    /// Swap a comparison opcode and insert `ldc.i4.0, ceq` after it to
    /// negate the result.
    SwapAndNegate { index: usize, opcode: OpCode },
}

impl Patch {
    pub fn anchor(&self) -> usize {
        match self {
            Patch::SetOpcode { index, .. }
            | Patch::SetOperand { index, .. }
            | Patch::Replace { index, .. }
            | Patch::SwapAndNegate { index, .. } => *index,
        }
    }
}

/// Undo record for one applied patch. Branch-target operands are remembered
/// as instruction indices because their byte offsets may differ between the
/// apply-time and revert-time layouts.
#[derive(Debug)]
pub struct AppliedPatch {
    index: usize,
    opcode: OpCode,
    operand: UndoOperand,
    inserted: usize,
}

#[derive(Debug)]
enum UndoOperand {
    Plain(Operand),
    TargetIndex(usize),
}

fn capture_undo(body: &MethodBody, index: usize) -> (OpCode, UndoOperand) {
    let ins = &body.instructions[index];
    let operand = match &ins.operand {
        Operand::Target(t) => {
            let target_index = body
                .index_at_offset(*t)
                .unwrap_or(body.instructions.len());
            UndoOperand::TargetIndex(target_index)
        }
        other => UndoOperand::Plain(other.clone()),
    };
    (ins.opcode, operand)
}

/// Apply a patch to the template and return the record that undoes it.
pub fn apply_patch(body: &mut MethodBody, patch: &Patch) -> AppliedPatch {
    let anchor = patch.anchor();
    let (opcode, operand) = capture_undo(body, anchor);
    let mut applied = AppliedPatch {
        index: anchor,
        opcode,
        operand,
        inserted: 0,
    };

    match patch {
        Patch::SetOpcode { index, opcode } => {
            let mut ins = body.instructions[*index].clone();
            ins.opcode = *opcode;
            body.replace_instruction(*index, ins);
        }
        Patch::SetOperand { index, operand } => {
            let mut ins = body.instructions[*index].clone();
            ins.operand = operand.clone();
            body.replace_instruction(*index, ins);
        }
        Patch::Replace { index, instruction } => {
            body.replace_instruction(*index, instruction.clone());
        }
        Patch::SwapAndNegate { index, opcode } => {
            let mut ins = body.instructions[*index].clone();
            ins.opcode = *opcode;
            body.replace_instruction(*index, ins);
            body.insert_after(
                *index,
                vec![
                    Instruction::new(OpCode::LdcI4, Operand::Int(0)),
                    Instruction::simple(OpCode::Ceq),
                ],
            );
            applied.inserted = 2;
        }
    }
    applied
}

/// Restore the template to its pre-patch state.
pub fn revert_patch(body: &mut MethodBody, applied: AppliedPatch) {
    if applied.inserted > 0 {
        body.remove_after(applied.index, applied.inserted);
    }
    let operand = match applied.operand {
        UndoOperand::Plain(op) => op,
        UndoOperand::TargetIndex(i) => {
            let offset = if i == body.instructions.len() {
                body.end_offset()
            } else {
                body.instructions[i].offset
            };
            Operand::Target(offset)
        }
    };
    body.replace_instruction(applied.index, Instruction::new(applied.opcode, operand));
}

/// A mutated view of the template module, alive until the next advance.
pub struct PendingMutant<'m> {
    pub module: &'m Module,
    pub description: String,
    /// Pre-simplification offset of the mutated instruction.
    pub offset: u32,
}

/// Drives one turtle's plan over one method: simplifies macros up front,
/// applies one mutation per [`MutantStream::advance`] call (reverting the
/// previous one first), and re-packs macros in [`MutantStream::finish`].
pub struct MutantStream<'a> {
    module: &'a mut Module,
    location: MethodLocation,
    plan: Vec<PlannedMutation>,
    original_offsets: Vec<u32>,
    original_sequence_points: Vec<SequencePoint>,
    cursor: usize,
    pending: Option<AppliedPatch>,
    finished: bool,
}

impl<'a> MutantStream<'a> {
    /// Returns `None` when the method has no body to mutate.
    pub fn new(
        module: &'a mut Module,
        location: MethodLocation,
        turtle: &dyn MethodTurtle,
    ) -> Option<MutantStream<'a>> {
        let body = module.method_at_mut(&location).body.as_mut()?;

        let original_offsets: Vec<u32> = body.instructions.iter().map(|i| i.offset).collect();
        let original_sequence_points = body.sequence_points.clone();
        body.simplify_macros();

        let dispose = dispose_pattern_indices(body);
        let mut plan = turtle.plan(body, &original_offsets);
        plan.retain(|p| !dispose.contains(&p.index));

        Some(MutantStream {
            module,
            location,
            plan,
            original_offsets,
            original_sequence_points,
            cursor: 0,
            pending: None,
            finished: false,
        })
    }

    fn body_mut(&mut self) -> &mut MethodBody {
        self.module
            .method_at_mut(&self.location)
            .body
            .as_mut()
            .expect("mutation stream target keeps its body")
    }

    /// Number of planned mutations.
    pub fn len(&self) -> usize {
        self.plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    /// Sequence points as they were before macro simplification; offsets here
    /// match the offsets reported on yielded mutants.
    pub fn original_sequence_points(&self) -> &[SequencePoint] {
        &self.original_sequence_points
    }

    fn revert_pending(&mut self) {
        if let Some(applied) = self.pending.take() {
            let body = self.body_mut();
            revert_patch(body, applied);
        }
    }

    /// Revert the previous mutation (if any) and apply the next one. The
    /// returned view stays valid until the next `advance`/`finish` call.
    pub fn advance(&mut self) -> Option<PendingMutant<'_>> {
        self.revert_pending();
        let planned = self.plan.get(self.cursor)?.clone();
        self.cursor += 1;

        let offset = self
            .original_offsets
            .get(planned.index)
            .copied()
            .unwrap_or(0);
        let applied = {
            let body = self.body_mut();
            apply_patch(body, &planned.patch)
        };
        self.pending = Some(applied);

        Some(PendingMutant {
            module: &*self.module,
            description: planned.description,
            offset,
        })
    }

    /// Revert any pending mutation and restore the compact encoding.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.revert_pending();
        self.body_mut().optimize_macros();
        self.finished = true;
    }
}

impl Drop for MutantStream<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Format an instruction offset the way disassemblers label it.
pub(crate) fn offset_tag(offset: u32) -> String {
    format!("IL_{offset:04x}")
}

pub(crate) fn generated_logical_name(name: &str) -> Option<&str> {
    let rest = name.strip_prefix('<')?;
    let (logical, _) = rest.split_once('>')?;
    (!logical.is_empty()).then_some(logical)
}

/// The compiler lowers one source method into several IL methods for
/// iterators/async blocks, lambdas with captures, and anonymous delegates.
/// Every turtle applies to each of those bodies in addition to the primary
/// one.
pub fn expand_targets(module: &Module, location: &MethodLocation) -> Vec<MethodLocation> {
    let mut out = vec![location.clone()];
    let type_def = module.type_at(&location.type_path);
    let method = &type_def.methods[location.method_index];
    let logical = method.name.clone();

    let referenced: HashSet<MethodIdentity> = method
        .body
        .iter()
        .flat_map(|b| b.instructions.iter())
        .filter(|ins| ins.opcode.is_call_like())
        .filter_map(|ins| match &ins.operand {
            Operand::Method(m) => Some(MethodIdentity::of_ref(m)),
            _ => None,
        })
        .collect();

    for (i, nested) in type_def.nested_types.iter().enumerate() {
        let leaf = nested.leaf_name();
        let mut nested_path = location.type_path.clone();
        nested_path.push(i);

        if generated_logical_name(leaf) == Some(logical.as_str()) && leaf.contains("d__") {
            // Iterator/async state machine: mutate its MoveNext.
            for (j, m) in nested.methods.iter().enumerate() {
                if m.name == "MoveNext" && m.body.is_some() {
                    out.push(MethodLocation {
                        type_path: nested_path.clone(),
                        method_index: j,
                    });
                }
            }
        } else if leaf.starts_with("<>c") {
            // Closure class: only the methods the primary body references.
            for (j, m) in nested.methods.iter().enumerate() {
                if m.body.is_some()
                    && referenced.contains(&MethodIdentity::of_def(&nested.full_name, m))
                {
                    out.push(MethodLocation {
                        type_path: nested_path.clone(),
                        method_index: j,
                    });
                }
            }
        }
    }

    // Anonymous delegates lowered as siblings: `<M>b__N` on the same type.
    for (j, sibling) in type_def.methods.iter().enumerate() {
        if j != location.method_index
            && sibling.body.is_some()
            && generated_logical_name(&sibling.name) == Some(logical.as_str())
            && sibling.name.contains("b__")
        {
            out.push(MethodLocation {
                type_path: location.type_path.clone(),
                method_index: j,
            });
        }
    }

    out
}

/// Built-in operator selection, as exposed on the CLI and the configuration
/// builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TurtleKind {
    Arithmetic,
    Boundary,
    SequencePoint,
    VariableWrite,
}

impl TurtleKind {
    pub fn all() -> Vec<TurtleKind> {
        vec![
            TurtleKind::Arithmetic,
            TurtleKind::Boundary,
            TurtleKind::SequencePoint,
            TurtleKind::VariableWrite,
        ]
    }

    pub fn instantiate(self) -> Box<dyn MethodTurtle> {
        match self {
            TurtleKind::Arithmetic => Box::new(ArithmeticOperatorTurtle),
            TurtleKind::Boundary => Box::new(ConditionalBoundaryTurtle),
            TurtleKind::SequencePoint => Box::new(SequencePointDeletionTurtle),
            TurtleKind::VariableWrite => Box::new(VariableWriteTurtle),
        }
    }
}
