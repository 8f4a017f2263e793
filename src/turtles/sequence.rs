use crate::il::{
    dispose_pattern_indices, Instruction, MethodBody, OpCode, Operand,
};

use super::{offset_tag, MethodTurtle, Patch, PlannedMutation};

/// Line number PDB writers use to mark a sequence point as hidden.
const HIDDEN_LINE: u32 = 0x00FE_EFEE;

/// Deletes the instruction run between two adjacent sequence points by
/// branching straight to the next marker.
///
/// Runs whose deletion can never change observable behavior are suppressed:
/// all-nop, all-pop, and transfer-only runs, runs containing a return,
/// compiler-generated dispose cleanup, constructor-chaining calls, and
/// zero-initialization of a field. The runtime zero-initializes anyway and
/// the rest produce equivalent mutants, which waste test runs.
pub struct SequencePointDeletionTurtle;

impl MethodTurtle for SequencePointDeletionTurtle {
    fn name(&self) -> &'static str {
        "sequence-point"
    }

    fn description(&self) -> &'static str {
        "deletes the instructions between adjacent sequence points"
    }

    fn plan(&self, body: &MethodBody, original_offsets: &[u32]) -> Vec<PlannedMutation> {
        let mut points = body.sequence_points.clone();
        points.sort_by_key(|sp| sp.offset);

        let dispose = dispose_pattern_indices(body);
        let mut out = Vec::new();

        for pair in points.windows(2) {
            let (here, next) = (&pair[0], &pair[1]);
            if here.start_line == HIDDEN_LINE {
                continue;
            }
            let Some(start) = body.index_at_offset(here.offset) else {
                continue;
            };
            let Some(end) = body.index_at_offset(next.offset) else {
                continue;
            };
            if start >= end {
                continue;
            }

            let run = &body.instructions[start..end];
            if is_equivalent_when_deleted(run) || (start..end).any(|i| dispose.contains(&i)) {
                continue;
            }

            out.push(PlannedMutation {
                patch: Patch::Replace {
                    index: start,
                    instruction: Instruction::new(OpCode::Br, Operand::Target(next.offset)),
                },
                index: start,
                description: format!(
                    "{}-{}: sequence deleted (line {})",
                    offset_tag(original_offsets[start]),
                    offset_tag(original_offsets[end - 1]),
                    here.start_line
                ),
            });
        }
        out
    }
}

fn is_equivalent_when_deleted(run: &[Instruction]) -> bool {
    run.iter().all(|i| i.opcode == OpCode::Nop)
        || run.iter().all(|i| i.opcode == OpCode::Pop)
        || run.iter().all(|i| i.opcode.is_control_transfer())
        || run.iter().any(|i| i.opcode == OpCode::Ret)
        || is_constructor_chain(run)
        || is_zero_field_init(run)
}

/// `ldarg.0, ..., call .ctor`: chaining to a base or sibling constructor.
fn is_constructor_chain(run: &[Instruction]) -> bool {
    let starts_with_this = matches!(
        run.first(),
        Some(ins) if ins.opcode == OpCode::Ldarg && ins.operand == Operand::Arg(0)
    );
    starts_with_this
        && run.iter().any(|ins| {
            ins.opcode == OpCode::Call
                && matches!(&ins.operand, Operand::Method(m) if m.name == ".ctor")
        })
}

/// `ldarg.0, (ldc.i4.0 | ldnull), stfld`: storing the default value the
/// runtime already guarantees.
fn is_zero_field_init(run: &[Instruction]) -> bool {
    if run.len() != 3 {
        return false;
    }
    run[0].opcode == OpCode::Ldarg
        && run[0].operand == Operand::Arg(0)
        && (matches!(
            (&run[1].opcode, &run[1].operand),
            (OpCode::LdcI4, Operand::Int(0))
        ) || run[1].opcode == OpCode::Ldnull)
        && run[2].opcode == OpCode::Stfld
}
