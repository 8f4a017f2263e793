use crate::il::{MethodBody, OpCode};

use super::{offset_tag, MethodTurtle, Patch, PlannedMutation};

/// Inverts the strictness of relational comparisons: the comparison opcode is
/// swapped for its mirror and a compare-to-zero negation is inserted after
/// it, so `a < b` becomes `!(a > b)`, i.e. `a <= b`.
pub struct ConditionalBoundaryTurtle;

fn mirrored(opcode: OpCode) -> Option<OpCode> {
    match opcode {
        OpCode::Clt => Some(OpCode::Cgt),
        OpCode::Cgt => Some(OpCode::Clt),
        OpCode::CltUn => Some(OpCode::CgtUn),
        OpCode::CgtUn => Some(OpCode::CltUn),
        _ => None,
    }
}

impl MethodTurtle for ConditionalBoundaryTurtle {
    fn name(&self) -> &'static str {
        "boundary"
    }

    fn description(&self) -> &'static str {
        "inverts the strictness of relational comparisons"
    }

    fn plan(&self, body: &MethodBody, original_offsets: &[u32]) -> Vec<PlannedMutation> {
        let mut out = Vec::new();
        for (index, ins) in body.instructions.iter().enumerate() {
            let Some(swap) = mirrored(ins.opcode) else {
                continue;
            };
            out.push(PlannedMutation {
                patch: Patch::SwapAndNegate {
                    index,
                    opcode: swap,
                },
                index,
                description: format!(
                    "{}: {} -> not {}",
                    offset_tag(original_offsets[index]),
                    ins.opcode.mnemonic(),
                    swap.mnemonic()
                ),
            });
        }
        out
    }
}
