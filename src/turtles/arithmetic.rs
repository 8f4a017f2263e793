use crate::il::{MethodBody, OpCode};

use super::{offset_tag, MethodTurtle, Patch, PlannedMutation};

const ROTATION: [OpCode; 5] = [
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Rem,
];

/// Replaces each arithmetic opcode with each of the other four in turn.
pub struct ArithmeticOperatorTurtle;

impl MethodTurtle for ArithmeticOperatorTurtle {
    fn name(&self) -> &'static str {
        "arithmetic"
    }

    fn description(&self) -> &'static str {
        "rotates arithmetic operators through add, sub, mul, div and rem"
    }

    fn plan(&self, body: &MethodBody, original_offsets: &[u32]) -> Vec<PlannedMutation> {
        let mut out = Vec::new();
        for (index, ins) in body.instructions.iter().enumerate() {
            if !ROTATION.contains(&ins.opcode) {
                continue;
            }
            for &replacement in ROTATION.iter().filter(|&&op| op != ins.opcode) {
                out.push(PlannedMutation {
                    patch: Patch::SetOpcode {
                        index,
                        opcode: replacement,
                    },
                    index,
                    description: format!(
                        "{}: {} -> {}",
                        offset_tag(original_offsets[index]),
                        ins.opcode.mnemonic(),
                        replacement.mnemonic()
                    ),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::Instruction;

    #[test]
    fn each_arithmetic_opcode_yields_four_rotations() {
        let mut body = MethodBody::new(vec![
            Instruction::simple(OpCode::Ldarg0),
            Instruction::simple(OpCode::Ldarg1),
            Instruction::simple(OpCode::Add),
            Instruction::simple(OpCode::Ret),
        ]);
        let original_offsets: Vec<u32> = body.instructions.iter().map(|i| i.offset).collect();
        body.simplify_macros();

        let plan = ArithmeticOperatorTurtle.plan(&body, &original_offsets);
        let descriptions: Vec<&str> = plan.iter().map(|p| p.description.as_str()).collect();
        insta::assert_debug_snapshot!(descriptions, @r#"
        [
            "IL_0002: add -> sub",
            "IL_0002: add -> mul",
            "IL_0002: add -> div",
            "IL_0002: add -> rem",
        ]
        "#);
    }

    #[test]
    fn methods_without_arithmetic_yield_nothing() {
        let body = MethodBody::new(vec![
            Instruction::simple(OpCode::Ldarg0),
            Instruction::simple(OpCode::Ret),
        ]);
        let offsets: Vec<u32> = body.instructions.iter().map(|i| i.offset).collect();
        assert!(ArithmeticOperatorTurtle.plan(&body, &offsets).is_empty());
    }
}
