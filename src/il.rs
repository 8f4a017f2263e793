use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// CIL opcodes understood by the engine, in both canonical long form and the
/// compact short/micro encodings the optimizer emits.
///
/// The set is not the full instruction catalogue: it is the subset a decoded
/// module image carries through mutation testing. Sizes follow the ECMA-335
/// encodings so instruction offsets stay meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Nop,
    Pop,
    Dup,
    Ret,
    Throw,
    Endfinally,

    Add,
    Sub,
    Mul,
    Div,
    Rem,

    Ceq,
    Clt,
    CltUn,
    Cgt,
    CgtUn,

    Br,
    Brtrue,
    Brfalse,
    Leave,
    BrS,
    BrtrueS,
    BrfalseS,
    LeaveS,

    LdcI4,
    LdcI4S,
    LdcI4M1,
    LdcI40,
    LdcI41,
    LdcI42,
    LdcI43,
    LdcI44,
    LdcI45,
    LdcI46,
    LdcI47,
    LdcI48,

    Ldloc,
    LdlocS,
    Ldloc0,
    Ldloc1,
    Ldloc2,
    Ldloc3,
    Stloc,
    StlocS,
    Stloc0,
    Stloc1,
    Stloc2,
    Stloc3,

    Ldarg,
    LdargS,
    Ldarg0,
    Ldarg1,
    Ldarg2,
    Ldarg3,
    Starg,
    StargS,

    Ldnull,
    Ldstr,

    Ldfld,
    Stfld,
    Ldsfld,
    Stsfld,

    Call,
    Callvirt,
    Newobj,
    Ldftn,
}

impl OpCode {
    /// Encoded length of the opcode itself (1 byte, or 2 for `0xFE`-prefixed).
    pub fn opcode_len(self) -> u32 {
        use OpCode::*;
        match self {
            Ceq | Clt | CltUn | Cgt | CgtUn | Ldftn | Ldloc | Stloc | Ldarg | Starg => 2,
            _ => 1,
        }
    }

    /// Encoded length of the inline operand for this opcode's form.
    pub fn operand_len(self) -> u32 {
        use OpCode::*;
        match self {
            Br | Brtrue | Brfalse | Leave | LdcI4 | Ldstr | Ldfld | Stfld | Ldsfld | Stsfld
            | Call | Callvirt | Newobj | Ldftn => 4,
            Ldloc | Stloc | Ldarg | Starg => 2,
            BrS | BrtrueS | BrfalseS | LeaveS | LdcI4S | LdlocS | StlocS | LdargS | StargS => 1,
            _ => 0,
        }
    }

    pub fn is_branch(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Br | Brtrue | Brfalse | Leave | BrS | BrtrueS | BrfalseS | LeaveS
        )
    }

    /// Instructions that transfer control without computing anything.
    pub fn is_control_transfer(self) -> bool {
        self.is_branch() || matches!(self, OpCode::Ret | OpCode::Endfinally | OpCode::Throw)
    }

    pub fn is_call_like(self) -> bool {
        use OpCode::*;
        matches!(self, Call | Callvirt | Newobj | Ldftn)
    }

    pub fn is_load_local(self) -> bool {
        use OpCode::*;
        matches!(self, Ldloc | LdlocS | Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3)
    }

    pub fn is_store_local(self) -> bool {
        use OpCode::*;
        matches!(self, Stloc | StlocS | Stloc0 | Stloc1 | Stloc2 | Stloc3)
    }

    /// ECMA-335 assembler mnemonic.
    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Nop => "nop",
            Pop => "pop",
            Dup => "dup",
            Ret => "ret",
            Throw => "throw",
            Endfinally => "endfinally",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            Ceq => "ceq",
            Clt => "clt",
            CltUn => "clt.un",
            Cgt => "cgt",
            CgtUn => "cgt.un",
            Br => "br",
            Brtrue => "brtrue",
            Brfalse => "brfalse",
            Leave => "leave",
            BrS => "br.s",
            BrtrueS => "brtrue.s",
            BrfalseS => "brfalse.s",
            LeaveS => "leave.s",
            LdcI4 => "ldc.i4",
            LdcI4S => "ldc.i4.s",
            LdcI4M1 => "ldc.i4.m1",
            LdcI40 => "ldc.i4.0",
            LdcI41 => "ldc.i4.1",
            LdcI42 => "ldc.i4.2",
            LdcI43 => "ldc.i4.3",
            LdcI44 => "ldc.i4.4",
            LdcI45 => "ldc.i4.5",
            LdcI46 => "ldc.i4.6",
            LdcI47 => "ldc.i4.7",
            LdcI48 => "ldc.i4.8",
            Ldloc => "ldloc",
            LdlocS => "ldloc.s",
            Ldloc0 => "ldloc.0",
            Ldloc1 => "ldloc.1",
            Ldloc2 => "ldloc.2",
            Ldloc3 => "ldloc.3",
            Stloc => "stloc",
            StlocS => "stloc.s",
            Stloc0 => "stloc.0",
            Stloc1 => "stloc.1",
            Stloc2 => "stloc.2",
            Stloc3 => "stloc.3",
            Ldarg => "ldarg",
            LdargS => "ldarg.s",
            Ldarg0 => "ldarg.0",
            Ldarg1 => "ldarg.1",
            Ldarg2 => "ldarg.2",
            Ldarg3 => "ldarg.3",
            Starg => "starg",
            StargS => "starg.s",
            Ldnull => "ldnull",
            Ldstr => "ldstr",
            Ldfld => "ldfld",
            Stfld => "stfld",
            Ldsfld => "ldsfld",
            Stsfld => "stsfld",
            Call => "call",
            Callvirt => "callvirt",
            Newobj => "newobj",
            Ldftn => "ldftn",
        }
    }
}

/// Reference to a field, resolved to names the way the image decoder emits
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring_type: String,
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub is_static: bool,
}

fn system_void() -> String {
    "System.Void".to_string()
}

/// Reference to a method, as it appears in a call-site operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: String,
    pub name: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default = "system_void")]
    pub return_type: String,
    #[serde(default)]
    pub generic_arity: u16,
    /// Type arguments of a generic instantiation at this call site.
    #[serde(default)]
    pub generic_args: Vec<String>,
}

/// Inline operand of an instruction. Branch operands hold the byte offset of
/// the target instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Operand {
    #[default]
    None,
    Int(i32),
    Local(u16),
    Arg(u16),
    Target(u32),
    Str(String),
    Field(FieldRef),
    Method(MethodRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(default)]
    pub offset: u32,
    pub opcode: OpCode,
    #[serde(default)]
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Self {
            offset: 0,
            opcode,
            operand,
        }
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn size(&self) -> u32 {
        self.opcode.opcode_len() + self.opcode.operand_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch,
    Finally,
    Fault,
}

/// Protected-region descriptor. All boundaries are instruction offsets; the
/// end offsets are exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

/// Debug-symbol marker associating an instruction offset with a source range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePoint {
    pub offset: u32,
    pub document: PathBuf,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub start_column: u32,
    #[serde(default)]
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVar {
    pub index: u16,
    #[serde(default)]
    pub name: String,
    pub var_type: String,
}

/// A method's executable instruction stream plus the structures that reference
/// it by offset.
///
/// Invariant: instruction offsets are always derivable from the instruction
/// sequence via [`MethodBody::update_offsets`], and every `Operand::Target`,
/// handler boundary, and sequence point lands on an instruction start (or the
/// end-of-body offset). Every structural edit below preserves this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MethodBody {
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub locals: Vec<LocalVar>,
    #[serde(default)]
    pub exception_handlers: Vec<ExceptionHandler>,
    #[serde(default)]
    pub sequence_points: Vec<SequencePoint>,
}

impl MethodBody {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        let mut body = Self {
            instructions,
            ..Self::default()
        };
        body.update_offsets();
        body
    }

    /// Recompute all instruction offsets from the encoded sizes. Does not
    /// touch branch targets; callers that change layout use
    /// [`MethodBody::remap_layout`] or shift targets themselves.
    pub fn update_offsets(&mut self) {
        let mut offset = 0u32;
        for ins in &mut self.instructions {
            ins.offset = offset;
            offset += ins.size();
        }
    }

    /// Offsets of every instruction plus the end-of-body offset. Used to
    /// remap offset references across layout changes that keep the
    /// instruction count fixed.
    fn layout(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.instructions.iter().map(|i| i.offset).collect();
        let end = self
            .instructions
            .last()
            .map(|i| i.offset + i.size())
            .unwrap_or(0);
        out.push(end);
        out
    }

    /// Translate every branch target, handler boundary, and sequence point
    /// from the layout captured in `old` to the current layout. The
    /// instruction count must be unchanged since `old` was captured.
    fn remap_layout(&mut self, old: &[u32]) {
        let new = self.layout();
        debug_assert_eq!(old.len(), new.len(), "layout remap requires equal counts");

        let map: HashMap<u32, u32> = old.iter().copied().zip(new.iter().copied()).collect();
        let translate = |offset: u32| -> u32 {
            match map.get(&offset) {
                Some(n) => *n,
                None => {
                    debug_assert!(false, "offset {offset} is not an instruction boundary");
                    offset
                }
            }
        };

        for ins in &mut self.instructions {
            if let Operand::Target(t) = &mut ins.operand {
                *t = translate(*t);
            }
        }
        for h in &mut self.exception_handlers {
            h.try_start = translate(h.try_start);
            h.try_end = translate(h.try_end);
            h.handler_start = translate(h.handler_start);
            h.handler_end = translate(h.handler_end);
        }
        for sp in &mut self.sequence_points {
            sp.offset = translate(sp.offset);
        }
    }

    pub fn index_at_offset(&self, offset: u32) -> Option<usize> {
        self.instructions.iter().position(|i| i.offset == offset)
    }

    pub fn end_offset(&self) -> u32 {
        self.instructions
            .last()
            .map(|i| i.offset + i.size())
            .unwrap_or(0)
    }

    /// The sequence point covering `offset`: the nearest marker at or before
    /// it. `None` when no debug symbols were loaded.
    pub fn sequence_point_at(&self, offset: u32) -> Option<&SequencePoint> {
        self.sequence_points
            .iter()
            .filter(|sp| sp.offset <= offset)
            .max_by_key(|sp| sp.offset)
    }

    /// Expand every short/micro encoding into its canonical long form so that
    /// instruction offsets are stable under mutation. The inverse is
    /// [`MethodBody::optimize_macros`]; round-tripping is the identity.
    pub fn simplify_macros(&mut self) {
        let old = self.layout();
        for ins in &mut self.instructions {
            expand_macro(ins);
        }
        self.update_offsets();
        self.remap_layout(&old);
    }

    /// Re-pack canonical long forms into the compact encodings used on disk.
    pub fn optimize_macros(&mut self) {
        let old = self.layout();
        for ins in &mut self.instructions {
            pack_macro(ins);
        }
        self.update_offsets();
        self.remap_layout(&old);

        // Branch displacements only shrink as forms get shorter, so packing
        // iterates to a fixpoint.
        loop {
            let old = self.layout();
            let mut changed = false;
            for ins in &mut self.instructions {
                let Some(short) = short_branch_form(ins.opcode) else {
                    continue;
                };
                if let Operand::Target(t) = ins.operand {
                    let rel = i64::from(t) - i64::from(ins.offset + 2);
                    if (-128..=127).contains(&rel) {
                        ins.opcode = short;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
            self.update_offsets();
            self.remap_layout(&old);
        }
    }

    /// Replace the instruction at `index`, remapping every offset reference
    /// across any size difference. Branch targets in `new` are interpreted
    /// against the pre-replacement layout. Returns the displaced instruction.
    pub fn replace_instruction(&mut self, index: usize, new: Instruction) -> Instruction {
        let old = self.layout();
        let original = std::mem::replace(&mut self.instructions[index], new);
        self.update_offsets();
        self.remap_layout(&old);
        original
    }

    /// Insert `new` immediately after `index`. Existing references to the
    /// instruction that followed `index` keep pointing at it, so inserted
    /// code executes only on the fall-through path.
    pub fn insert_after(&mut self, index: usize, new: Vec<Instruction>) {
        let added: u32 = new.iter().map(Instruction::size).sum();
        let anchor = &self.instructions[index];
        let insert_point = anchor.offset + anchor.size();

        for ins in &mut self.instructions {
            if let Operand::Target(t) = &mut ins.operand {
                if *t >= insert_point {
                    *t += added;
                }
            }
        }
        for h in &mut self.exception_handlers {
            for b in [
                &mut h.try_start,
                &mut h.try_end,
                &mut h.handler_start,
                &mut h.handler_end,
            ] {
                if *b >= insert_point {
                    *b += added;
                }
            }
        }
        for sp in &mut self.sequence_points {
            if sp.offset >= insert_point {
                sp.offset += added;
            }
        }

        let at = index + 1;
        for (k, ins) in new.into_iter().enumerate() {
            self.instructions.insert(at + k, ins);
        }
        self.update_offsets();
    }

    /// Exact inverse of [`MethodBody::insert_after`]: drop `count`
    /// instructions following `index` and shift offset references back.
    pub fn remove_after(&mut self, index: usize, count: usize) {
        let start = index + 1;
        let removed: u32 = self.instructions[start..start + count]
            .iter()
            .map(Instruction::size)
            .sum();
        let removal_point = self.instructions[start].offset;
        self.instructions.drain(start..start + count);

        for ins in &mut self.instructions {
            if let Operand::Target(t) = &mut ins.operand {
                debug_assert!(
                    *t < removal_point || *t >= removal_point + removed,
                    "branch targets removed instructions"
                );
                if *t >= removal_point + removed {
                    *t -= removed;
                }
            }
        }
        for h in &mut self.exception_handlers {
            for b in [
                &mut h.try_start,
                &mut h.try_end,
                &mut h.handler_start,
                &mut h.handler_end,
            ] {
                if *b >= removal_point + removed {
                    *b -= removed;
                }
            }
        }
        for sp in &mut self.sequence_points {
            if sp.offset >= removal_point + removed {
                sp.offset -= removed;
            }
        }
        self.update_offsets();
    }
}

fn expand_macro(ins: &mut Instruction) {
    use OpCode::*;
    let (opcode, operand) = match ins.opcode {
        BrS => (Br, None),
        BrtrueS => (Brtrue, None),
        BrfalseS => (Brfalse, None),
        LeaveS => (Leave, None),
        LdcI4S => (LdcI4, None),
        LdcI4M1 => (LdcI4, Some(Operand::Int(-1))),
        LdcI40 => (LdcI4, Some(Operand::Int(0))),
        LdcI41 => (LdcI4, Some(Operand::Int(1))),
        LdcI42 => (LdcI4, Some(Operand::Int(2))),
        LdcI43 => (LdcI4, Some(Operand::Int(3))),
        LdcI44 => (LdcI4, Some(Operand::Int(4))),
        LdcI45 => (LdcI4, Some(Operand::Int(5))),
        LdcI46 => (LdcI4, Some(Operand::Int(6))),
        LdcI47 => (LdcI4, Some(Operand::Int(7))),
        LdcI48 => (LdcI4, Some(Operand::Int(8))),
        LdlocS => (Ldloc, None),
        Ldloc0 => (Ldloc, Some(Operand::Local(0))),
        Ldloc1 => (Ldloc, Some(Operand::Local(1))),
        Ldloc2 => (Ldloc, Some(Operand::Local(2))),
        Ldloc3 => (Ldloc, Some(Operand::Local(3))),
        StlocS => (Stloc, None),
        Stloc0 => (Stloc, Some(Operand::Local(0))),
        Stloc1 => (Stloc, Some(Operand::Local(1))),
        Stloc2 => (Stloc, Some(Operand::Local(2))),
        Stloc3 => (Stloc, Some(Operand::Local(3))),
        LdargS => (Ldarg, None),
        Ldarg0 => (Ldarg, Some(Operand::Arg(0))),
        Ldarg1 => (Ldarg, Some(Operand::Arg(1))),
        Ldarg2 => (Ldarg, Some(Operand::Arg(2))),
        Ldarg3 => (Ldarg, Some(Operand::Arg(3))),
        StargS => (Starg, None),
        _ => return,
    };
    ins.opcode = opcode;
    if let Some(op) = operand {
        ins.operand = op;
    }
}

fn pack_macro(ins: &mut Instruction) {
    use OpCode::*;
    match (ins.opcode, &ins.operand) {
        (LdcI4, Operand::Int(v)) => match *v {
            -1 => set_micro(ins, LdcI4M1),
            0 => set_micro(ins, LdcI40),
            1 => set_micro(ins, LdcI41),
            2 => set_micro(ins, LdcI42),
            3 => set_micro(ins, LdcI43),
            4 => set_micro(ins, LdcI44),
            5 => set_micro(ins, LdcI45),
            6 => set_micro(ins, LdcI46),
            7 => set_micro(ins, LdcI47),
            8 => set_micro(ins, LdcI48),
            v if i8::try_from(v).is_ok() => ins.opcode = LdcI4S,
            _ => {}
        },
        (Ldloc, Operand::Local(n)) => match *n {
            0 => set_micro(ins, Ldloc0),
            1 => set_micro(ins, Ldloc1),
            2 => set_micro(ins, Ldloc2),
            3 => set_micro(ins, Ldloc3),
            n if n <= u16::from(u8::MAX) => ins.opcode = LdlocS,
            _ => {}
        },
        (Stloc, Operand::Local(n)) => match *n {
            0 => set_micro(ins, Stloc0),
            1 => set_micro(ins, Stloc1),
            2 => set_micro(ins, Stloc2),
            3 => set_micro(ins, Stloc3),
            n if n <= u16::from(u8::MAX) => ins.opcode = StlocS,
            _ => {}
        },
        (Ldarg, Operand::Arg(n)) => match *n {
            0 => set_micro(ins, Ldarg0),
            1 => set_micro(ins, Ldarg1),
            2 => set_micro(ins, Ldarg2),
            3 => set_micro(ins, Ldarg3),
            n if n <= u16::from(u8::MAX) => ins.opcode = LdargS,
            _ => {}
        },
        (Starg, Operand::Arg(n)) => {
            if *n <= u16::from(u8::MAX) {
                ins.opcode = StargS;
            }
        }
        _ => {}
    }
}

fn set_micro(ins: &mut Instruction, opcode: OpCode) {
    ins.opcode = opcode;
    ins.operand = Operand::None;
}

fn short_branch_form(opcode: OpCode) -> Option<OpCode> {
    use OpCode::*;
    match opcode {
        Br => Some(BrS),
        Brtrue => Some(BrtrueS),
        Brfalse => Some(BrfalseS),
        Leave => Some(LeaveS),
        _ => None,
    }
}

fn is_dispose_call(ins: &Instruction) -> bool {
    matches!(ins.opcode, OpCode::Call | OpCode::Callvirt)
        && matches!(&ins.operand, Operand::Method(m) if m.name == "Dispose")
}

/// Indices of instructions belonging to a compiler-generated `Dispose`
/// cleanup pattern. Recognized shapes are fixed opcode windows anchored at an
/// `Endfinally`:
///
/// - `ldloc.N, brfalse L, ldloc.N, callvirt Dispose, [nop...], endfinally`
/// - `ldloc.N, callvirt Dispose, [nop...], endfinally`
///
/// plus the `leave` exiting the protected region just before the handler.
pub fn dispose_pattern_indices(body: &MethodBody) -> HashSet<usize> {
    let mut out = HashSet::new();
    let instructions = &body.instructions;

    for end in 0..instructions.len() {
        if instructions[end].opcode != OpCode::Endfinally {
            continue;
        }
        let Some(start) = dispose_window_start(instructions, end) else {
            continue;
        };
        out.extend(start..=end);
        if start > 0
            && matches!(
                instructions[start - 1].opcode,
                OpCode::Leave | OpCode::LeaveS
            )
        {
            out.insert(start - 1);
        }
    }
    out
}

fn dispose_window_start(instructions: &[Instruction], end: usize) -> Option<usize> {
    let mut j = end;
    while j > 0 && instructions[j - 1].opcode == OpCode::Nop {
        j -= 1;
    }
    if j == 0 || !is_dispose_call(&instructions[j - 1]) {
        return None;
    }
    let call = j - 1;
    if call == 0 || !instructions[call - 1].opcode.is_load_local() {
        return None;
    }
    let load = call - 1;

    // Null-guarded form: ldloc, brfalse, ldloc, callvirt Dispose.
    if load >= 2
        && matches!(
            instructions[load - 1].opcode,
            OpCode::Brfalse | OpCode::BrfalseS
        )
        && instructions[load - 2].opcode.is_load_local()
    {
        return Some(load - 2);
    }
    Some(load)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branchy_body() -> MethodBody {
        // if (arg0) { x = 1 } else { x = 2 }; return x
        let mut body = MethodBody::new(vec![
            Instruction::simple(OpCode::Ldarg0),
            Instruction::new(OpCode::BrfalseS, Operand::Target(0)),
            Instruction::simple(OpCode::LdcI41),
            Instruction::simple(OpCode::Stloc0),
            Instruction::new(OpCode::BrS, Operand::Target(0)),
            Instruction::simple(OpCode::LdcI42),
            Instruction::simple(OpCode::Stloc0),
            Instruction::simple(OpCode::Ldloc0),
            Instruction::simple(OpCode::Ret),
        ]);
        body.locals.push(LocalVar {
            index: 0,
            name: "x".to_string(),
            var_type: "System.Int32".to_string(),
        });
        let else_branch = body.instructions[5].offset;
        let join = body.instructions[7].offset;
        body.instructions[1].operand = Operand::Target(else_branch);
        body.instructions[4].operand = Operand::Target(join);
        body
    }

    #[test]
    fn update_offsets_uses_encoded_sizes() {
        let body = branchy_body();
        let offsets: Vec<u32> = body.instructions.iter().map(|i| i.offset).collect();
        // ldarg.0(1) brfalse.s(2) ldc.i4.1(1) stloc.0(1) br.s(2)
        // ldc.i4.2(1) stloc.0(1) ldloc.0(1) ret(1)
        assert_eq!(offsets, vec![0, 1, 3, 4, 5, 7, 8, 9, 10]);
    }

    #[test]
    fn simplify_then_optimize_is_identity() {
        let original = branchy_body();
        let mut body = original.clone();

        body.simplify_macros();
        assert!(
            body.instructions
                .iter()
                .all(|i| !matches!(i.opcode, OpCode::BrS | OpCode::BrfalseS | OpCode::LdcI41)),
            "short forms must be gone after simplify"
        );

        body.optimize_macros();
        assert_eq!(body, original);
    }

    #[test]
    fn simplify_remaps_branch_targets() {
        let mut body = branchy_body();
        body.simplify_macros();

        let else_offset = body.instructions[5].offset;
        let join_offset = body.instructions[7].offset;
        assert_eq!(body.instructions[1].operand, Operand::Target(else_offset));
        assert_eq!(body.instructions[4].operand, Operand::Target(join_offset));
    }

    #[test]
    fn replace_instruction_roundtrip_is_byte_identical() {
        let mut body = branchy_body();
        body.simplify_macros();
        let before = body.clone();

        // Overwrite a 5-byte ldc with a 1-byte nop; every later offset and
        // both branch targets shift, and revert must shift them back.
        let original = body.replace_instruction(2, Instruction::simple(OpCode::Nop));
        assert_ne!(body, before);

        body.replace_instruction(2, original);
        assert_eq!(body, before);
    }

    #[test]
    fn insert_then_remove_is_byte_identical() {
        let mut body = branchy_body();
        body.simplify_macros();
        let before = body.clone();

        body.insert_after(
            2,
            vec![
                Instruction::new(OpCode::LdcI4, Operand::Int(0)),
                Instruction::simple(OpCode::Ceq),
            ],
        );
        assert_eq!(body.instructions.len(), before.instructions.len() + 2);

        body.remove_after(2, 2);
        assert_eq!(body, before);
    }

    #[test]
    fn insert_after_keeps_existing_targets_on_old_successor() {
        let mut body = branchy_body();
        body.simplify_macros();
        // brfalse at [1] targets the else branch at [5].
        body.insert_after(2, vec![Instruction::simple(OpCode::Nop)]);

        let else_offset = body.instructions[6].offset;
        assert_eq!(body.instructions[1].operand, Operand::Target(else_offset));
    }

    #[test]
    fn sequence_point_lookup_picks_nearest_preceding_marker() {
        let mut body = branchy_body();
        body.sequence_points = vec![
            SequencePoint {
                offset: 0,
                document: PathBuf::from("Calc.cs"),
                start_line: 10,
                end_line: 10,
                start_column: 1,
                end_column: 20,
            },
            SequencePoint {
                offset: 5,
                document: PathBuf::from("Calc.cs"),
                start_line: 12,
                end_line: 12,
                start_column: 1,
                end_column: 20,
            },
        ];
        assert_eq!(body.sequence_point_at(4).unwrap().start_line, 10);
        assert_eq!(body.sequence_point_at(5).unwrap().start_line, 12);
        assert_eq!(body.sequence_point_at(9).unwrap().start_line, 12);
    }

    fn dispose_ref() -> MethodRef {
        MethodRef {
            declaring_type: "System.IDisposable".to_string(),
            name: "Dispose".to_string(),
            parameter_types: Vec::new(),
            return_type: system_void(),
            generic_arity: 0,
            generic_args: Vec::new(),
        }
    }

    #[test]
    fn dispose_pattern_detects_null_guarded_window() {
        let mut body = MethodBody::new(vec![
            Instruction::simple(OpCode::Nop),
            Instruction::new(OpCode::Leave, Operand::Target(0)),
            Instruction::simple(OpCode::Ldloc0),
            Instruction::new(OpCode::Brfalse, Operand::Target(0)),
            Instruction::simple(OpCode::Ldloc0),
            Instruction::new(OpCode::Callvirt, Operand::Method(dispose_ref())),
            Instruction::simple(OpCode::Endfinally),
            Instruction::simple(OpCode::Ret),
        ]);
        let ret = body.instructions[7].offset;
        body.instructions[1].operand = Operand::Target(ret);
        body.instructions[3].operand = Operand::Target(body.instructions[6].offset);

        let marked = dispose_pattern_indices(&body);
        assert_eq!(
            marked,
            HashSet::from([1usize, 2, 3, 4, 5, 6]),
            "guard window plus the leave must be marked"
        );
    }

    #[test]
    fn dispose_pattern_ignores_plain_finally() {
        let body = MethodBody::new(vec![
            Instruction::simple(OpCode::Ldloc0),
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::Endfinally),
        ]);
        assert!(dispose_pattern_indices(&body).is_empty());
    }
}
