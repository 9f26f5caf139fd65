use crate::error::BasaltError;
use crate::vdbe::insn::{Insn, OpFlags, Opcode, P4};
use crate::vdbe::Program;
use crate::Result;

/// A forward reference to a program address. Labels are encoded as negative
/// operand values until [`ProgramBuilder::build`] patches them, so a label
/// can be referenced any number of times before the target is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    /// The operand encoding of this label, stored in place of the real
    /// address until fixup.
    pub fn operand(self) -> i32 {
        -(self.0 as i32) - 1
    }
}

/// Assembles instructions, registers, cursors and labels into a [`Program`].
pub struct ProgramBuilder {
    insns: Vec<Insn>,
    /// Register 0 is never handed out, so a zero operand always means
    /// "unused".
    next_free_register: usize,
    next_free_cursor: usize,
    /// index = label number, value = resolved offset.
    labels: Vec<Option<u32>>,
    comments: Vec<(u32, &'static str)>,
    parameter_count: usize,
    schema_generation: Option<u32>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            insns: Vec::new(),
            next_free_register: 1,
            next_free_cursor: 0,
            labels: Vec::new(),
            comments: Vec::new(),
            parameter_count: 0,
            schema_generation: None,
        }
    }

    pub fn alloc_register(&mut self) -> usize {
        let reg = self.next_free_register;
        self.next_free_register += 1;
        reg
    }

    pub fn alloc_registers(&mut self, amount: usize) -> usize {
        let start = self.next_free_register;
        self.next_free_register += amount;
        start
    }

    pub fn alloc_cursor(&mut self) -> usize {
        let cursor = self.next_free_cursor;
        self.next_free_cursor += 1;
        cursor
    }

    pub fn allocate_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Pin a label to the address of the next instruction to be emitted.
    pub fn resolve_label(&mut self, label: Label) {
        let offset = self.offset();
        debug_assert!(self.labels[label.0 as usize].is_none());
        self.labels[label.0 as usize] = Some(offset);
    }

    /// Address of the next instruction to be emitted.
    pub fn offset(&self) -> u32 {
        self.insns.len() as u32
    }

    pub fn emit(&mut self, insn: Insn) -> u32 {
        let offset = self.offset();
        if insn.opcode == Opcode::Variable && insn.p1 > 0 {
            self.parameter_count = self.parameter_count.max(insn.p1 as usize);
        }
        self.insns.push(insn);
        offset
    }

    pub fn add_comment(&mut self, offset: u32, comment: &'static str) {
        self.comments.push((offset, comment));
    }

    /// Schema generation baked into `Transaction` instructions emitted after
    /// this call. Programs built without one skip the staleness check.
    pub fn set_schema_generation(&mut self, generation: u32) {
        self.schema_generation = Some(generation);
    }

    /// Emit the mandatory leading `Init` and return the label it jumps to,
    /// which the caller resolves at the start of the prologue.
    pub fn emit_init(&mut self) -> Label {
        let target = self.allocate_label();
        self.emit(Insn::new(Opcode::Init, 0, target.operand(), 0));
        target
    }

    pub fn emit_goto(&mut self, target: Label) {
        self.emit(Insn::new(Opcode::Goto, 0, target.operand(), 0));
    }

    /// Load an integer constant, choosing `Integer` or `Int64` by size.
    pub fn emit_int(&mut self, value: i64, dest: usize) {
        match i32::try_from(value) {
            Ok(small) => {
                self.emit(Insn::new(Opcode::Integer, small, dest as i32, 0));
            }
            Err(_) => {
                self.emit(
                    Insn::new(Opcode::Int64, 0, dest as i32, 0).with_p4(P4::Int64(value)),
                );
            }
        }
    }

    pub fn emit_null(&mut self, dest: usize) {
        self.emit(Insn::new(Opcode::Null, 0, dest as i32, 0));
    }

    pub fn emit_string(&mut self, value: &str, dest: usize) {
        self.emit(
            Insn::new(Opcode::String8, 0, dest as i32, 0).with_p4(P4::Text(value.to_owned())),
        );
    }

    pub fn emit_transaction(&mut self, write: bool) {
        let generation = self.schema_generation.map_or(0, |g| g as i32);
        self.emit(Insn::new(
            Opcode::Transaction,
            0,
            write as i32,
            generation,
        ));
    }

    pub fn emit_result_row(&mut self, start: usize, count: usize) {
        self.emit(Insn::new(Opcode::ResultRow, start as i32, count as i32, 0));
    }

    pub fn emit_halt(&mut self) {
        self.emit(Insn::new(Opcode::Halt, 0, 0, 0));
    }

    /// Patch labels and validate operands, consuming the builder.
    pub fn build(mut self) -> Result<Program> {
        let insn_count = self.insns.len();
        for addr in 0..insn_count {
            let insn = &mut self.insns[addr];
            let flags = insn.opcode.flags();
            if flags.contains(OpFlags::JUMP) {
                patch_target(&self.labels, &mut insn.p2)?;
                check_target(insn.p2, insn_count)?;
            }
            if insn.opcode == Opcode::Jump {
                patch_target(&self.labels, &mut insn.p1)?;
                patch_target(&self.labels, &mut insn.p3)?;
                check_target(insn.p1, insn_count)?;
                check_target(insn.p3, insn_count)?;
            }
            check_register(flags.contains(OpFlags::IN1), insn.p1, self.next_free_register)?;
            check_register(
                flags.intersects(OpFlags::IN2.union(OpFlags::OUT2)),
                insn.p2,
                self.next_free_register,
            )?;
            check_register(
                flags.intersects(OpFlags::IN3.union(OpFlags::OUT3)),
                insn.p3,
                self.next_free_register,
            )?;
        }
        Ok(Program {
            insns: self.insns,
            comments: self.comments,
            max_registers: self.next_free_register,
            max_cursors: self.next_free_cursor,
            parameter_count: self.parameter_count,
        })
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn patch_target(labels: &[Option<u32>], operand: &mut i32) -> Result<()> {
    if *operand >= 0 {
        return Ok(());
    }
    let idx = (-*operand - 1) as usize;
    match labels.get(idx).copied().flatten() {
        Some(offset) => {
            *operand = offset as i32;
            Ok(())
        }
        None => Err(BasaltError::Misuse(format!("unresolved label L{idx}"))),
    }
}

fn check_target(target: i32, insn_count: usize) -> Result<()> {
    if target < 0 || target as usize >= insn_count {
        return Err(BasaltError::Misuse(format!(
            "jump target {target} outside program of {insn_count} instructions"
        )));
    }
    Ok(())
}

/// Register operands are loosely checked: zero means the slot is unused, and
/// ranged operations only declare their starting register.
fn check_register(applies: bool, operand: i32, max_registers: usize) -> Result<()> {
    if !applies || operand == 0 {
        return Ok(());
    }
    if operand < 0 || operand as usize >= max_registers {
        return Err(BasaltError::Misuse(format!(
            "register {operand} was never allocated"
        )));
    }
    Ok(())
}
