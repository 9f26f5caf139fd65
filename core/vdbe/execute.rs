use std::cmp::Ordering;
use std::num::NonZero;
use std::rc::Rc;
use std::sync::Arc;

use rand::thread_rng;

use crate::codec::{decode_record_column, encode_key, encode_record, NullOrder};
use crate::collate::CollationDef;
use crate::error::BasaltError;
use crate::function::{AggState, FuncKind};
use crate::numeric::Num;
use crate::storage::{NamespaceId, SeekOp, SeekResult};
use crate::types::{Affinity, Value};
use crate::vdbe::insn::{CmpFlags, Insn, Opcode, P4};
use crate::vdbe::{Frame, Program, ProgramState, Register, VmCursor};
use crate::{Result, Session};

pub type InsnFunction =
    fn(&Program, &mut ProgramState, &Insn, &Session) -> Result<InsnStepResult>;

/// What one instruction did with control flow.
pub enum InsnStepResult {
    /// Keep executing.
    Step,
    /// The program halted successfully.
    Done,
    /// A result row is ready.
    Row,
}

impl Opcode {
    pub(crate) fn handler(self) -> InsnFunction {
        match self {
            Opcode::Init => op_init,
            Opcode::Goto => op_goto,
            Opcode::Gosub => op_gosub,
            Opcode::Return => op_return,
            Opcode::Jump => op_jump,
            Opcode::Once => op_once,
            Opcode::If => op_if,
            Opcode::IfNot => op_if_not,
            Opcode::IsNull => op_is_null,
            Opcode::NotNull => op_not_null,
            Opcode::IfPos => op_if_pos,
            Opcode::DecrJumpZero => op_decr_jump_zero,
            Opcode::MustBeInt => op_must_be_int,
            Opcode::Halt => op_halt,
            Opcode::HaltIfNull => op_halt_if_null,
            Opcode::Noop => op_noop,
            Opcode::Program => op_program,
            Opcode::Integer => op_integer,
            Opcode::Int64 => op_int64,
            Opcode::Num => op_num,
            Opcode::String8 => op_string8,
            Opcode::Blob => op_blob,
            Opcode::Null => op_null,
            Opcode::Variable => op_variable,
            Opcode::Move => op_move,
            Opcode::Copy => op_copy,
            Opcode::SCopy => op_scopy,
            Opcode::Add => op_add,
            Opcode::Subtract => op_subtract,
            Opcode::Multiply => op_multiply,
            Opcode::Divide => op_divide,
            Opcode::Remainder => op_remainder,
            Opcode::Concat => op_concat,
            Opcode::AddImm => op_add_imm,
            Opcode::BitAnd => op_bit_and,
            Opcode::BitOr => op_bit_or,
            Opcode::ShiftLeft => op_shift_left,
            Opcode::ShiftRight => op_shift_right,
            Opcode::BitNot => op_bit_not,
            Opcode::Not => op_not,
            Opcode::And => op_and,
            Opcode::Or => op_or,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                op_comparison
            }
            Opcode::Compare => op_compare,
            Opcode::Permutation => op_permutation,
            Opcode::Affinity => op_affinity,
            Opcode::Cast => op_cast,
            Opcode::OpenRead | Opcode::OpenWrite => op_open_cursor,
            Opcode::OpenEphemeral => op_open_ephemeral,
            Opcode::Close => op_close,
            Opcode::SeekGE | Opcode::SeekGT | Opcode::SeekLE | Opcode::SeekLT => op_seek,
            Opcode::Found | Opcode::NotFound => op_found,
            Opcode::Rewind => op_rewind,
            Opcode::Last => op_last,
            Opcode::Next => op_next,
            Opcode::Prev => op_prev,
            Opcode::Column => op_column,
            Opcode::RowKey => op_row_key,
            Opcode::RowData => op_row_data,
            Opcode::Rowid => op_rowid,
            Opcode::NewRowid => op_new_rowid,
            Opcode::Insert => op_insert,
            Opcode::Delete => op_delete,
            Opcode::Count => op_count,
            Opcode::MakeKey => op_make_key,
            Opcode::MakeRecord => op_make_record,
            Opcode::IdxGE | Opcode::IdxGT | Opcode::IdxLE | Opcode::IdxLT => op_idx_compare,
            Opcode::NullRow => op_null_row,
            Opcode::Transaction => op_transaction,
            Opcode::Savepoint => op_savepoint,
            Opcode::AutoCommit => op_auto_commit,
            Opcode::Function => op_function,
            Opcode::AggStep => op_agg_step,
            Opcode::AggFinal => op_agg_final,
            Opcode::ResultRow => op_result_row,
        }
    }
}

pub fn op_init(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    state.pc = insn.p2 as u32;
    Ok(InsnStepResult::Step)
}

pub fn op_goto(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    state.pc = insn.p2 as u32;
    Ok(InsnStepResult::Step)
}

pub fn op_gosub(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    state.set_value(insn.p1, Value::Integer(state.pc as i64 + 1))?;
    state.pc = insn.p2 as u32;
    Ok(InsnStepResult::Step)
}

pub fn op_return(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    match state.value(insn.p1)? {
        Value::Integer(addr) if *addr >= 0 => {
            state.pc = *addr as u32;
            Ok(InsnStepResult::Step)
        }
        _ => Err(BasaltError::InternalError(
            "Return register does not hold a return address".to_string(),
        )),
    }
}

pub fn op_jump(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let Some(ord) = state.last_compare.take() else {
        return Err(BasaltError::InternalError(
            "Jump without a preceding Compare".to_string(),
        ));
    };
    state.pc = match ord {
        Ordering::Less => insn.p1 as u32,
        Ordering::Equal => insn.p2 as u32,
        Ordering::Greater => insn.p3 as u32,
    };
    Ok(InsnStepResult::Step)
}

pub fn op_once(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    if state.once.contains(&state.pc) {
        state.pc = insn.p2 as u32;
    } else {
        state.once.push(state.pc);
        state.pc += 1;
    }
    Ok(InsnStepResult::Step)
}

pub fn op_if(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let taken = match state.value(insn.p1)?.to_bool() {
        Some(b) => b,
        None => insn.p3 != 0,
    };
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_if_not(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let taken = match state.value(insn.p1)?.to_bool() {
        Some(b) => !b,
        None => insn.p3 != 0,
    };
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_is_null(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let taken = matches!(state.value(insn.p1)?, Value::Null);
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_not_null(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let taken = !matches!(state.value(insn.p1)?, Value::Null);
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_if_pos(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let Value::Integer(i) = *state.value(insn.p1)? else {
        return Err(BasaltError::Misuse(
            "IfPos requires an integer register".to_string(),
        ));
    };
    if i > 0 {
        state.set_value(insn.p1, Value::Integer(i - insn.p3 as i64))?;
        state.pc = insn.p2 as u32;
    } else {
        state.pc += 1;
    }
    Ok(InsnStepResult::Step)
}

pub fn op_decr_jump_zero(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let Value::Integer(i) = *state.value(insn.p1)? else {
        return Err(BasaltError::Misuse(
            "DecrJumpZero requires an integer register".to_string(),
        ));
    };
    let i = i.wrapping_sub(1);
    state.set_value(insn.p1, Value::Integer(i))?;
    state.pc = if i == 0 { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_must_be_int(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let converted = match state.value(insn.p1)? {
        Value::Integer(i) => Some(*i),
        Value::Num(n) if !n.is_nan() && !n.is_inf() => {
            let (i, lossy) = n.to_i64();
            (!lossy).then_some(i)
        }
        Value::Text(t) => {
            let (n, _) = Num::from_text(t.as_str());
            if n.is_nan() || n.is_inf() {
                None
            } else {
                let (i, lossy) = n.to_i64();
                (!lossy).then_some(i)
            }
        }
        _ => None,
    };
    match converted {
        Some(i) => {
            state.set_value(insn.p1, Value::Integer(i))?;
            state.pc += 1;
            Ok(InsnStepResult::Step)
        }
        None if insn.p2 != 0 => {
            state.pc = insn.p2 as u32;
            Ok(InsnStepResult::Step)
        }
        None => Err(BasaltError::InvalidArgument("datatype mismatch".to_string())),
    }
}

fn halt(state: &mut ProgramState, insn: &Insn) -> Result<InsnStepResult> {
    if insn.p1 == 0 {
        if let Some(frame) = state.frames.pop() {
            state.once = frame.saved_once;
            state.pc = frame.return_pc;
            return Ok(InsnStepResult::Step);
        }
        return Ok(InsnStepResult::Done);
    }
    state.frames.clear();
    let message = match &insn.p4 {
        P4::Text(msg) => msg.clone(),
        _ => "halted by program".to_string(),
    };
    if insn.p2 != 0 {
        Err(BasaltError::TxError(message))
    } else {
        Err(BasaltError::Constraint(message))
    }
}

pub fn op_halt(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    halt(state, insn)
}

pub fn op_halt_if_null(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    if matches!(state.value(insn.p3)?, Value::Null) {
        return halt(state, insn);
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_noop(
    _program: &Program,
    state: &mut ProgramState,
    _insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_program(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    let P4::SubProgram(sub) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Program requires a sub-program operand".to_string(),
        ));
    };
    let limit = session.max_frame_depth();
    if state.frames.len() >= limit {
        return Err(BasaltError::OutOfRange(format!(
            "sub-program nesting deeper than {limit}"
        )));
    }
    state.frames.push(Frame {
        program: Rc::clone(sub),
        return_pc: state.pc + 1,
        saved_once: std::mem::take(&mut state.once),
    });
    state.pc = 0;
    Ok(InsnStepResult::Step)
}

pub fn op_integer(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    state.set_value(insn.p2, Value::Integer(insn.p1 as i64))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_int64(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Int64(v) = insn.p4 else {
        return Err(BasaltError::InternalError(
            "Int64 requires an integer operand".to_string(),
        ));
    };
    state.set_value(insn.p2, Value::Integer(v))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_num(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Num(n) = insn.p4 else {
        return Err(BasaltError::InternalError(
            "Num requires a numeric operand".to_string(),
        ));
    };
    state.set_value(insn.p2, Value::Num(n))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_string8(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Text(s) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "String8 requires a text operand".to_string(),
        ));
    };
    state.set_value(insn.p2, Value::build_text(s))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_blob(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Blob(b) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Blob requires a blob operand".to_string(),
        ));
    };
    state.set_value(insn.p2, Value::from_blob(b.clone()))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_null(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let end = insn.p3.max(insn.p2);
    for reg in insn.p2..=end {
        state.set_value(reg, Value::Null)?;
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_variable(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let Some(index) = usize::try_from(insn.p1).ok().and_then(NonZero::new) else {
        return Err(BasaltError::Misuse(format!(
            "parameter index {} out of range",
            insn.p1
        )));
    };
    let value = state.get_parameter(index);
    state.set_value(insn.p2, value)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_move(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let count = insn.p3.max(0);
    for i in 0..count {
        let src = state.slot_index(insn.p1 + i)?;
        let dst = state.slot_index(insn.p2 + i)?;
        let taken = std::mem::replace(&mut state.registers[src], Register::Value(Value::Null));
        state.registers[dst] = taken;
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_copy(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    for i in 0..=insn.p3.max(0) {
        let value = state.value(insn.p1 + i)?.deep_clone();
        state.set_value(insn.p2 + i, value)?;
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_scopy(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let src = state.slot_index(insn.p1)?;
    let shallow = match &mut state.registers[src] {
        Register::Value(v) => v.shallow_clone(),
        Register::Aggregate(_) => {
            return Err(BasaltError::Misuse(
                "cannot copy an unfinalized aggregate".to_string(),
            ))
        }
    };
    state.set_value(insn.p2, shallow)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_add(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_add(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_subtract(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_subtract(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_multiply(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_multiply(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_divide(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_divide(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_remainder(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_remainder(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_concat(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_concat(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_add_imm(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let i = state.value(insn.p1)?.coerce_i64();
    state.set_value(insn.p1, Value::Integer(i.wrapping_add(insn.p2 as i64)))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_bit_and(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_bit_and(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_bit_or(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_bit_or(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_shift_left(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_shift_left(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_shift_right(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_shift_right(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_bit_not(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_bit_not();
    state.set_value(insn.p2, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_not(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_boolean_not();
    state.set_value(insn.p2, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_and(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_and(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_or(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let result = state.value(insn.p1)?.exec_or(state.value(insn.p2)?);
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

/// Shared body of the six relational opcodes.
pub fn op_comparison(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let flags = CmpFlags::from_bits(insn.p5);
    let affinity = flags.affinity();
    if !matches!(affinity, Affinity::Blob) {
        state.value_mut(insn.p1)?.apply_affinity(affinity);
        state.value_mut(insn.p3)?.apply_affinity(affinity);
    }
    let collation = match &insn.p4 {
        P4::Collation(c) => Arc::clone(c),
        _ => CollationDef::binary(),
    };
    let lhs = state.value(insn.p1)?;
    let rhs = state.value(insn.p3)?;
    let lhs_null = matches!(lhs, Value::Null);
    let rhs_null = matches!(rhs, Value::Null);
    let taken = if lhs_null || rhs_null {
        if flags.has_null_eq() {
            let both_null = lhs_null && rhs_null;
            match insn.opcode {
                Opcode::Eq => both_null,
                Opcode::Ne => !both_null,
                _ => flags.has_jump_if_null(),
            }
        } else {
            flags.has_jump_if_null()
        }
    } else {
        match lhs.partial_cmp_with(rhs, &collation) {
            // NaN comparisons stay unknown, like null
            None => flags.has_jump_if_null(),
            Some(ord) => match insn.opcode {
                Opcode::Eq => ord.is_eq(),
                Opcode::Ne => ord.is_ne(),
                Opcode::Lt => ord.is_lt(),
                Opcode::Le => ord.is_le(),
                Opcode::Gt => ord.is_gt(),
                Opcode::Ge => ord.is_ge(),
                _ => {
                    return Err(BasaltError::InternalError(format!(
                        "{} is not a comparison opcode",
                        insn.opcode
                    )))
                }
            },
        }
    };
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_compare(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::KeyInfo(key_info) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Compare requires a key description".to_string(),
        ));
    };
    let count = insn.p3.max(0) as usize;
    let permutation = state.permutation.take();
    if let Some(p) = &permutation {
        if p.len() < count {
            return Err(BasaltError::Misuse(
                "permutation shorter than the compared vector".to_string(),
            ));
        }
    }
    let mut result = Ordering::Equal;
    for i in 0..count {
        let offset = permutation.as_ref().map_or(i, |p| p[i]) as i32;
        let lhs = state.value(insn.p1 + offset)?;
        let rhs = state.value(insn.p2 + offset)?;
        let part = key_info.parts.get(i);
        let collation = part.map_or_else(CollationDef::binary, |p| Arc::clone(&p.collation));
        let null_order = part.map_or(NullOrder::First, |p| p.null_order);
        let desc = part.is_some_and(|p| p.desc);
        let ord = compare_for_sort(lhs, rhs, &collation, null_order, desc);
        if ord != Ordering::Equal {
            result = ord;
            break;
        }
    }
    state.last_compare = Some(result);
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_permutation(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::IntArray(order) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Permutation requires an integer array".to_string(),
        ));
    };
    state.permutation = Some(order.clone());
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_affinity(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Text(letters) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Affinity requires an affinity string".to_string(),
        ));
    };
    let count = insn.p2.max(0) as usize;
    if letters.len() != count {
        return Err(BasaltError::Misuse(format!(
            "affinity string of length {} does not cover {count} registers",
            letters.len()
        )));
    }
    for (i, letter) in letters.chars().enumerate() {
        let Some(affinity) = Affinity::from_char(letter) else {
            return Err(BasaltError::Misuse(format!(
                "invalid affinity letter {letter:?}"
            )));
        };
        state.value_mut(insn.p1 + i as i32)?.apply_affinity(affinity);
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_cast(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let affinity = u32::try_from(insn.p2)
        .ok()
        .and_then(char::from_u32)
        .and_then(Affinity::from_char);
    let Some(affinity) = affinity else {
        return Err(BasaltError::Misuse(format!(
            "invalid cast affinity code {}",
            insn.p2
        )));
    };
    let value = state.value(insn.p1)?.exec_cast(affinity);
    state.set_value(insn.p1, value)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_open_cursor(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    if insn.p2 < 0 {
        return Err(BasaltError::Misuse(format!(
            "invalid namespace id {}",
            insn.p2
        )));
    }
    let idx = state.cursor_index(insn.p1)?;
    let writable = insn.opcode == Opcode::OpenWrite;
    let cursor = VmCursor::open(
        session.backend(),
        NamespaceId(insn.p2 as u32),
        writable,
        false,
    )?;
    state.cursors[idx] = Some(cursor);
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_open_ephemeral(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    let idx = state.cursor_index(insn.p1)?;
    let ns = session.backend().create_namespace()?;
    let cursor = VmCursor::open(session.backend(), ns, true, true)?;
    state.cursors[idx] = Some(cursor);
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_close(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let idx = state.cursor_index(insn.p1)?;
    state.cursors[idx] = None;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

/// Shared body of the four range seeks.
pub fn op_seek(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::KeyInfo(key_info) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "seek requires a key description".to_string(),
        ));
    };
    let op = match insn.opcode {
        Opcode::SeekGE => SeekOp::GE,
        Opcode::SeekGT => SeekOp::GT,
        Opcode::SeekLE => SeekOp::LE,
        Opcode::SeekLT => SeekOp::LT,
        other => {
            return Err(BasaltError::InternalError(format!(
                "{other} is not a seek opcode"
            )))
        }
    };
    let values = state.values_range(insn.p3, key_info.parts.len())?;
    let probe = encode_key(&values, key_info)?;
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    let found = !matches!(cursor.kv.seek(&probe, op)?, SeekResult::NotFound);
    state.pc = if found { state.pc + 1 } else { insn.p2 as u32 };
    Ok(InsnStepResult::Step)
}

/// `Found` and `NotFound`: an exact-match probe that jumps on one outcome.
pub fn op_found(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::KeyInfo(key_info) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "probe requires a key description".to_string(),
        ));
    };
    let values = state.values_range(insn.p3, key_info.parts.len())?;
    let probe = encode_key(&values, key_info)?;
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    let exact = matches!(cursor.kv.seek(&probe, SeekOp::EQ)?, SeekResult::Exact);
    let taken = if insn.opcode == Opcode::Found {
        exact
    } else {
        !exact
    };
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_rewind(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    let has_row = cursor.kv.first()?;
    state.pc = if has_row { state.pc + 1 } else { insn.p2 as u32 };
    Ok(InsnStepResult::Step)
}

pub fn op_last(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    let has_row = cursor.kv.last()?;
    state.pc = if has_row { state.pc + 1 } else { insn.p2 as u32 };
    Ok(InsnStepResult::Step)
}

pub fn op_next(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    let has_row = cursor.kv.next()?;
    state.pc = if has_row { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_prev(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    let has_row = cursor.kv.prev()?;
    state.pc = if has_row { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_column(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let value = {
        let cursor = state.cursor(insn.p1)?;
        if cursor.has_row() {
            decode_record_column(cursor.kv.value()?, insn.p2.max(0) as usize)?
        } else {
            Value::Null
        }
    };
    state.set_value(insn.p3, value)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_row_key(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let value = {
        let cursor = state.cursor(insn.p1)?;
        if cursor.has_row() {
            Value::from_blob(cursor.kv.key()?.to_vec())
        } else {
            Value::Null
        }
    };
    state.set_value(insn.p2, value)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_row_data(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let value = {
        let cursor = state.cursor(insn.p1)?;
        if cursor.has_row() {
            Value::from_blob(cursor.kv.value()?.to_vec())
        } else {
            Value::Null
        }
    };
    state.set_value(insn.p2, value)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_rowid(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let value = {
        let cursor = state.cursor(insn.p1)?;
        if cursor.has_row() {
            Value::Integer(super::decode_rowid(cursor.kv.key()?)?)
        } else {
            Value::Null
        }
    };
    state.set_value(insn.p2, value)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_new_rowid(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let rowid = {
        let cursor = state.cursor_mut(insn.p1)?;
        cursor.require_writable()?;
        cursor.null_row = false;
        super::get_new_rowid(cursor, thread_rng())?
    };
    state.set_value(insn.p2, Value::Integer(rowid))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_insert(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    state.cursor(insn.p1)?.require_writable()?;
    ensure_statement_scope(state, session)?;
    let key = match state.value(insn.p2)? {
        Value::Blob(b) => b.to_vec(),
        _ => {
            return Err(BasaltError::Misuse(
                "Insert key register must hold an encoded key".to_string(),
            ))
        }
    };
    let record = match state.value(insn.p3)? {
        Value::Blob(b) => b.to_vec(),
        _ => {
            return Err(BasaltError::Misuse(
                "Insert record register must hold an encoded record".to_string(),
            ))
        }
    };
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    cursor.kv.insert(&key, &record)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_delete(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    state.cursor(insn.p1)?.require_writable()?;
    ensure_statement_scope(state, session)?;
    let cursor = state.cursor_mut(insn.p1)?;
    cursor.null_row = false;
    cursor.kv.delete()?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_count(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let count = {
        let cursor = state.cursor(insn.p1)?;
        cursor.store.namespace_len(cursor.ns)?
    };
    let count = i64::try_from(count).unwrap_or(i64::MAX);
    state.set_value(insn.p2, Value::Integer(count))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_make_key(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::KeyInfo(key_info) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "MakeKey requires a key description".to_string(),
        ));
    };
    let values = state.values_range(insn.p1, insn.p2.max(0) as usize)?;
    let key = encode_key(&values, key_info)?;
    state.set_value(insn.p3, Value::from_blob(key))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_make_record(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let values = state.values_range(insn.p1, insn.p2.max(0) as usize)?;
    let record = encode_record(&values)?;
    state.set_value(insn.p3, Value::from_blob(record))?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

/// Shared body of the four index termination tests. The probe and the
/// stored key are compared bytewise, which agrees with value order by
/// construction of the key codec.
pub fn op_idx_compare(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::KeyInfo(key_info) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "index compare requires a key description".to_string(),
        ));
    };
    let values = state.values_range(insn.p3, key_info.parts.len())?;
    let probe = encode_key(&values, key_info)?;
    let cursor = state.cursor(insn.p1)?;
    let taken = if !cursor.has_row() {
        true
    } else {
        let ord = cursor.kv.key()?.cmp(probe.as_slice());
        match insn.opcode {
            Opcode::IdxGE => ord.is_ge(),
            Opcode::IdxGT => ord.is_gt(),
            Opcode::IdxLE => ord.is_le(),
            Opcode::IdxLT => ord.is_lt(),
            other => {
                return Err(BasaltError::InternalError(format!(
                    "{other} is not an index compare opcode"
                )))
            }
        }
    };
    state.pc = if taken { insn.p2 as u32 } else { state.pc + 1 };
    Ok(InsnStepResult::Step)
}

pub fn op_null_row(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    state.cursor_mut(insn.p1)?.null_row = true;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_transaction(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    if insn.p3 != 0 && session.schema_generation() != insn.p3 as u32 {
        return Err(BasaltError::SchemaChanged);
    }
    if insn.p2 != 0 {
        session.ensure_write_txn()?;
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_savepoint(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    let P4::Text(name) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Savepoint requires a name".to_string(),
        ));
    };
    match insn.p1 {
        0 => session.savepoint(name)?,
        1 => session.release(name)?,
        2 => session.rollback_to(name)?,
        other => {
            return Err(BasaltError::Misuse(format!(
                "invalid savepoint operation {other}"
            )))
        }
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_auto_commit(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    session: &Session,
) -> Result<InsnStepResult> {
    if insn.p1 == 0 {
        session.begin()?;
    } else if insn.p2 != 0 {
        session.rollback()?;
    } else {
        session.commit()?;
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_function(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Func(def) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "Function requires a function operand".to_string(),
        ));
    };
    let args = state.values_range(insn.p2, insn.p5 as usize)?;
    let result = match &def.kind {
        FuncKind::Scalar(f) => (**f)(&args)?,
        FuncKind::Aggregate(_) => {
            return Err(BasaltError::Misuse(format!(
                "aggregate function {} invoked as a scalar",
                def.name
            )))
        }
    };
    state.set_value(insn.p3, result)?;
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_agg_step(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let P4::Func(def) = &insn.p4 else {
        return Err(BasaltError::InternalError(
            "AggStep requires a function operand".to_string(),
        ));
    };
    let args = state.values_range(insn.p2, insn.p5 as usize)?;
    let acc = state.slot_index(insn.p3)?;
    if matches!(state.registers[acc], Register::Value(Value::Null)) {
        state.registers[acc] = Register::Aggregate(Box::new(AggState::new(Arc::clone(def))?));
    }
    match &mut state.registers[acc] {
        Register::Aggregate(agg) => agg.step(&args)?,
        Register::Value(_) => {
            return Err(BasaltError::Misuse(
                "AggStep target register holds a plain value".to_string(),
            ))
        }
    }
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_agg_final(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let idx = state.slot_index(insn.p1)?;
    let reg = std::mem::replace(&mut state.registers[idx], Register::Value(Value::Null));
    let value = match reg {
        Register::Aggregate(agg) => agg.finalize()?,
        Register::Value(Value::Null) => {
            // Never stepped: produce the aggregate's empty-input result.
            let P4::Func(def) = &insn.p4 else {
                return Err(BasaltError::InternalError(
                    "AggFinal on an empty accumulator requires a function operand".to_string(),
                ));
            };
            AggState::new(Arc::clone(def))?.finalize()?
        }
        Register::Value(v) => {
            state.registers[idx] = Register::Value(v);
            return Err(BasaltError::Misuse(
                "AggFinal on a register that holds a plain value".to_string(),
            ));
        }
    };
    state.registers[idx] = Register::Value(value);
    state.pc += 1;
    Ok(InsnStepResult::Step)
}

pub fn op_result_row(
    _program: &Program,
    state: &mut ProgramState,
    insn: &Insn,
    _session: &Session,
) -> Result<InsnStepResult> {
    let count = insn.p2.max(0);
    state.slot_index(insn.p1)?;
    if count > 0 {
        state.slot_index(insn.p1 + count - 1)?;
    }
    state.result_row = Some((insn.p1 as usize, count as usize));
    state.pc += 1;
    Ok(InsnStepResult::Row)
}

/// Open the statement's anonymous savepoint before its first write.
fn ensure_statement_scope(state: &mut ProgramState, session: &Session) -> Result<()> {
    if state.stmt_boundary.is_none() {
        state.stmt_boundary = Some(session.open_statement_scope()?);
    }
    Ok(())
}

/// Total order used by `Compare`: nulls placed by the key part's null
/// order, NaN below every other number, otherwise value order. Descending
/// parts flip value comparisons but never null placement, matching the
/// key codec.
fn compare_for_sort(
    lhs: &Value,
    rhs: &Value,
    collation: &CollationDef,
    null_order: NullOrder,
    desc: bool,
) -> Ordering {
    let nulls_first = matches!(null_order, NullOrder::First);
    match (matches!(lhs, Value::Null), matches!(rhs, Value::Null)) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ord = match (is_nan(lhs), is_nan(rhs)) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => lhs
                    .partial_cmp_with(rhs, collation)
                    // NaN pairs are handled above
                    .unwrap_or(Ordering::Equal),
            };
            if desc {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

fn is_nan(value: &Value) -> bool {
    matches!(value, Value::Num(n) if n.is_nan())
}

/// Shift with the historic integer semantics: negative counts shift the
/// other way, counts past 63 saturate to zero (or to the sign fill for a
/// right shift).
fn shift(value: i64, amount: i64, left: bool) -> i64 {
    let (amount, left) = if amount < 0 {
        (amount.checked_neg().unwrap_or(i64::MAX), !left)
    } else {
        (amount, left)
    };
    if left {
        if amount >= 64 {
            0
        } else {
            ((value as u64) << amount) as i64
        }
    } else if amount >= 64 {
        if value < 0 {
            -1
        } else {
            0
        }
    } else {
        value >> amount
    }
}

impl Value {
    pub(crate) fn exec_add(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Integer(a), Value::Integer(b)) => match a.checked_add(*b) {
                Some(v) => Value::Integer(v),
                None => Value::Num(Num::from_i64(*a) + Num::from_i64(*b)),
            },
            (a, b) => Value::Num(a.coerce_num() + b.coerce_num()),
        }
    }

    pub(crate) fn exec_subtract(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Integer(a), Value::Integer(b)) => match a.checked_sub(*b) {
                Some(v) => Value::Integer(v),
                None => Value::Num(Num::from_i64(*a) - Num::from_i64(*b)),
            },
            (a, b) => Value::Num(a.coerce_num() - b.coerce_num()),
        }
    }

    pub(crate) fn exec_multiply(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Integer(a), Value::Integer(b)) => match a.checked_mul(*b) {
                Some(v) => Value::Integer(v),
                None => Value::Num(Num::from_i64(*a) * Num::from_i64(*b)),
            },
            (a, b) => Value::Num(a.coerce_num() * b.coerce_num()),
        }
    }

    /// Division happens in decimal; an integer result is only produced
    /// when both operands are integers and the division is exact.
    pub(crate) fn exec_divide(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Integer(a), Value::Integer(b)) => {
                if let (Some(q), Some(r)) = (a.checked_div(*b), a.checked_rem(*b)) {
                    if r == 0 {
                        return Value::Integer(q);
                    }
                }
                Value::Num(Num::from_i64(*a) / Num::from_i64(*b))
            }
            (a, b) => Value::Num(a.coerce_num() / b.coerce_num()),
        }
    }

    pub(crate) fn exec_remainder(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Integer(a), Value::Integer(b)) => {
                if *b == 0 {
                    Value::Num(Num::from_i64(*a) % Num::from_i64(*b))
                } else {
                    // i64::MIN % -1 is the only overflowing pair; its
                    // remainder is zero
                    Value::Integer(a.wrapping_rem(*b))
                }
            }
            (a, b) => Value::Num(a.coerce_num() % b.coerce_num()),
        }
    }

    pub(crate) fn exec_concat(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Blob(a), Value::Blob(b)) => {
                let mut out = a.to_vec();
                out.extend_from_slice(b.as_slice());
                Value::from_blob(out)
            }
            (Value::Blob(a), b) => {
                let mut out = a.to_vec();
                out.extend_from_slice(b.to_string().as_bytes());
                Value::from_blob(out)
            }
            (a, Value::Blob(b)) => {
                let mut out = a.to_string().into_bytes();
                out.extend_from_slice(b.as_slice());
                Value::from_blob(out)
            }
            (a, b) => Value::build_text(format!("{a}{b}")),
        }
    }

    pub(crate) fn exec_bit_and(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (a, b) => Value::Integer(a.coerce_i64() & b.coerce_i64()),
        }
    }

    pub(crate) fn exec_bit_or(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (a, b) => Value::Integer(a.coerce_i64() | b.coerce_i64()),
        }
    }

    pub(crate) fn exec_shift_left(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (a, b) => Value::Integer(shift(a.coerce_i64(), b.coerce_i64(), true)),
        }
    }

    pub(crate) fn exec_shift_right(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (a, b) => Value::Integer(shift(a.coerce_i64(), b.coerce_i64(), false)),
        }
    }

    pub(crate) fn exec_bit_not(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            v => Value::Integer(!v.coerce_i64()),
        }
    }

    pub(crate) fn exec_boolean_not(&self) -> Value {
        match self.to_bool() {
            Some(b) => Value::Integer(!b as i64),
            None => Value::Null,
        }
    }

    /// Three-valued AND: false dominates unknown.
    pub(crate) fn exec_and(&self, other: &Value) -> Value {
        match (self.to_bool(), other.to_bool()) {
            (Some(false), _) | (_, Some(false)) => Value::Integer(0),
            (Some(true), Some(true)) => Value::Integer(1),
            _ => Value::Null,
        }
    }

    /// Three-valued OR: true dominates unknown.
    pub(crate) fn exec_or(&self, other: &Value) -> Value {
        match (self.to_bool(), other.to_bool()) {
            (Some(true), _) | (_, Some(true)) => Value::Integer(1),
            (Some(false), Some(false)) => Value::Integer(0),
            _ => Value::Null,
        }
    }

    /// A forced conversion, lossier than affinity application: text that
    /// does not parse numerically becomes zero, and a NaN forced into a
    /// numeric type becomes null.
    pub(crate) fn exec_cast(&self, affinity: Affinity) -> Value {
        if matches!(self, Value::Null) {
            return Value::Null;
        }
        match affinity {
            Affinity::Blob => match self {
                Value::Blob(_) => self.deep_clone(),
                Value::Text(t) => Value::from_blob(t.as_str().as_bytes().to_vec()),
                other => Value::from_blob(other.to_string().into_bytes()),
            },
            Affinity::Text => match self {
                Value::Text(_) => self.deep_clone(),
                Value::Blob(b) => Value::build_text(String::from_utf8_lossy(b.as_slice())),
                other => Value::build_text(other.to_string()),
            },
            Affinity::Integer => {
                let n = self.coerce_num();
                if n.is_nan() {
                    return Value::Integer(0);
                }
                let (i, _) = n.to_i64();
                Value::Integer(i)
            }
            Affinity::Numeric => {
                let n = self.coerce_num();
                if n.is_nan() {
                    return match self {
                        Value::Num(_) => Value::Null,
                        _ => Value::Integer(0),
                    };
                }
                if n.is_integer() {
                    let (i, lossy) = n.to_i64();
                    if !lossy {
                        return Value::Integer(i);
                    }
                }
                Value::Num(n)
            }
            Affinity::Real => {
                let n = self.coerce_num();
                if n.is_nan() {
                    return match self {
                        Value::Num(_) => Value::Null,
                        _ => Value::Num(Num::zero()),
                    };
                }
                Value::Num(n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeyInfo, KeyPart};
    use crate::collate::Collation;
    use crate::function::FuncDef;
    use crate::storage::KvStore;
    use crate::vdbe::builder::ProgramBuilder;
    use crate::vdbe::{get_new_rowid, StepResult};
    use crate::{Store, StoreOptions};
    use quickcheck_macros::quickcheck;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rstest::rstest;

    fn int(v: i64) -> Value {
        Value::Integer(v)
    }

    fn num(text: &str) -> Value {
        Value::Num(Num::from_text(text).0)
    }

    fn text(s: &str) -> Value {
        Value::build_text(s)
    }

    /// Run a program against a fresh in-memory store, collecting every
    /// result row.
    fn run_program(program: &Program) -> Result<Vec<Vec<Value>>> {
        let store = Store::open_memory();
        run_in_store(&store, program)
    }

    fn run_in_store(store: &Arc<Store>, program: &Program) -> Result<Vec<Vec<Value>>> {
        let session = store.connect();
        let mut state = ProgramState::new(program.max_registers, program.max_cursors);
        let mut rows = Vec::new();
        loop {
            match program.step(&mut state, &session)? {
                StepResult::Row => {
                    let (start, count) = state.result_row.unwrap();
                    rows.push(
                        (start..start + count)
                            .map(|i| match &state.registers[i] {
                                Register::Value(v) => v.clone(),
                                Register::Aggregate(_) => panic!("aggregate in result row"),
                            })
                            .collect(),
                    );
                }
                StepResult::Done => return Ok(rows),
                other => panic!("unexpected step result {other:?}"),
            }
        }
    }

    /// A program that emits the marker value 1 when `make_branch`'s jump is
    /// taken and 0 when it falls through.
    fn branch_program(make_branch: impl FnOnce(&mut ProgramBuilder, crate::vdbe::builder::Label)) -> Program {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let taken = b.allocate_label();
        let out = b.alloc_register();
        make_branch(&mut b, taken);
        b.emit_int(0, out);
        b.emit_result_row(out, 1);
        b.emit_halt();
        b.resolve_label(taken);
        b.emit_int(1, out);
        b.emit_result_row(out, 1);
        b.emit_halt();
        b.build().unwrap()
    }

    fn branch_taken(program: &Program) -> bool {
        let rows = run_program(program).unwrap();
        assert_eq!(rows.len(), 1);
        rows[0][0] == Value::Integer(1)
    }

    #[test]
    fn test_add_program_yields_row() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let r1 = b.alloc_register();
        let r2 = b.alloc_register();
        let r3 = b.alloc_register();
        b.emit_int(5, r1);
        b.emit_int(3, r2);
        b.emit(Insn::new(Opcode::Add, r1 as i32, r2 as i32, r3 as i32));
        b.emit_result_row(r3, 1);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(8)]]);
    }

    #[test]
    fn test_add_overflow_promotes_to_num() {
        let result = int(i64::MAX).exec_add(&int(1));
        assert_eq!(result, num("9223372036854775808"));
    }

    #[test]
    fn test_subtract_overflow_promotes_to_num() {
        let result = int(i64::MIN).exec_subtract(&int(1));
        assert_eq!(result, num("-9223372036854775809"));
    }

    #[test]
    fn test_divide_is_decimal() {
        assert_eq!(int(7).exec_divide(&int(2)), num("3.5"));
        assert_eq!(int(6).exec_divide(&int(2)), int(3));
        assert_eq!(int(i64::MIN).exec_divide(&int(-1)), num("9223372036854775808"));
    }

    #[test]
    fn test_divide_by_zero_yields_infinity() {
        let Value::Num(n) = int(1).exec_divide(&int(0)) else {
            panic!("expected a numeric result");
        };
        assert!(n.is_inf());
        let Value::Num(n) = int(0).exec_divide(&int(0)) else {
            panic!("expected a numeric result");
        };
        assert!(n.is_nan());
    }

    #[test]
    fn test_remainder() {
        assert_eq!(int(7).exec_remainder(&int(3)), int(1));
        assert_eq!(int(i64::MIN).exec_remainder(&int(-1)), int(0));
        let Value::Num(n) = int(7).exec_remainder(&int(0)) else {
            panic!("expected a numeric result");
        };
        assert!(n.is_nan());
    }

    #[rstest]
    #[case(Value::Null, int(3))]
    #[case(int(3), Value::Null)]
    fn test_arithmetic_null_propagates(#[case] lhs: Value, #[case] rhs: Value) {
        assert_eq!(lhs.exec_add(&rhs), Value::Null);
        assert_eq!(lhs.exec_multiply(&rhs), Value::Null);
        assert_eq!(lhs.exec_divide(&rhs), Value::Null);
        assert_eq!(lhs.exec_concat(&rhs), Value::Null);
    }

    #[test]
    fn test_concat() {
        assert_eq!(text("ab").exec_concat(&text("cd")), text("abcd"));
        assert_eq!(text("n=").exec_concat(&int(4)), text("n=4"));
        assert_eq!(
            Value::from_blob(vec![1]).exec_concat(&Value::from_blob(vec![2])),
            Value::from_blob(vec![1, 2])
        );
    }

    #[rstest]
    #[case(int(1), int(1), int(1))]
    #[case(int(1), int(0), int(0))]
    #[case(int(0), Value::Null, int(0))]
    #[case(int(1), Value::Null, Value::Null)]
    #[case(Value::Null, Value::Null, Value::Null)]
    fn test_and_three_valued(#[case] lhs: Value, #[case] rhs: Value, #[case] expected: Value) {
        assert_eq!(lhs.exec_and(&rhs), expected);
    }

    #[rstest]
    #[case(int(0), int(0), int(0))]
    #[case(int(1), Value::Null, int(1))]
    #[case(int(0), Value::Null, Value::Null)]
    fn test_or_three_valued(#[case] lhs: Value, #[case] rhs: Value, #[case] expected: Value) {
        assert_eq!(lhs.exec_or(&rhs), expected);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(int(1).exec_shift_left(&int(3)), int(8));
        assert_eq!(int(1).exec_shift_left(&int(64)), int(0));
        assert_eq!(int(-8).exec_shift_right(&int(1)), int(-4));
        assert_eq!(int(-8).exec_shift_right(&int(100)), int(-1));
        assert_eq!(int(8).exec_shift_left(&int(-2)), int(2));
    }

    #[quickcheck]
    fn prop_negated_shift_flips_direction(value: i64, amount: i16) -> bool {
        let amount = amount as i64;
        int(value).exec_shift_left(&int(amount)) == int(value).exec_shift_right(&int(-amount))
    }

    #[test]
    fn test_cast_text_to_numeric() {
        assert_eq!(text("12abc").exec_cast(Affinity::Numeric), int(12));
        assert_eq!(text("junk").exec_cast(Affinity::Numeric), int(0));
        assert_eq!(text("3.5").exec_cast(Affinity::Numeric), num("3.5"));
        assert_eq!(text("junk").exec_cast(Affinity::Integer), int(0));
    }

    #[test]
    fn test_cast_nan_to_numeric_is_null() {
        assert_eq!(Value::Num(Num::nan()).exec_cast(Affinity::Numeric), Value::Null);
        assert_eq!(Value::Num(Num::nan()).exec_cast(Affinity::Integer), int(0));
    }

    #[test]
    fn test_cast_between_text_and_blob() {
        assert_eq!(
            text("hi").exec_cast(Affinity::Blob),
            Value::from_blob(b"hi".to_vec())
        );
        assert_eq!(
            Value::from_blob(b"hi".to_vec()).exec_cast(Affinity::Text),
            text("hi")
        );
        assert_eq!(int(7).exec_cast(Affinity::Text), text("7"));
    }

    #[test]
    fn test_eq_jump_taken_on_equal() {
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_int(4, r1);
            b.emit_int(4, r2);
            b.emit(Insn::new(Opcode::Eq, r1 as i32, taken.operand(), r2 as i32));
        });
        assert!(branch_taken(&program));
    }

    #[test]
    fn test_null_comparison_falls_through_by_default() {
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_null(r1);
            b.emit_int(4, r2);
            b.emit(Insn::new(Opcode::Lt, r1 as i32, taken.operand(), r2 as i32));
        });
        assert!(!branch_taken(&program));
    }

    #[test]
    fn test_jump_if_null_flag() {
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_null(r1);
            b.emit_int(4, r2);
            b.emit(
                Insn::new(Opcode::Lt, r1 as i32, taken.operand(), r2 as i32)
                    .with_p5(CmpFlags::new().jump_if_null().bits()),
            );
        });
        assert!(branch_taken(&program));
    }

    #[test]
    fn test_null_eq_flag() {
        let both_null = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_null(r1);
            b.emit_null(r2);
            b.emit(
                Insn::new(Opcode::Eq, r1 as i32, taken.operand(), r2 as i32)
                    .with_p5(CmpFlags::new().null_eq().bits()),
            );
        });
        assert!(branch_taken(&both_null));

        let one_null = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_null(r1);
            b.emit_int(1, r2);
            b.emit(
                Insn::new(Opcode::Ne, r1 as i32, taken.operand(), r2 as i32)
                    .with_p5(CmpFlags::new().null_eq().bits()),
            );
        });
        assert!(branch_taken(&one_null));
    }

    #[test]
    fn test_comparison_applies_affinity() {
        // '5' = 5 only holds once the text side is coerced
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_string("5", r1);
            b.emit_int(5, r2);
            b.emit(
                Insn::new(Opcode::Eq, r1 as i32, taken.operand(), r2 as i32)
                    .with_p5(CmpFlags::new().with_affinity(Affinity::Numeric).bits()),
            );
        });
        assert!(branch_taken(&program));
    }

    #[test]
    fn test_comparison_with_collation() {
        let nocase = Arc::new(CollationDef::builtin(Collation::new("NOCASE").unwrap()));
        let program = branch_program(move |b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit_string("Hello", r1);
            b.emit_string("hello", r2);
            b.emit(
                Insn::new(Opcode::Eq, r1 as i32, taken.operand(), r2 as i32)
                    .with_p4(P4::Collation(nocase)),
            );
        });
        assert!(branch_taken(&program));
    }

    #[test]
    fn test_nan_comparison_is_unknown() {
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            let r2 = b.alloc_register();
            b.emit(
                Insn::new(Opcode::Num, 0, r1 as i32, 0).with_p4(P4::Num(Num::nan())),
            );
            b.emit_int(1, r2);
            b.emit(Insn::new(Opcode::Lt, r1 as i32, taken.operand(), r2 as i32));
        });
        assert!(!branch_taken(&program));
    }

    fn compare_jump_rows(
        lhs: [i64; 2],
        rhs: [i64; 2],
        key_info: KeyInfo,
        permutation: Option<Vec<usize>>,
    ) -> i64 {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let a = b.alloc_registers(2);
        let c = b.alloc_registers(2);
        let out = b.alloc_register();
        b.emit_int(lhs[0], a);
        b.emit_int(lhs[1], a + 1);
        b.emit_int(rhs[0], c);
        b.emit_int(rhs[1], c + 1);
        if let Some(order) = permutation {
            b.emit(Insn::new(Opcode::Permutation, 0, 0, 0).with_p4(P4::IntArray(order)));
        }
        b.emit(
            Insn::new(Opcode::Compare, a as i32, c as i32, 2).with_p4(P4::KeyInfo(key_info)),
        );
        let lt = b.allocate_label();
        let eq = b.allocate_label();
        let gt = b.allocate_label();
        b.emit(Insn::new(Opcode::Jump, lt.operand(), eq.operand(), gt.operand()));
        b.resolve_label(lt);
        b.emit_int(-1, out);
        b.emit_result_row(out, 1);
        b.emit_halt();
        b.resolve_label(eq);
        b.emit_int(0, out);
        b.emit_result_row(out, 1);
        b.emit_halt();
        b.resolve_label(gt);
        b.emit_int(1, out);
        b.emit_result_row(out, 1);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        match &rows[0][0] {
            Value::Integer(v) => *v,
            other => panic!("unexpected marker {other:?}"),
        }
    }

    #[test]
    fn test_compare_jump_three_way() {
        let ki = || KeyInfo::of_len(2);
        assert_eq!(compare_jump_rows([1, 2], [1, 3], ki(), None), -1);
        assert_eq!(compare_jump_rows([1, 3], [1, 3], ki(), None), 0);
        assert_eq!(compare_jump_rows([2, 0], [1, 9], ki(), None), 1);
    }

    #[test]
    fn test_compare_descending_part() {
        let ki = KeyInfo::new(vec![
            KeyPart::desc(CollationDef::binary()),
            KeyPart::default(),
        ]);
        assert_eq!(compare_jump_rows([1, 2], [2, 2], ki, None), 1);
    }

    #[test]
    fn test_compare_consumes_permutation() {
        // visit the second column first: (5, 1) vs (9, 2) compares 1 vs 2
        assert_eq!(
            compare_jump_rows([5, 1], [9, 2], KeyInfo::of_len(2), Some(vec![1, 0])),
            -1
        );
    }

    #[test]
    fn test_jump_without_compare_is_rejected() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let end = b.allocate_label();
        b.emit(Insn::new(Opcode::Jump, end.operand(), end.operand(), end.operand()));
        b.resolve_label(end);
        b.emit_halt();
        let program = b.build().unwrap();
        assert!(matches!(
            run_program(&program),
            Err(BasaltError::InternalError(_))
        ));
    }

    #[test]
    fn test_once_fires_once() {
        // a two-iteration loop whose guarded block emits a row
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let out = b.alloc_register();
        let counter = b.alloc_register();
        b.emit_int(2, counter);
        let top = b.allocate_label();
        b.resolve_label(top);
        let skip = b.allocate_label();
        b.emit(Insn::new(Opcode::Once, 0, skip.operand(), 0));
        b.emit_int(7, out);
        b.emit_result_row(out, 1);
        b.resolve_label(skip);
        let done = b.allocate_label();
        b.emit(Insn::new(Opcode::DecrJumpZero, counter as i32, done.operand(), 0));
        b.emit_goto(top);
        b.resolve_label(done);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows, vec![vec![int(7)]]);
    }

    #[test]
    fn test_gosub_and_return() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let ret = b.alloc_register();
        let out = b.alloc_register();
        let sub = b.allocate_label();
        b.emit_int(10, out);
        b.emit(Insn::new(Opcode::Gosub, ret as i32, sub.operand(), 0));
        b.emit_int(20, out);
        b.emit(Insn::new(Opcode::Gosub, ret as i32, sub.operand(), 0));
        b.emit_halt();
        b.resolve_label(sub);
        b.emit_result_row(out, 1);
        b.emit(Insn::new(Opcode::Return, ret as i32, 0, 0));
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows, vec![vec![int(10)], vec![int(20)]]);
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    fn test_if_unknown_follows_p3(#[case] p3: i32, #[case] expect_taken: bool) {
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            b.emit_null(r1);
            b.emit(Insn::new(Opcode::If, r1 as i32, taken.operand(), p3));
        });
        assert_eq!(branch_taken(&program), expect_taken);
    }

    #[test]
    fn test_if_truthy_text() {
        let program = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            b.emit_string("0.5x", r1);
            b.emit(Insn::new(Opcode::If, r1 as i32, taken.operand(), 0));
        });
        assert!(branch_taken(&program));
    }

    #[test]
    fn test_must_be_int_converts_and_jumps() {
        let converts = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            b.emit_string("12", r1);
            b.emit(Insn::new(Opcode::MustBeInt, r1 as i32, 0, 0));
            b.emit(Insn::new(Opcode::Eq, r1 as i32, taken.operand(), r1 as i32));
        });
        assert!(branch_taken(&converts));

        let jumps = branch_program(|b, taken| {
            let r1 = b.alloc_register();
            b.emit_string("1.5", r1);
            b.emit(Insn::new(Opcode::MustBeInt, r1 as i32, taken.operand(), 0));
        });
        assert!(branch_taken(&jumps));

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let r1 = b.alloc_register();
        b.emit_string("junk", r1);
        b.emit(Insn::new(Opcode::MustBeInt, r1 as i32, 0, 0));
        b.emit_halt();
        let program = b.build().unwrap();
        assert!(matches!(
            run_program(&program),
            Err(BasaltError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_move_nulls_source() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let src = b.alloc_registers(2);
        let dst = b.alloc_registers(2);
        b.emit_int(1, src);
        b.emit_int(2, src + 1);
        b.emit(Insn::new(Opcode::Move, src as i32, dst as i32, 2));
        b.emit_result_row(src, 2);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows, vec![vec![Value::Null, Value::Null]]);
    }

    #[test]
    fn test_scopy_shares_copy_does_not() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let src = b.alloc_register();
        let shallow = b.alloc_register();
        let deep = b.alloc_register();
        b.emit_string("payload", src);
        b.emit(Insn::new(Opcode::SCopy, src as i32, shallow as i32, 0));
        b.emit(Insn::new(Opcode::Copy, src as i32, deep as i32, 0));
        b.emit_result_row(src, 3);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows[0], vec![text("payload"), text("payload"), text("payload")]);
    }

    #[test]
    fn test_variable_reads_binding() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let r1 = b.alloc_register();
        let r2 = b.alloc_register();
        b.emit(Insn::new(Opcode::Variable, 1, r1 as i32, 0));
        b.emit(Insn::new(Opcode::Variable, 2, r2 as i32, 0));
        b.emit_result_row(r1, 2);
        b.emit_halt();
        let program = b.build().unwrap();

        let store = Store::open_memory();
        let session = store.connect();
        let mut state = ProgramState::new(program.max_registers, program.max_cursors);
        state.bind_at(NonZero::new(1).unwrap(), int(42));
        // parameter 2 stays unbound and reads as null
        assert!(matches!(
            program.step(&mut state, &session).unwrap(),
            StepResult::Row
        ));
        let (start_reg, _) = state.result_row.unwrap();
        match &state.registers[start_reg] {
            Register::Value(v) => assert_eq!(*v, int(42)),
            _ => panic!("expected a value"),
        }
        match &state.registers[start_reg + 1] {
            Register::Value(v) => assert_eq!(*v, Value::Null),
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn test_halt_constraint_error() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        b.emit(
            Insn::new(Opcode::Halt, 1, 0, 0).with_p4(P4::Text("duplicate entry".to_string())),
        );
        let program = b.build().unwrap();
        match run_program(&program) {
            Err(BasaltError::Constraint(msg)) => assert_eq!(msg, "duplicate entry"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_stops_execution() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let top = b.allocate_label();
        b.resolve_label(top);
        b.emit_goto(top);
        let program = b.build().unwrap();

        let store = Store::open_memory();
        let session = store.connect();
        session.interrupt_handle().interrupt();
        let mut state = ProgramState::new(program.max_registers, program.max_cursors);
        assert!(matches!(
            program.step(&mut state, &session).unwrap(),
            StepResult::Interrupt
        ));
    }

    // --- cursor and storage opcodes ---

    fn rowid_key() -> KeyInfo {
        KeyInfo::of_len(1)
    }

    fn seed_rows(store: &Arc<Store>, ns: NamespaceId, rows: &[(i64, &str)]) {
        let mut cursor = store.backend().open_cursor(ns).unwrap();
        for (id, name) in rows {
            let key = encode_key(&[int(*id)], &rowid_key()).unwrap();
            let record = encode_record(&[int(*id), text(name)]).unwrap();
            cursor.insert(&key, &record).unwrap();
        }
    }

    /// Full scan emitting (rowid, column 1).
    fn scan_program(ns: NamespaceId) -> Program {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r_id = b.alloc_register();
        let r_name = b.alloc_register();
        let done = b.allocate_label();
        b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
        b.emit(Insn::new(Opcode::Rewind, cur as i32, done.operand(), 0));
        let top = b.offset();
        b.emit(Insn::new(Opcode::Rowid, cur as i32, r_id as i32, 0));
        b.emit(Insn::new(Opcode::Column, cur as i32, 1, r_name as i32));
        b.emit_result_row(r_id, 2);
        b.emit(Insn::new(Opcode::Next, cur as i32, top as i32, 0));
        b.resolve_label(done);
        b.emit_halt();
        b.build().unwrap()
    }

    #[test]
    fn test_scan_emits_rows_in_key_order() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(3, "c"), (1, "a"), (2, "b")]);
        let rows = run_in_store(&store, &scan_program(ns)).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![int(1), text("a")],
                vec![int(2), text("b")],
                vec![int(3), text("c")],
            ]
        );
    }

    #[test]
    fn test_scan_empty_namespace() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        let rows = run_in_store(&store, &scan_program(ns)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_seek_ge_positions_at_next_key() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a"), (3, "c")]);

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r_probe = b.alloc_register();
        let r_id = b.alloc_register();
        let miss = b.allocate_label();
        b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
        b.emit_int(2, r_probe);
        b.emit(
            Insn::new(Opcode::SeekGE, cur as i32, miss.operand(), r_probe as i32)
                .with_p4(P4::KeyInfo(rowid_key())),
        );
        b.emit(Insn::new(Opcode::Rowid, cur as i32, r_id as i32, 0));
        b.emit_result_row(r_id, 1);
        b.resolve_label(miss);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows, vec![vec![int(3)]]);
    }

    #[test]
    fn test_seek_gt_past_everything_jumps() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a"), (3, "c")]);

        let program = branch_program(|b, taken| {
            let cur = b.alloc_cursor();
            let r_probe = b.alloc_register();
            b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
            b.emit_int(3, r_probe);
            b.emit(
                Insn::new(Opcode::SeekGT, cur as i32, taken.operand(), r_probe as i32)
                    .with_p4(P4::KeyInfo(rowid_key())),
            );
        });
        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows[0][0], int(1));
    }

    #[test]
    fn test_found_and_not_found() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(2, "b")]);

        let hit = branch_program(|b, taken| {
            let cur = b.alloc_cursor();
            let r = b.alloc_register();
            b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
            b.emit_int(2, r);
            b.emit(
                Insn::new(Opcode::Found, cur as i32, taken.operand(), r as i32)
                    .with_p4(P4::KeyInfo(rowid_key())),
            );
        });
        assert_eq!(run_in_store(&store, &hit).unwrap()[0][0], int(1));

        let misses = branch_program(|b, taken| {
            let cur = b.alloc_cursor();
            let r = b.alloc_register();
            b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
            b.emit_int(9, r);
            b.emit(
                Insn::new(Opcode::NotFound, cur as i32, taken.operand(), r as i32)
                    .with_p4(P4::KeyInfo(rowid_key())),
            );
        });
        assert_eq!(run_in_store(&store, &misses).unwrap()[0][0], int(1));
    }

    #[test]
    fn test_range_scan_with_idx_termination() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a"), (2, "b"), (3, "c"), (4, "d")]);

        // rows with 2 <= rowid < 4
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r_low = b.alloc_register();
        let r_high = b.alloc_register();
        let r_id = b.alloc_register();
        let done = b.allocate_label();
        b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
        b.emit_int(2, r_low);
        b.emit_int(4, r_high);
        b.emit(
            Insn::new(Opcode::SeekGE, cur as i32, done.operand(), r_low as i32)
                .with_p4(P4::KeyInfo(rowid_key())),
        );
        let top = b.offset();
        b.emit(
            Insn::new(Opcode::IdxGE, cur as i32, done.operand(), r_high as i32)
                .with_p4(P4::KeyInfo(rowid_key())),
        );
        b.emit(Insn::new(Opcode::Rowid, cur as i32, r_id as i32, 0));
        b.emit_result_row(r_id, 1);
        b.emit(Insn::new(Opcode::Next, cur as i32, top as i32, 0));
        b.resolve_label(done);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows, vec![vec![int(2)], vec![int(3)]]);
    }

    #[test]
    fn test_insert_program_writes_through_codec() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r_id = b.alloc_register();
        let r_name = b.alloc_register();
        let r_key = b.alloc_register();
        let r_rec = b.alloc_register();
        let r_count = b.alloc_register();
        b.emit_transaction(true);
        b.emit(Insn::new(Opcode::OpenWrite, cur as i32, ns.0 as i32, 0));
        b.emit(Insn::new(Opcode::NewRowid, cur as i32, r_id as i32, 0));
        b.emit_string("first", r_name);
        b.emit(
            Insn::new(Opcode::MakeKey, r_id as i32, 1, r_key as i32)
                .with_p4(P4::KeyInfo(rowid_key())),
        );
        b.emit(Insn::new(Opcode::MakeRecord, r_id as i32, 2, r_rec as i32));
        b.emit(Insn::new(Opcode::Insert, cur as i32, r_key as i32, r_rec as i32));
        b.emit(Insn::new(Opcode::Count, cur as i32, r_count as i32, 0));
        b.emit_result_row(r_count, 1);
        b.emit_halt();
        let program = b.build().unwrap();

        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows, vec![vec![int(1)]]);
        assert_eq!(store.backend().namespace_len(ns).unwrap(), 1);
    }

    #[test]
    fn test_insert_through_read_cursor_is_rejected() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a")]);

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r_key = b.alloc_register();
        let r_rec = b.alloc_register();
        b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
        b.emit(
            Insn::new(Opcode::Blob, 0, r_key as i32, 0).with_p4(P4::Blob(vec![0x15])),
        );
        b.emit(
            Insn::new(Opcode::Blob, 0, r_rec as i32, 0).with_p4(P4::Blob(vec![0x00])),
        );
        b.emit(Insn::new(Opcode::Insert, cur as i32, r_key as i32, r_rec as i32));
        b.emit_halt();
        let program = b.build().unwrap();
        assert!(matches!(
            run_in_store(&store, &program),
            Err(BasaltError::ReadOnly)
        ));
    }

    #[test]
    fn test_delete_keeps_scan_going() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a"), (2, "b"), (3, "c")]);

        // delete every row, emitting its id first
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r_id = b.alloc_register();
        let done = b.allocate_label();
        b.emit_transaction(true);
        b.emit(Insn::new(Opcode::OpenWrite, cur as i32, ns.0 as i32, 0));
        b.emit(Insn::new(Opcode::Rewind, cur as i32, done.operand(), 0));
        let top = b.offset();
        b.emit(Insn::new(Opcode::Rowid, cur as i32, r_id as i32, 0));
        b.emit_result_row(r_id, 1);
        b.emit(Insn::new(Opcode::Delete, cur as i32, 0, 0));
        b.emit(Insn::new(Opcode::Next, cur as i32, top as i32, 0));
        b.resolve_label(done);
        b.emit_halt();
        let program = b.build().unwrap();

        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows, vec![vec![int(1)], vec![int(2)], vec![int(3)]]);
        assert_eq!(store.backend().namespace_len(ns).unwrap(), 0);
    }

    #[test]
    fn test_null_row_mode() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a")]);

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r = b.alloc_register();
        let done = b.allocate_label();
        b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
        b.emit(Insn::new(Opcode::Rewind, cur as i32, done.operand(), 0));
        b.emit(Insn::new(Opcode::NullRow, cur as i32, 0, 0));
        b.emit(Insn::new(Opcode::Column, cur as i32, 1, r as i32));
        b.emit_result_row(r, 1);
        b.resolve_label(done);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows, vec![vec![Value::Null]]);
    }

    #[test]
    fn test_column_past_record_end_reads_null() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(1, "a")]);

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let cur = b.alloc_cursor();
        let r = b.alloc_register();
        let done = b.allocate_label();
        b.emit(Insn::new(Opcode::OpenRead, cur as i32, ns.0 as i32, 0));
        b.emit(Insn::new(Opcode::Rewind, cur as i32, done.operand(), 0));
        b.emit(Insn::new(Opcode::Column, cur as i32, 9, r as i32));
        b.emit_result_row(r, 1);
        b.resolve_label(done);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_in_store(&store, &program).unwrap();
        assert_eq!(rows, vec![vec![Value::Null]]);
    }

    #[test]
    fn test_ephemeral_namespace_dropped_with_cursor() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        {
            let mut cursor = VmCursor::open(store.backend(), ns, true, true).unwrap();
            cursor.kv.insert(b"k", b"v").unwrap();
        }
        assert!(matches!(
            store.backend().namespace_len(ns),
            Err(BasaltError::NotFound(_))
        ));
    }

    #[test]
    fn test_new_rowid_sequences_from_last() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(41, "x")]);
        let mut cursor = VmCursor::open(store.backend(), ns, true, false).unwrap();
        let rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(get_new_rowid(&mut cursor, rng).unwrap(), 42);
    }

    #[test]
    fn test_new_rowid_probes_when_saturated() {
        let store = Store::open_memory();
        let ns = store.backend().create_namespace().unwrap();
        seed_rows(&store, ns, &[(i64::MAX, "top")]);
        let mut cursor = VmCursor::open(store.backend(), ns, true, false).unwrap();
        let rng = ChaCha8Rng::seed_from_u64(7);
        let rowid = get_new_rowid(&mut cursor, rng).unwrap();
        assert!(rowid >= 1 && rowid < i64::MAX);
    }

    #[test]
    fn test_schema_generation_mismatch() {
        let store = Store::open_memory();
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        b.set_schema_generation(store.schema_generation());
        b.emit_transaction(false);
        b.emit_halt();
        let program = b.build().unwrap();

        // the program runs against the catalog it was compiled for
        assert!(run_in_store(&store, &program).unwrap().is_empty());
        // a later catalog change invalidates it
        store.create_namespace("t").unwrap();
        assert!(matches!(
            run_in_store(&store, &program),
            Err(BasaltError::SchemaChanged)
        ));
    }

    #[test]
    fn test_scalar_function() {
        let double = FuncDef::scalar(
            "double",
            1,
            Arc::new(|args: &[Value]| Ok(args[0].exec_add(&args[0]))),
        );
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let arg = b.alloc_register();
        let out = b.alloc_register();
        b.emit_int(21, arg);
        b.emit(
            Insn::new(Opcode::Function, 0, arg as i32, out as i32)
                .with_p4(P4::Func(Arc::new(double)))
                .with_p5(1),
        );
        b.emit_result_row(out, 1);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows, vec![vec![int(42)]]);
    }

    fn agg_program(name: &str, inputs: &[i64]) -> Program {
        let def = crate::function::FunctionRegistry::with_builtins()
            .lookup(name, 1)
            .unwrap();
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let arg = b.alloc_register();
        let acc = b.alloc_register();
        for v in inputs {
            b.emit_int(*v, arg);
            b.emit(
                Insn::new(Opcode::AggStep, 0, arg as i32, acc as i32)
                    .with_p4(P4::Func(Arc::clone(&def)))
                    .with_p5(1),
            );
        }
        b.emit(
            Insn::new(Opcode::AggFinal, acc as i32, 0, 0).with_p4(P4::Func(Arc::clone(&def))),
        );
        b.emit_result_row(acc, 1);
        b.emit_halt();
        b.build().unwrap()
    }

    #[test]
    fn test_aggregate_sum_and_count() {
        assert_eq!(run_program(&agg_program("sum", &[1, 2, 5])).unwrap(), vec![vec![int(8)]]);
        assert_eq!(
            run_program(&agg_program("count", &[1, 2, 5])).unwrap(),
            vec![vec![int(3)]]
        );
    }

    #[test]
    fn test_aggregate_empty_input_defaults() {
        assert_eq!(run_program(&agg_program("count", &[])).unwrap(), vec![vec![int(0)]]);
        assert_eq!(
            run_program(&agg_program("sum", &[])).unwrap(),
            vec![vec![Value::Null]]
        );
    }

    // --- sub-programs ---

    fn row_emitting_subprogram(marker: i64) -> Rc<Program> {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let r = b.alloc_register();
        b.emit_int(marker, r);
        b.emit_result_row(r, 1);
        b.emit_halt();
        Rc::new(b.build().unwrap())
    }

    #[test]
    fn test_subprogram_runs_and_returns() {
        let sub = row_emitting_subprogram(7);
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let r = b.alloc_register();
        b.emit(Insn::new(Opcode::Program, 0, 0, 0).with_p4(P4::SubProgram(sub)));
        b.emit_int(9, r);
        b.emit_result_row(r, 1);
        b.emit_halt();
        let program = b.build().unwrap();
        let rows = run_program(&program).unwrap();
        assert_eq!(rows, vec![vec![int(7)], vec![int(9)]]);
    }

    #[test]
    fn test_frame_depth_limit() {
        let inner = row_emitting_subprogram(1);
        let mut mid = ProgramBuilder::new();
        let start = mid.emit_init();
        mid.resolve_label(start);
        mid.emit(Insn::new(Opcode::Program, 0, 0, 0).with_p4(P4::SubProgram(inner)));
        mid.emit_halt();
        let mid = Rc::new(mid.build().unwrap());

        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        b.emit(Insn::new(Opcode::Program, 0, 0, 0).with_p4(P4::SubProgram(mid)));
        b.emit_halt();
        let program = b.build().unwrap();

        let store = Store::open_memory_with(StoreOptions { max_frame_depth: 1 });
        assert!(matches!(
            run_in_store(&store, &program),
            Err(BasaltError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_explain_lists_instructions() {
        let mut b = ProgramBuilder::new();
        let start = b.emit_init();
        b.resolve_label(start);
        let r = b.alloc_register();
        b.emit_int(5, r);
        let addr = b.offset();
        b.emit_result_row(r, 1);
        b.add_comment(addr, "output");
        b.emit_halt();
        let program = b.build().unwrap();
        let listing = program.explain();
        assert!(listing.contains("Init"));
        assert!(listing.contains("ResultRow"));
        assert!(listing.contains("output"));
    }
}
