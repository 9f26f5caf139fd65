//! The bytecode interpreter.
//!
//! A [`Program`] is a flat array of register-based instructions assembled by
//! [`builder::ProgramBuilder`]. Stepping a program runs instructions until
//! one yields a result row, the program halts, or the session is
//! interrupted. Cursor instructions reach storage through the
//! [`crate::storage`] traits, so the same programs run against any ordered
//! key/value backend.

pub mod builder;
pub mod execute;
pub mod insn;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZero;
use std::rc::Rc;
use std::sync::Arc;

use rand::{
    distributions::{Distribution, Uniform},
    Rng,
};

use crate::codec::{decode_key, encode_key, KeyInfo};
use crate::error::BasaltError;
use crate::function::AggState;
use crate::storage::{KvCursor, KvStore, NamespaceId, SeekOp, SeekResult};
use crate::types::Value;
use crate::vdbe::execute::InsnStepResult;
use crate::vdbe::insn::{Insn, Opcode};
use crate::{Result, Session};

/// What a call to `step` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The program ran to completion.
    Done,
    /// The backend parked on I/O; step again to continue. In-memory
    /// backends never produce this.
    IO,
    /// A result row is available.
    Row,
    /// The backend is locked; step again to retry from the same
    /// instruction.
    Busy,
    /// Execution was cut short by an interrupt request.
    Interrupt,
}

/// A register holds either a plain value or an aggregate accumulator that
/// `AggStep` is still feeding.
#[derive(Debug)]
pub enum Register {
    Value(Value),
    Aggregate(Box<AggState>),
}

/// One sub-program activation. Frames share the parent statement's register
/// file; only the instruction stream and return address change. The
/// caller's fired-`Once` set is parked here so the sub-program starts with
/// a clean one.
pub(crate) struct Frame {
    pub(crate) program: Rc<Program>,
    pub(crate) return_pc: u32,
    pub(crate) saved_once: Vec<u32>,
}

/// A cursor as the interpreter sees it: the backend cursor plus the flags
/// the cursor opcodes need. Holds its own store handle so ephemeral
/// namespaces can be dropped when the cursor goes away.
pub(crate) struct VmCursor {
    pub(crate) kv: Box<dyn KvCursor>,
    pub(crate) ns: NamespaceId,
    pub(crate) writable: bool,
    ephemeral: bool,
    pub(crate) null_row: bool,
    store: Arc<dyn KvStore>,
}

impl VmCursor {
    pub(crate) fn open(
        store: &Arc<dyn KvStore>,
        ns: NamespaceId,
        writable: bool,
        ephemeral: bool,
    ) -> Result<Self> {
        let kv = store.open_cursor(ns)?;
        Ok(VmCursor {
            kv,
            ns,
            writable,
            ephemeral,
            null_row: false,
            store: Arc::clone(store),
        })
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(BasaltError::ReadOnly)
        }
    }

    /// True when reads hit an actual row: positioned and not in null-row
    /// mode.
    pub(crate) fn has_row(&self) -> bool {
        !self.null_row && self.kv.is_valid()
    }
}

impl Drop for VmCursor {
    fn drop(&mut self) {
        if self.ephemeral {
            // Scratch space dies with the cursor. The namespace may already
            // be gone if the creating transaction rolled back.
            let _ = self.store.drop_namespace(self.ns);
        }
    }
}

/// All mutable interpreter state, kept apart from the immutable [`Program`]
/// so one prepared program could back several statements.
pub struct ProgramState {
    pub pc: u32,
    pub(crate) registers: Vec<Register>,
    pub(crate) cursors: Vec<Option<VmCursor>>,
    pub(crate) result_row: Option<(usize, usize)>,
    /// Outcome of the last `Compare`, consumed by `Jump`.
    pub(crate) last_compare: Option<Ordering>,
    /// Column visit order for the next `Compare`.
    pub(crate) permutation: Option<Vec<usize>>,
    /// Addresses of `Once` instructions that have fired.
    pub(crate) once: Vec<u32>,
    pub(crate) frames: Vec<Frame>,
    parameters: HashMap<NonZero<usize>, Value>,
    /// Backend level of the statement's anonymous savepoint, opened lazily
    /// by the first write instruction.
    pub(crate) stmt_boundary: Option<u32>,
}

impl ProgramState {
    pub fn new(max_registers: usize, max_cursors: usize) -> Self {
        Self {
            pc: 0,
            registers: (0..max_registers)
                .map(|_| Register::Value(Value::Null))
                .collect(),
            cursors: (0..max_cursors).map(|_| None).collect(),
            result_row: None,
            last_compare: None,
            permutation: None,
            once: Vec::new(),
            frames: Vec::new(),
            parameters: HashMap::new(),
            stmt_boundary: None,
        }
    }

    /// Back to the state of a freshly prepared statement. Bindings are
    /// cleared along with everything else.
    pub fn reset(&mut self) {
        self.pc = 0;
        for reg in &mut self.registers {
            *reg = Register::Value(Value::Null);
        }
        for cursor in &mut self.cursors {
            *cursor = None;
        }
        self.result_row = None;
        self.last_compare = None;
        self.permutation = None;
        self.once.clear();
        self.frames.clear();
        self.parameters.clear();
        self.stmt_boundary = None;
    }

    pub fn bind_at(&mut self, index: NonZero<usize>, value: Value) {
        self.parameters.insert(index, value);
    }

    pub(crate) fn get_parameter(&self, index: NonZero<usize>) -> Value {
        self.parameters.get(&index).cloned().unwrap_or(Value::Null)
    }

    pub(crate) fn slot_index(&self, operand: i32) -> Result<usize> {
        let idx = operand as usize;
        if operand < 0 || idx >= self.registers.len() {
            return Err(BasaltError::Misuse(format!(
                "register {operand} out of range"
            )));
        }
        Ok(idx)
    }

    /// Read a register that must hold a plain value.
    pub(crate) fn value(&self, operand: i32) -> Result<&Value> {
        let idx = self.slot_index(operand)?;
        match &self.registers[idx] {
            Register::Value(v) => Ok(v),
            Register::Aggregate(_) => Err(BasaltError::Misuse(format!(
                "register {operand} holds an unfinalized aggregate"
            ))),
        }
    }

    pub(crate) fn value_mut(&mut self, operand: i32) -> Result<&mut Value> {
        let idx = self.slot_index(operand)?;
        match &mut self.registers[idx] {
            Register::Value(v) => Ok(v),
            Register::Aggregate(_) => Err(BasaltError::Misuse(format!(
                "register {operand} holds an unfinalized aggregate"
            ))),
        }
    }

    pub(crate) fn set_value(&mut self, operand: i32, value: Value) -> Result<()> {
        let idx = self.slot_index(operand)?;
        self.registers[idx] = Register::Value(value);
        Ok(())
    }

    /// Clone `count` consecutive register values starting at `start`.
    pub(crate) fn values_range(&self, start: i32, count: usize) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(self.value(start + i as i32)?.clone());
        }
        Ok(out)
    }

    pub(crate) fn cursor(&self, id: i32) -> Result<&VmCursor> {
        let idx = self.cursor_index(id)?;
        self.cursors[idx]
            .as_ref()
            .ok_or_else(|| BasaltError::Misuse(format!("cursor {id} is not open")))
    }

    pub(crate) fn cursor_mut(&mut self, id: i32) -> Result<&mut VmCursor> {
        let idx = self.cursor_index(id)?;
        self.cursors[idx]
            .as_mut()
            .ok_or_else(|| BasaltError::Misuse(format!("cursor {id} is not open")))
    }

    pub(crate) fn cursor_index(&self, id: i32) -> Result<usize> {
        let idx = id as usize;
        if id < 0 || idx >= self.cursors.len() {
            return Err(BasaltError::Misuse(format!("cursor {id} out of range")));
        }
        Ok(idx)
    }
}

/// An immutable, executable program.
pub struct Program {
    pub(crate) insns: Vec<Insn>,
    pub(crate) comments: Vec<(u32, &'static str)>,
    pub max_registers: usize,
    pub max_cursors: usize,
    pub parameter_count: usize,
}

impl Program {
    pub fn insn_count(&self) -> usize {
        self.insns.len()
    }

    /// Run instructions until the program yields. The innermost frame's
    /// instruction stream is active; the top-level program resumes when its
    /// frames return.
    pub fn step(&self, state: &mut ProgramState, session: &Session) -> Result<StepResult> {
        loop {
            if session.interrupt_requested() {
                return Ok(StepResult::Interrupt);
            }
            // invalidate the previous row
            let _ = state.result_row.take();
            let frame_program = state.frames.last().map(|f| Rc::clone(&f.program));
            let program: &Program = frame_program.as_deref().unwrap_or(self);
            let Some(insn) = program.insns.get(state.pc as usize) else {
                return Err(BasaltError::InternalError(format!(
                    "program counter {} out of range",
                    state.pc
                )));
            };
            trace_insn(program, state.pc, insn);
            let exec = insn.opcode.handler();
            match exec(program, state, insn, session)? {
                InsnStepResult::Step => {}
                InsnStepResult::Done => return Ok(StepResult::Done),
                InsnStepResult::Row => return Ok(StepResult::Row),
            }
        }
    }

    #[rustfmt::skip]
    pub fn explain(&self) -> String {
        let mut buff = String::with_capacity(1024);
        buff.push_str("addr  opcode             p1    p2    p3    p4             p5  comment\n");
        buff.push_str("----  -----------------  ----  ----  ----  -------------  --  -------\n");
        let mut indent_count: usize = 0;
        let mut prev: Option<&Insn> = None;
        for (addr, insn) in self.insns.iter().enumerate() {
            indent_count = get_indent_count(indent_count, insn, prev);
            buff.push_str(&insn_to_str(self, addr as u32, insn, "  ".repeat(indent_count)));
            buff.push('\n');
            prev = Some(insn);
        }
        buff
    }

    fn comment_for(&self, addr: u32) -> Option<&'static str> {
        self.comments
            .iter()
            .find(|(offset, _)| *offset == addr)
            .map(|(_, comment)| *comment)
    }
}

/// Pick an integer key no entry uses: one past the largest while there is
/// headroom, random probing once the top is taken.
fn get_new_rowid<R: Rng>(cursor: &mut VmCursor, mut rng: R) -> Result<i64> {
    if !cursor.kv.last()? {
        return Ok(1);
    }
    let last = decode_rowid(cursor.kv.key()?)?;
    if last < i64::MAX {
        return Ok(last + 1);
    }
    let distribution = Uniform::from(1..=i64::MAX);
    let rowid_key = KeyInfo::of_len(1);
    let max_attempts = 100;
    for _ in 0..max_attempts {
        let candidate = distribution.sample(&mut rng);
        let probe = encode_key(&[Value::Integer(candidate)], &rowid_key)?;
        if !matches!(cursor.kv.seek(&probe, SeekOp::EQ)?, SeekResult::Exact) {
            return Ok(candidate);
        }
    }
    Err(BasaltError::Constraint("out of rowids".to_string()))
}

/// The leading key component, which integer-keyed namespaces store the
/// rowid in.
fn decode_rowid(key: &[u8]) -> Result<i64> {
    let values = decode_key(key, &KeyInfo::of_len(1))?;
    match values.first() {
        Some(Value::Integer(v)) => Ok(*v),
        _ => Err(BasaltError::Misuse(
            "cursor key does not start with a rowid".to_string(),
        )),
    }
}

#[tracing::instrument(skip(program), level = tracing::Level::TRACE)]
fn trace_insn(program: &Program, addr: u32, insn: &Insn) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    tracing::trace!("{}", insn_to_str(program, addr, insn, String::new()));
}

fn insn_to_str(program: &Program, addr: u32, insn: &Insn, indent: String) -> String {
    let opcode = format!("{indent}{}", insn.opcode);
    let comment = program.comment_for(addr).unwrap_or("");
    format!(
        "{:<4}  {:<17}  {:<4}  {:<4}  {:<4}  {:<13}  {:<2}  {}",
        addr,
        opcode,
        insn.p1,
        insn.p2,
        insn.p3,
        insn.p4.display(),
        insn.p5,
        comment
    )
}

/// Loop bodies indent one step in explain listings: scans open with a
/// positioning instruction and close with `Next`/`Prev`.
fn get_indent_count(indent_count: usize, curr: &Insn, prev: Option<&Insn>) -> usize {
    let indent_count = match prev.map(|p| p.opcode) {
        Some(
            Opcode::Rewind
            | Opcode::Last
            | Opcode::SeekGE
            | Opcode::SeekGT
            | Opcode::SeekLE
            | Opcode::SeekLT,
        ) => indent_count + 1,
        _ => indent_count,
    };
    if matches!(curr.opcode, Opcode::Next | Opcode::Prev) {
        indent_count.saturating_sub(1)
    } else {
        indent_count
    }
}

/// Typed access to result row columns.
pub trait FromValueRow<'a>: Sized {
    fn from_value(value: &'a Value) -> Result<Self>;
}

impl FromValueRow<'_> for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(*i),
            _ => Err(BasaltError::InvalidArgument(
                "expected integer value".to_string(),
            )),
        }
    }
}

impl FromValueRow<'_> for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Num(n) => Ok(n.to_f64()),
            _ => Err(BasaltError::InvalidArgument(
                "expected numeric value".to_string(),
            )),
        }
    }
}

impl FromValueRow<'_> for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(t) => Ok(t.as_str().to_string()),
            _ => Err(BasaltError::InvalidArgument(
                "expected text value".to_string(),
            )),
        }
    }
}

impl<'a> FromValueRow<'a> for &'a str {
    fn from_value(value: &'a Value) -> Result<Self> {
        match value {
            Value::Text(t) => Ok(t.as_str()),
            _ => Err(BasaltError::InvalidArgument(
                "expected text value".to_string(),
            )),
        }
    }
}

impl<'a> FromValueRow<'a> for &'a Value {
    fn from_value(value: &'a Value) -> Result<Self> {
        Ok(value)
    }
}

/// One result row, borrowed from the statement that produced it. Valid
/// until the statement steps again.
pub struct Row<'a> {
    values: &'a [Register],
}

impl<'a> Row<'a> {
    pub(crate) fn new(values: &'a [Register]) -> Self {
        Row { values }
    }

    pub fn get<T: FromValueRow<'a>>(&self, idx: usize) -> Result<T> {
        T::from_value(self.get_value(idx)?)
    }

    pub fn get_value(&self, idx: usize) -> Result<&'a Value> {
        match self.values.get(idx) {
            Some(Register::Value(v)) => Ok(v),
            Some(Register::Aggregate(_)) => Err(BasaltError::Misuse(
                "result column holds an unfinalized aggregate".to_string(),
            )),
            None => Err(BasaltError::OutOfRange(format!(
                "result column {idx} out of range"
            ))),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &'a Value> {
        self.values.iter().filter_map(|reg| match reg {
            Register::Value(v) => Some(v),
            Register::Aggregate(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
