use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bitflags::bitflags;
use strum_macros::Display;

use crate::codec::KeyInfo;
use crate::collate::CollationDef;
use crate::function::FuncDef;
use crate::numeric::Num;
use crate::types::Affinity;
use crate::vdbe::Program;

/// Static operand classes of an opcode, used by the builder to patch jump
/// targets and sanity-check register operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpFlags(u8);

bitflags! {
    impl OpFlags: u8 {
        /// `p2` is a jump target.
        const JUMP = 0b0000_0001;
        /// `p1` addresses a register that is read.
        const IN1  = 0b0000_0010;
        /// `p2` addresses a register that is read.
        const IN2  = 0b0000_0100;
        /// `p3` addresses a register that is read.
        const IN3  = 0b0000_1000;
        /// `p2` addresses a register that is written.
        const OUT2 = 0b0001_0000;
        /// `p3` addresses a register that is written.
        const OUT3 = 0b0010_0000;
    }
}

/// Flags carried in `p5` of the six relational opcodes. The low bits double
/// as an affinity letter, the same packing the comparison emitters use for
/// index lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmpFlags(u16);

impl CmpFlags {
    /// Null compares equal to null and unequal to everything else. Only
    /// meaningful on `Eq` and `Ne`.
    pub const NULL_EQ: u16 = 0x80;
    /// Take the jump when the comparison outcome is unknown, instead of
    /// falling through.
    pub const JUMP_IF_NULL: u16 = 0x10;
    /// Affinity letters 'A'..'E' fit under this mask without touching the
    /// two flag bits.
    const AFFINITY_MASK: u16 = 0x47;

    pub fn new() -> Self {
        CmpFlags(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        CmpFlags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn null_eq(mut self) -> Self {
        self.0 |= Self::NULL_EQ;
        self
    }

    pub fn jump_if_null(mut self) -> Self {
        self.0 |= Self::JUMP_IF_NULL;
        self
    }

    /// Coerce both operands to this affinity before comparing.
    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.0 = (self.0 & !Self::AFFINITY_MASK) | (affinity.as_char() as u16 & Self::AFFINITY_MASK);
        self
    }

    pub fn affinity(self) -> Affinity {
        let letter = (self.0 & Self::AFFINITY_MASK) as u8 as char;
        Affinity::from_char(letter).unwrap_or(Affinity::Blob)
    }

    pub fn has_null_eq(self) -> bool {
        self.0 & Self::NULL_EQ != 0
    }

    pub fn has_jump_if_null(self) -> bool {
        self.0 & Self::JUMP_IF_NULL != 0
    }
}

/// The out-of-band operand. Most instructions carry `P4::None`; the rest use
/// it for constants and shared descriptors that do not fit in an `i32`.
#[derive(Clone, Default)]
pub enum P4 {
    #[default]
    None,
    Int64(i64),
    Num(Num),
    Text(String),
    Blob(Vec<u8>),
    Collation(Arc<CollationDef>),
    Func(Arc<FuncDef>),
    KeyInfo(KeyInfo),
    IntArray(Vec<usize>),
    SubProgram(Rc<Program>),
}

impl P4 {
    /// Rendering used by the `p4` column of `explain` output.
    pub fn display(&self) -> String {
        match self {
            P4::None => String::new(),
            P4::Int64(v) => v.to_string(),
            P4::Num(n) => n.to_string(),
            P4::Text(s) => s.clone(),
            P4::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
                format!("x'{hex}'")
            }
            P4::Collation(c) => c.name.clone(),
            P4::Func(f) => format!("{}({})", f.name, f.n_args),
            P4::KeyInfo(k) => format!("k({})", k.parts.len()),
            P4::IntArray(v) => format!("{v:?}"),
            P4::SubProgram(p) => format!("program({} ops)", p.insn_count()),
        }
    }
}

impl fmt::Debug for P4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self, P4::None) {
            write!(f, "-")
        } else {
            write!(f, "{}", self.display())
        }
    }
}

/// One instruction. The three numeric operands mean different things per
/// opcode; the conventions are documented on each [`Opcode`] variant.
#[derive(Clone, Debug)]
pub struct Insn {
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: P4,
    pub p5: u16,
}

impl Insn {
    pub fn new(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Self {
        Insn {
            opcode,
            p1,
            p2,
            p3,
            p4: P4::None,
            p5: 0,
        }
    }

    pub fn with_p4(mut self, p4: P4) -> Self {
        self.p4 = p4;
        self
    }

    pub fn with_p5(mut self, p5: u16) -> Self {
        self.p5 = p5;
        self
    }
}

/// The instruction set. Register operands are written `r[p1]`; `r[p1..]`
/// means consecutive registers starting at `p1`. Jump targets may be
/// emitted as unresolved labels and are patched by
/// [`ProgramBuilder::build`](crate::vdbe::builder::ProgramBuilder::build).
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// First instruction of every program. Jumps to `p2`, where prologue
    /// code (transaction setup, constants) lives before the main loop.
    Init,
    /// Unconditional jump to `p2`.
    Goto,
    /// Store the address of the next instruction in `r[p1]`, then jump to
    /// `p2`.
    Gosub,
    /// Jump to the address held as an integer in `r[p1]`.
    Return,
    /// Three-way branch on the outcome of the immediately preceding
    /// `Compare`: `p1` if less, `p2` if equal, `p3` if greater. Anything
    /// other than `Compare` directly before is a program bug.
    Jump,
    /// Fall through the first time it executes, jump to `p2` on every
    /// later pass. Resetting the statement re-arms it.
    Once,
    /// Jump to `p2` when `r[p1]` is true. When the truth value is unknown
    /// (null, NaN) jump only if `p3` is nonzero.
    If,
    /// Jump to `p2` when `r[p1]` is false, with the same `p3` treatment of
    /// unknown as `If`.
    IfNot,
    /// Jump to `p2` when `r[p1]` is null.
    IsNull,
    /// Jump to `p2` when `r[p1]` is not null.
    NotNull,
    /// If the integer in `r[p1]` is positive, subtract `p3` from it and
    /// jump to `p2`.
    IfPos,
    /// Decrement the integer in `r[p1]`; jump to `p2` when it reaches
    /// zero.
    DecrJumpZero,
    /// Force `r[p1]` to an integer. If the value cannot be represented
    /// without loss, jump to `p2`, or fail with a datatype mismatch when
    /// `p2` is zero.
    MustBeInt,
    /// Stop execution. `p1` zero means success; otherwise the statement
    /// fails: with `p2` zero as a constraint violation, with `p2` nonzero
    /// the whole transaction is poisoned. `p4` may carry the message.
    Halt,
    /// `Halt` semantics, applied only when `r[p3]` is null; otherwise a
    /// no-op.
    HaltIfNull,
    /// Does nothing.
    Noop,
    /// Run the sub-program in `p4` as a frame sharing this statement's
    /// registers. Returns to the following instruction when the frame
    /// halts successfully.
    Program,

    /// Load the small integer constant `p1` into `r[p2]`.
    Integer,
    /// Load the 64-bit constant in `p4` into `r[p2]`.
    Int64,
    /// Load the decimal constant in `p4` into `r[p2]`.
    Num,
    /// Load the UTF-8 string in `p4` into `r[p2]`.
    String8,
    /// Load the blob in `p4` into `r[p2]`.
    Blob,
    /// Store null in `r[p2]`, and in every register through `r[p3]` when
    /// `p3 > p2`.
    Null,
    /// Copy the value bound to parameter `p1` (1-based) into `r[p2]`.
    /// Unbound parameters read as null.
    Variable,

    /// Move `p3` registers from `r[p1..]` to `r[p2..]`, leaving the
    /// sources null.
    Move,
    /// Deep-copy `p3 + 1` registers from `r[p1..]` to `r[p2..]`.
    Copy,
    /// Shallow copy of `r[p1]` into `r[p2]`; the two registers share any
    /// text or blob payload afterwards.
    SCopy,

    /// `r[p3] = r[p1] + r[p2]`. Null propagates; integer overflow falls
    /// back to decimal arithmetic.
    Add,
    /// `r[p3] = r[p1] - r[p2]`.
    Subtract,
    /// `r[p3] = r[p1] * r[p2]`.
    Multiply,
    /// `r[p3] = r[p1] / r[p2]`. Division always happens in decimal, so
    /// `7 / 2` is `3.5` and division by zero yields an infinity (or NaN
    /// for `0 / 0`) rather than an error.
    Divide,
    /// `r[p3] = r[p1] % r[p2]`.
    Remainder,
    /// `r[p3] = r[p1] || r[p2]`. Blob operands concatenate bytewise,
    /// otherwise both sides render as text.
    Concat,
    /// Add the immediate `p2` to `r[p1]`, forcing the register to an
    /// integer first.
    AddImm,
    /// `r[p3] = int(r[p1]) & int(r[p2])`.
    BitAnd,
    /// `r[p3] = int(r[p1]) | int(r[p2])`.
    BitOr,
    /// `r[p3] = int(r[p1]) << int(r[p2])`. Negative shift counts shift
    /// the other way; counts past 63 saturate.
    ShiftLeft,
    /// `r[p3] = int(r[p1]) >> int(r[p2])`, arithmetic shift.
    ShiftRight,
    /// `r[p2] = ~int(r[p1])`.
    BitNot,
    /// Boolean negation of `r[p1]` into `r[p2]`; unknown stays unknown.
    Not,
    /// `r[p3] = r[p1] AND r[p2]` under three-valued logic: false wins
    /// over unknown.
    And,
    /// `r[p3] = r[p1] OR r[p2]`: true wins over unknown.
    Or,

    /// Jump to `p2` when `r[p1] == r[p3]` under the collation in `p4` and
    /// the [`CmpFlags`] in `p5`.
    Eq,
    /// Jump to `p2` when `r[p1] != r[p3]`.
    Ne,
    /// Jump to `p2` when `r[p1] < r[p3]`.
    Lt,
    /// Jump to `p2` when `r[p1] <= r[p3]`.
    Le,
    /// Jump to `p2` when `r[p1] > r[p3]`.
    Gt,
    /// Jump to `p2` when `r[p1] >= r[p3]`.
    Ge,
    /// Compare `p3`-register vectors at `r[p1..]` and `r[p2..]` under the
    /// key description in `p4` and remember the signed outcome for the
    /// `Jump` that must follow. Consumes any pending `Permutation`.
    Compare,
    /// Supply the column visit order (`p4`, an integer array) for the
    /// next `Compare`.
    Permutation,

    /// Apply the affinity string in `p4` (one letter per register) to
    /// `r[p1..p1+p2]`.
    Affinity,
    /// Force `r[p1]` to the type named by the affinity letter `p2`.
    /// Unlike affinity application this conversion is lossy: text that
    /// does not parse as a number casts to zero.
    Cast,

    /// Open a read-only cursor with id `p1` on namespace `p2`.
    OpenRead,
    /// Open a read-write cursor with id `p1` on namespace `p2`.
    OpenWrite,
    /// Create a scratch namespace and open read-write cursor `p1` on it.
    /// The namespace is destroyed when the cursor closes.
    OpenEphemeral,
    /// Close cursor `p1`. Closing a never-opened cursor is a no-op.
    Close,
    /// Position cursor `p1` at the first entry `>=` the key encoded from
    /// `r[p3..]` under the key description in `p4`. Jump to `p2` when no
    /// such entry exists.
    SeekGE,
    /// As `SeekGE` with a strictly-greater bound.
    SeekGT,
    /// Position at the last entry `<=` the probe key, else jump to `p2`.
    SeekLE,
    /// As `SeekLE` with a strictly-less bound.
    SeekLT,
    /// Jump to `p2` when an entry exactly matching the probe key encoded
    /// from `r[p3..]` exists, leaving the cursor on it.
    Found,
    /// Jump to `p2` when no entry exactly matches the probe key.
    NotFound,
    /// Position cursor `p1` at its first entry; jump to `p2` when the
    /// namespace is empty.
    Rewind,
    /// Position cursor `p1` at its last entry; jump to `p2` when empty.
    Last,
    /// Advance cursor `p1`; jump to `p2` while a row remains, fall
    /// through when the scan is exhausted.
    Next,
    /// Step cursor `p1` backwards; jump to `p2` while a row remains.
    Prev,
    /// Decode column `p2` of the record under cursor `p1` into `r[p3]`.
    /// Reads null when the cursor is on no row or past the record's last
    /// column.
    Column,
    /// Store the raw encoded key under cursor `p1` as a blob in `r[p2]`.
    RowKey,
    /// Store the raw encoded record under cursor `p1` as a blob in
    /// `r[p2]`.
    RowData,
    /// Decode the leading integer key component under cursor `p1` into
    /// `r[p2]`.
    Rowid,
    /// Generate an unused integer key for cursor `p1` into `r[p2]`:
    /// largest-plus-one while headroom remains, then random probing.
    NewRowid,
    /// Insert into cursor `p1`'s namespace: key from the blob in `r[p2]`,
    /// record from the blob in `r[p3]`. Overwrites any existing entry.
    Insert,
    /// Delete the entry under cursor `p1`. The cursor keeps its position
    /// for a following `Next`/`Prev`.
    Delete,
    /// Store the number of entries in cursor `p1`'s namespace in `r[p2]`.
    Count,
    /// Encode `r[p1..p1+p2]` into an ordered key under the description in
    /// `p4`, storing the blob in `r[p3]`.
    MakeKey,
    /// Encode `r[p1..p1+p2]` into a record blob in `r[p3]`.
    MakeRecord,
    /// Jump to `p2` when the encoded key under cursor `p1` is `>=` the
    /// probe encoded from `r[p3..]` under `p4`. A cursor on no row always
    /// takes the jump. The termination test of an index range scan.
    IdxGE,
    /// As `IdxGE` with a strictly-greater test.
    IdxGT,
    /// Jump to `p2` when the cursor key is `<=` the probe.
    IdxLE,
    /// As `IdxLE` with a strictly-less test.
    IdxLT,
    /// Put cursor `p1` into null-row mode: reads yield null until the
    /// next movement. The outer half of a left join emits this.
    NullRow,

    /// Start or join a transaction. `p2` nonzero asks for write intent.
    /// When `p3` is nonzero it carries the schema generation the program
    /// was compiled against, and a mismatch aborts with a schema-changed
    /// error before any row is touched.
    Transaction,
    /// Savepoint control: `p1` 0 opens, 1 releases, 2 rolls back to the
    /// savepoint named by `p4`.
    Savepoint,
    /// Leave or enter autocommit mode: `p1` is the target flag, and when
    /// leaving a transaction `p2` nonzero rolls it back instead of
    /// committing.
    AutoCommit,

    /// Invoke the scalar function in `p4` with arguments `r[p2..p2+p5]`,
    /// storing the result in `r[p3]`.
    Function,
    /// Feed `r[p2..p2+p5]` to the aggregate in `p4`, accumulating state
    /// in `r[p3]`.
    AggStep,
    /// Finalize the accumulator in `r[p1]`, replacing it with the
    /// aggregate's result. `p4` names the aggregate so an accumulator
    /// that never saw a row still produces the right empty-input value.
    AggFinal,

    /// Yield `r[p1..p1+p2]` as a result row and suspend until the next
    /// step.
    ResultRow,
}

impl Opcode {
    /// Operand classes, used when patching labels and validating programs.
    pub const fn flags(self) -> OpFlags {
        match self {
            Opcode::Init
            | Opcode::Goto
            | Opcode::Gosub
            | Opcode::Once
            | Opcode::Rewind
            | Opcode::Last
            | Opcode::Next
            | Opcode::Prev => OpFlags::JUMP,
            Opcode::Return => OpFlags::IN1,
            // All three operands of Jump are targets; the builder
            // special-cases the patching of p1 and p3.
            Opcode::Jump => OpFlags::JUMP,
            Opcode::If
            | Opcode::IfNot
            | Opcode::IsNull
            | Opcode::NotNull
            | Opcode::IfPos
            | Opcode::DecrJumpZero
            | Opcode::MustBeInt => OpFlags::JUMP.union(OpFlags::IN1),
            Opcode::HaltIfNull => OpFlags::IN3,
            Opcode::Halt | Opcode::Noop | Opcode::Program => OpFlags::empty(),
            Opcode::Integer
            | Opcode::Int64
            | Opcode::Num
            | Opcode::String8
            | Opcode::Blob
            | Opcode::Null
            | Opcode::Variable => OpFlags::OUT2,
            Opcode::Move | Opcode::Copy | Opcode::SCopy => OpFlags::IN1.union(OpFlags::OUT2),
            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Remainder
            | Opcode::Concat
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::And
            | Opcode::Or => OpFlags::IN1.union(OpFlags::IN2).union(OpFlags::OUT3),
            Opcode::AddImm | Opcode::Affinity | Opcode::Cast => OpFlags::IN1,
            Opcode::BitNot | Opcode::Not => OpFlags::IN1.union(OpFlags::OUT2),
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                OpFlags::JUMP.union(OpFlags::IN1).union(OpFlags::IN3)
            }
            Opcode::Compare => OpFlags::IN1.union(OpFlags::IN2),
            Opcode::Permutation => OpFlags::empty(),
            Opcode::OpenRead
            | Opcode::OpenWrite
            | Opcode::OpenEphemeral
            | Opcode::Close
            | Opcode::Delete
            | Opcode::NullRow => OpFlags::empty(),
            Opcode::SeekGE
            | Opcode::SeekGT
            | Opcode::SeekLE
            | Opcode::SeekLT
            | Opcode::Found
            | Opcode::NotFound
            | Opcode::IdxGE
            | Opcode::IdxGT
            | Opcode::IdxLE
            | Opcode::IdxLT => OpFlags::JUMP.union(OpFlags::IN3),
            Opcode::Column => OpFlags::OUT3,
            Opcode::RowKey | Opcode::RowData | Opcode::Rowid | Opcode::NewRowid | Opcode::Count => {
                OpFlags::OUT2
            }
            Opcode::Insert => OpFlags::IN2.union(OpFlags::IN3),
            Opcode::MakeKey | Opcode::MakeRecord => OpFlags::IN1.union(OpFlags::OUT3),
            Opcode::Transaction | Opcode::Savepoint | Opcode::AutoCommit => OpFlags::empty(),
            Opcode::Function => OpFlags::IN2.union(OpFlags::OUT3),
            Opcode::AggStep => OpFlags::IN2,
            Opcode::AggFinal => OpFlags::empty(),
            Opcode::ResultRow => OpFlags::IN1,
        }
    }

    pub fn is_jump(self) -> bool {
        self.flags().contains(OpFlags::JUMP)
    }
}
