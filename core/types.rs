use std::cmp::Ordering;
use std::fmt::Display;
use std::rc::Rc;

use crate::collate::CollationDef;
use crate::numeric::{Num, ParseFlags};

/// Hard cap on a single text or blob payload, in bytes.
pub(crate) const MAX_LENGTH: usize = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TypeName {
    Null,
    Integer,
    Numeric,
    Text,
    Blob,
}

/// Payload container for text and blob values. `Owned` is the mutable
/// form; `Shared` is produced when a register is aliased and is never
/// mutated in place (writers materialize an `Owned` copy first); `Static`
/// backs program literals.
#[derive(Debug, Clone)]
pub enum Bytes {
    Owned(Vec<u8>),
    Shared(Rc<[u8]>),
    Static(&'static [u8]),
}

impl Bytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Owned(v) => v,
            Bytes::Shared(rc) => rc,
            Bytes::Static(s) => s,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Cheap alias of the payload. Converts an `Owned` buffer into the
    /// shared form in place so both handles point at one allocation.
    pub fn share(&mut self) -> Bytes {
        if let Bytes::Owned(v) = self {
            *self = Bytes::Shared(Rc::from(std::mem::take(v).into_boxed_slice()));
        }
        match self {
            Bytes::Owned(_) => unreachable!(),
            Bytes::Shared(rc) => Bytes::Shared(rc.clone()),
            Bytes::Static(s) => Bytes::Static(s),
        }
    }

    /// Copy-on-write access. Shared and static payloads are copied out
    /// before a mutable reference is handed back.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        if !matches!(self, Bytes::Owned(_)) {
            *self = Bytes::Owned(self.to_vec());
        }
        match self {
            Bytes::Owned(v) => v,
            _ => unreachable!(),
        }
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Bytes {}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes::Owned(v)
    }
}

impl From<&'static [u8]> for Bytes {
    fn from(s: &'static [u8]) -> Self {
        Bytes::Static(s)
    }
}

impl From<String> for Bytes {
    fn from(s: String) -> Self {
        Bytes::Owned(s.into_bytes())
    }
}

/// UTF-8 text. The engine only ever constructs `Text` from checked UTF-8
/// (string literals, rendered numbers, validated record decode), which is
/// what makes `as_str` sound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub value: Bytes,
}

impl Text {
    pub fn new(value: &str) -> Self {
        Text {
            value: Bytes::Owned(value.as_bytes().to_vec()),
        }
    }

    pub fn from_static(value: &'static str) -> Self {
        Text {
            value: Bytes::Static(value.as_bytes()),
        }
    }

    pub fn as_str(&self) -> &str {
        unsafe { std::str::from_utf8_unchecked(self.value.as_slice()) }
    }
}

impl From<String> for Text {
    fn from(value: String) -> Self {
        Text {
            value: Bytes::Owned(value.into_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Num(Num),
    Text(Text),
    Blob(Bytes),
}

/// Column affinity, one letter per column in the wire form an `Affinity`
/// instruction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Blob,
    Text,
    Numeric,
    Integer,
    Real,
}

impl Affinity {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(Affinity::Blob),
            'B' => Some(Affinity::Text),
            'C' => Some(Affinity::Numeric),
            'D' => Some(Affinity::Integer),
            'E' => Some(Affinity::Real),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Affinity::Blob => 'A',
            Affinity::Text => 'B',
            Affinity::Numeric => 'C',
            Affinity::Integer => 'D',
            Affinity::Real => 'E',
        }
    }
}

impl Value {
    pub fn build_text(text: impl AsRef<str>) -> Self {
        Value::Text(Text::new(text.as_ref()))
    }

    pub fn from_blob(data: Vec<u8>) -> Self {
        Value::Blob(Bytes::Owned(data))
    }

    pub fn to_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn to_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> TypeName {
        match self {
            Value::Null => TypeName::Null,
            Value::Integer(_) => TypeName::Integer,
            Value::Num(_) => TypeName::Numeric,
            Value::Text(_) => TypeName::Text,
            Value::Blob(_) => TypeName::Blob,
        }
    }

    /// Deep copy: aliased payloads come back as fresh `Owned` buffers.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Text(t) => Value::Text(Text {
                value: Bytes::Owned(t.value.to_vec()),
            }),
            Value::Blob(b) => Value::Blob(Bytes::Owned(b.to_vec())),
            other => other.clone(),
        }
    }

    /// Shallow copy: text and blob payloads are shared, scalars copied.
    pub fn shallow_clone(&mut self) -> Value {
        match self {
            Value::Text(t) => Value::Text(Text {
                value: t.value.share(),
            }),
            Value::Blob(b) => Value::Blob(b.share()),
            other => other.clone(),
        }
    }

    /// Numeric coercion for arithmetic. Text and blobs go through a
    /// whitespace-tolerant prefix parse; unparseable payloads come back as
    /// NaN and propagate. Null is the caller's problem.
    pub(crate) fn coerce_num(&self) -> Num {
        match self {
            Value::Null => Num::nan(),
            Value::Integer(i) => Num::from_i64(*i),
            Value::Num(n) => *n,
            Value::Text(t) => Self::parse_bytes(t.value.as_slice()),
            Value::Blob(b) => Self::parse_bytes(b.as_slice()),
        }
    }

    fn parse_bytes(bytes: &[u8]) -> Num {
        Num::parse(
            bytes,
            TextEncoding::Utf8,
            ParseFlags::PREFIX_ONLY | ParseFlags::IGNORE_WHITESPACE,
        )
        .0
    }

    /// Integer coercion with SQL semantics: truncation toward zero, clamp
    /// at the i64 range, zero for anything unparseable.
    pub(crate) fn coerce_i64(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(i) => *i,
            other => other.coerce_num().to_i64().0,
        }
    }

    /// Three-valued truth: `None` is unknown (Null registers and NaN).
    /// Unparseable text coerces to zero, not to unknown.
    pub(crate) fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i != 0),
            Value::Num(n) => {
                if n.is_nan() {
                    None
                } else {
                    Some(!n.is_zero())
                }
            }
            other => {
                let n = other.coerce_num();
                if n.is_nan() {
                    Some(false)
                } else {
                    Some(!n.is_zero())
                }
            }
        }
    }

    pub fn apply_affinity(&mut self, affinity: Affinity) {
        match affinity {
            Affinity::Blob => {}
            Affinity::Text => {
                if matches!(self, Value::Integer(_) | Value::Num(_)) {
                    *self = Value::Text(Text::from(self.to_string()));
                }
            }
            Affinity::Numeric => self.apply_numeric_affinity(),
            Affinity::Integer => {
                self.apply_numeric_affinity();
                if let Value::Num(n) = self {
                    let (v, lossy) = n.to_i64();
                    if !lossy {
                        *self = Value::Integer(v);
                    }
                }
            }
            Affinity::Real => {
                self.apply_numeric_affinity();
                if let Value::Integer(i) = self {
                    *self = Value::Num(Num::from_i64(*i));
                }
            }
        }
    }

    /// Text that spells a complete number becomes one: exact integral
    /// literals collapse to Integer, everything else to Num. Malformed
    /// text, blobs, and existing numbers are untouched.
    fn apply_numeric_affinity(&mut self) {
        let Value::Text(t) = self else {
            return;
        };
        let (n, is_real) = Num::parse(
            t.value.as_slice(),
            TextEncoding::Utf8,
            ParseFlags::IGNORE_WHITESPACE,
        );
        if n.is_nan() {
            return;
        }
        if !is_real {
            let (v, lossy) = n.to_i64();
            if !lossy {
                *self = Value::Integer(v);
                return;
            }
        }
        *self = Value::Num(n);
    }

    fn class_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Num(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    /// Storage order: Null, then numbers, then text, then blobs. Numbers
    /// compare by value regardless of representation, text under the given
    /// collation, blobs bytewise. The only incomparable pairing is NaN
    /// against another number; SQL null semantics live in the comparison
    /// opcodes, not here.
    pub fn partial_cmp_with(&self, other: &Value, collation: &CollationDef) -> Option<Ordering> {
        match self.class_rank().cmp(&other.class_rank()) {
            Ordering::Equal => {}
            ord => return Some(ord),
        }
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (a, b) if a.class_rank() == 1 => Num::compare(a.coerce_num(), b.coerce_num()),
            (Value::Text(a), Value::Text(b)) => Some(collation.cmp_text(a.as_str(), b.as_str())),
            (Value::Blob(a), Value::Blob(b)) => Some(a.as_slice().cmp(b.as_slice())),
            _ => unreachable!("class ranks matched"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<Num> for Value {
    fn from(v: Num) -> Self {
        Value::Num(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Num(Num::from_f64(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::build_text(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(Text::from(v))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::from_blob(v)
    }
}

/// Single origin of truth for rendering values as text; affinity
/// conversion and result output both go through here.
impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Text(t) => write!(f, "{}", t.as_str()),
            Value::Blob(b) => write!(f, "{}", String::from_utf8_lossy(b.as_slice())),
        }
    }
}
