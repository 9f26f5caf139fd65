use std::cmp::Ordering;
use std::sync::Arc;

use crate::bail_corrupt_error;
use crate::collate::CollationDef;
use crate::error::BasaltError;
use crate::numeric::Num;
use crate::types::{Text, Value, MAX_LENGTH};
use crate::Result;

/// Where NULLs land in an ordered key, independent of scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullOrder {
    #[default]
    First,
    Last,
}

#[derive(Debug, Clone)]
pub struct KeyPart {
    pub collation: Arc<CollationDef>,
    pub desc: bool,
    pub null_order: NullOrder,
}

impl Default for KeyPart {
    fn default() -> Self {
        KeyPart {
            collation: CollationDef::binary(),
            desc: false,
            null_order: NullOrder::First,
        }
    }
}

impl KeyPart {
    pub fn asc(collation: Arc<CollationDef>) -> Self {
        KeyPart {
            collation,
            ..Default::default()
        }
    }

    pub fn desc(collation: Arc<CollationDef>) -> Self {
        KeyPart {
            collation,
            desc: true,
            ..Default::default()
        }
    }
}

/// Ordering description for a multi-column key. Columns beyond the listed
/// parts compare ascending with binary collation, the usual shape of a
/// trailing row key column.
#[derive(Debug, Clone, Default)]
pub struct KeyInfo {
    pub parts: Vec<KeyPart>,
}

impl KeyInfo {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        KeyInfo { parts }
    }

    pub fn of_len(n: usize) -> Self {
        KeyInfo {
            parts: (0..n).map(|_| KeyPart::default()).collect(),
        }
    }

    fn collation(&self, i: usize) -> Arc<CollationDef> {
        self.parts
            .get(i)
            .map(|p| p.collation.clone())
            .unwrap_or_else(CollationDef::binary)
    }

    fn is_desc(&self, i: usize) -> bool {
        self.parts.get(i).is_some_and(|p| p.desc)
    }

    fn null_order(&self, i: usize) -> NullOrder {
        self.parts
            .get(i)
            .map(|p| p.null_order)
            .unwrap_or(NullOrder::First)
    }
}

/// Pairwise ordering of two value vectors under a key description. The
/// first unequal column decides; an exhausted side sorts first. DESC flips
/// the column's value order but never its NULL placement, which is chosen
/// by `null_order` alone. A NaN in a compared pair makes the whole
/// comparison undecided.
pub fn compare_multi(a: &[Value], b: &[Value], key_info: &KeyInfo) -> Option<Ordering> {
    for (i, (l, r)) in a.iter().zip(b.iter()).enumerate() {
        let ord = match (l, r) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => match key_info.null_order(i) {
                NullOrder::First => Ordering::Less,
                NullOrder::Last => Ordering::Greater,
            },
            (_, Value::Null) => match key_info.null_order(i) {
                NullOrder::First => Ordering::Greater,
                NullOrder::Last => Ordering::Less,
            },
            _ => {
                let ord = l.partial_cmp_with(r, &key_info.collation(i))?;
                if key_info.is_desc(i) {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return Some(ord);
        }
    }
    Some(a.len().cmp(&b.len()))
}

// Key part tags, chosen so that within one part the tag byte alone orders
// the type classes. DESC parts invert tag and body; the NULL tags are
// exempt and sit below (0x05) or above (0xFA) every tag in both the plain
// and the inverted range.
const TAG_NULL_FIRST: u8 = 0x05;
const TAG_NAN: u8 = 0x06;
const TAG_NEG_INF: u8 = 0x07;
const TAG_NEG: u8 = 0x08;
const TAG_ZERO: u8 = 0x15;
const TAG_POS: u8 = 0x23;
const TAG_POS_INF: u8 = 0x24;
const TAG_TEXT: u8 = 0x26;
const TAG_BLOB: u8 = 0x34;
const TAG_NULL_LAST: u8 = 0xFA;

const EXP_BIAS: i32 = 0x8000;

/// Encode a value vector into a byte string whose memcmp order equals
/// `compare_multi` order under the same `KeyInfo`. Approximation flags are
/// not part of a key: values that compare equal encode identically.
pub fn encode_key(values: &[Value], key_info: &KeyInfo) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (i, v) in values.iter().enumerate() {
        encode_part(&mut out, v, key_info, i)?;
        if out.len() > MAX_LENGTH {
            return Err(BasaltError::TooBig);
        }
    }
    Ok(out)
}

fn encode_part(out: &mut Vec<u8>, v: &Value, key_info: &KeyInfo, i: usize) -> Result<()> {
    if matches!(v, Value::Null) {
        out.push(match key_info.null_order(i) {
            NullOrder::First => TAG_NULL_FIRST,
            NullOrder::Last => TAG_NULL_LAST,
        });
        return Ok(());
    }
    let start = out.len();
    match v {
        Value::Null => unreachable!(),
        Value::Integer(x) => encode_numeric(out, Num::from_i64(*x)),
        Value::Num(n) => encode_numeric(out, *n),
        Value::Text(t) => {
            let key = key_info.collation(i).sort_key(t.as_str())?;
            out.push(TAG_TEXT);
            push_escaped(out, key.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            push_escaped(out, b.as_slice());
        }
    }
    if key_info.is_desc(i) {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
    Ok(())
}

fn encode_numeric(out: &mut Vec<u8>, n: Num) {
    if n.is_nan() {
        out.push(TAG_NAN);
        return;
    }
    if n.is_inf() {
        out.push(if n.is_negative() {
            TAG_NEG_INF
        } else {
            TAG_POS_INF
        });
        return;
    }
    if n.is_zero() {
        out.push(TAG_ZERO);
        return;
    }
    out.push(if n.is_negative() { TAG_NEG } else { TAG_POS });
    let body_start = out.len();
    let digits = n.mantissa().to_string();
    let adj = n.exponent() as i32 + digits.len() as i32 - 1;
    out.extend_from_slice(&((adj + EXP_BIAS) as u16).to_be_bytes());
    // two decimal digits per byte, odd so the 0x00 terminator sorts below
    // any continuation
    let bytes = digits.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let hi = bytes[i] - b'0';
        let lo = if i + 1 < bytes.len() {
            bytes[i + 1] - b'0'
        } else {
            0
        };
        out.push((hi * 10 + lo) * 2 + 1);
        i += 2;
    }
    out.push(0x00);
    // a negative body is stored complemented so larger magnitudes sort
    // earlier
    if n.is_negative() {
        for b in &mut out[body_start..] {
            *b = !*b;
        }
    }
}

fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

struct KeyReader<'a> {
    buf: &'a [u8],
    pos: usize,
    // two independent complement layers: DESC inversion and the negative
    // numeric body inversion
    invert: bool,
    extra: bool,
}

impl<'a> KeyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        KeyReader {
            buf,
            pos: 0,
            invert: false,
            extra: false,
        }
    }

    fn raw_peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<u8> {
        let Some(&b) = self.buf.get(self.pos) else {
            bail_corrupt_error!("truncated key");
        };
        self.pos += 1;
        Ok(b ^ self.mask())
    }

    fn mask(&self) -> u8 {
        let mut m = 0u8;
        if self.invert {
            m ^= 0xFF;
        }
        if self.extra {
            m ^= 0xFF;
        }
        m
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Inverse of `encode_key`. Text encoded under a sort-key transform decodes
/// to the transformed spelling, which is all the encoding retains.
pub fn decode_key(buf: &[u8], key_info: &KeyInfo) -> Result<Vec<Value>> {
    let mut r = KeyReader::new(buf);
    let mut out = Vec::new();
    while !r.at_end() {
        let i = out.len();
        // NULL tags are never inverted, so check them on the raw byte
        match r.raw_peek() {
            Some(TAG_NULL_FIRST) | Some(TAG_NULL_LAST) => {
                r.pos += 1;
                out.push(Value::Null);
                continue;
            }
            _ => {}
        }
        r.invert = key_info.is_desc(i);
        r.extra = false;
        let tag = r.next()?;
        let v = match tag {
            TAG_NAN => Value::Num(Num::nan()),
            TAG_NEG_INF => Value::Num(Num::infinity(true)),
            TAG_POS_INF => Value::Num(Num::infinity(false)),
            TAG_ZERO => Value::Integer(0),
            TAG_NEG => {
                r.extra = true;
                let n = decode_numeric(&mut r, true)?;
                r.extra = false;
                collapse_numeric(n)
            }
            TAG_POS => collapse_numeric(decode_numeric(&mut r, false)?),
            TAG_TEXT => {
                let bytes = read_escaped(&mut r)?;
                match String::from_utf8(bytes) {
                    Ok(s) => Value::Text(Text::from(s)),
                    Err(_) => bail_corrupt_error!("key text is not UTF-8"),
                }
            }
            TAG_BLOB => Value::Blob(read_escaped(&mut r)?.into()),
            other => bail_corrupt_error!("unknown key tag {other:#04x}"),
        };
        out.push(v);
    }
    Ok(out)
}

/// Keys erase the Integer/Num split, so exact in-range integers come back
/// in integer form, everything else as Num.
fn collapse_numeric(n: Num) -> Value {
    let (v, lossy) = n.to_i64();
    if lossy {
        Value::Num(n)
    } else {
        Value::Integer(v)
    }
}

fn decode_numeric(r: &mut KeyReader<'_>, negative: bool) -> Result<Num> {
    let hi = r.next()?;
    let lo = r.next()?;
    let adj = u16::from_be_bytes([hi, lo]) as i32 - EXP_BIAS;
    let mut m: u128 = 0;
    let mut nd: i32 = 0;
    loop {
        let b = r.next()?;
        if b == 0x00 {
            break;
        }
        if b % 2 == 0 || (b - 1) / 2 > 99 || nd >= 20 {
            bail_corrupt_error!("malformed key mantissa");
        }
        let pair = (b - 1) / 2;
        m = m * 100 + pair as u128;
        nd += 2;
    }
    if nd == 0 || m == 0 {
        bail_corrupt_error!("malformed key mantissa");
    }
    // an odd digit count is padded with one zero at encode time
    if m % 10 == 0 {
        m /= 10;
        nd -= 1;
    }
    if m > u64::MAX as u128 {
        bail_corrupt_error!("malformed key mantissa");
    }
    let e = adj - (nd - 1);
    if e < i16::MIN as i32 || e >= i16::MAX as i32 {
        bail_corrupt_error!("key exponent out of range");
    }
    Ok(Num::from_parts(negative, false, e as i16, m as u64))
}

fn read_escaped(r: &mut KeyReader<'_>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = r.next()?;
        if b != 0x00 {
            out.push(b);
            continue;
        }
        match r.next()? {
            0x00 => return Ok(out),
            0xFF => out.push(0x00),
            _ => bail_corrupt_error!("malformed key escape"),
        }
    }
}

// Record format: varint column count, then per column a type code and a
// varint body length, then the bodies back to back. The split header lets
// a single column be decoded by walking lengths without touching the other
// bodies.
const REC_NULL: u8 = 0;
const REC_INT: u8 = 1;
const REC_NUM: u8 = 2;
const REC_TEXT: u8 = 3;
const REC_BLOB: u8 = 4;

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v: u64 = 0;
    for shift in 0..10 {
        let Some(&b) = buf.get(*pos) else {
            bail_corrupt_error!("truncated varint");
        };
        *pos += 1;
        if shift == 9 && b > 1 {
            bail_corrupt_error!("varint overflows 64 bits");
        }
        v |= ((b & 0x7F) as u64) << (7 * shift);
        if b & 0x80 == 0 {
            return Ok(v);
        }
    }
    bail_corrupt_error!("varint too long");
}

fn zigzag(v: i64) -> u64 {
    (v.wrapping_shl(1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn encode_record(values: &[Value]) -> Result<Vec<u8>> {
    let mut header = Vec::new();
    let mut body = Vec::new();
    write_varint(&mut header, values.len() as u64);
    for v in values {
        let start = body.len();
        let code = match v {
            Value::Null => REC_NULL,
            Value::Integer(x) => {
                write_varint(&mut body, zigzag(*x));
                REC_INT
            }
            Value::Num(n) => {
                let (sign, approx, e, m) = n.into_parts();
                body.push(sign as u8 | (approx as u8) << 1);
                write_varint(&mut body, zigzag(e as i64));
                write_varint(&mut body, m);
                REC_NUM
            }
            Value::Text(t) => {
                body.extend_from_slice(t.value.as_slice());
                REC_TEXT
            }
            Value::Blob(b) => {
                body.extend_from_slice(b.as_slice());
                REC_BLOB
            }
        };
        header.push(code);
        write_varint(&mut header, (body.len() - start) as u64);
    }
    if header.len() + body.len() > MAX_LENGTH {
        return Err(BasaltError::TooBig);
    }
    header.extend_from_slice(&body);
    Ok(header)
}

/// Decode one column of a record. Indexes past the stored column count
/// read as Null, which is how short rows widen under schema growth.
pub fn decode_record_column(buf: &[u8], idx: usize) -> Result<Value> {
    let mut pos = 0;
    let n = read_varint(buf, &mut pos)? as usize;
    if idx >= n {
        return Ok(Value::Null);
    }
    let mut offset = 0usize;
    let mut found: Option<(u8, usize, usize)> = None;
    for i in 0..n {
        let Some(&code) = buf.get(pos) else {
            bail_corrupt_error!("truncated record header");
        };
        pos += 1;
        let len = read_varint(buf, &mut pos)? as usize;
        if i == idx {
            found = Some((code, offset, len));
        }
        offset += len;
    }
    let Some((code, rel, len)) = found else {
        bail_corrupt_error!("record header shorter than declared");
    };
    let start = pos + rel;
    let Some(bytes) = buf.get(start..start + len) else {
        bail_corrupt_error!("truncated record body");
    };
    decode_record_value(code, bytes)
}

pub fn decode_record(buf: &[u8]) -> Result<Vec<Value>> {
    let mut pos = 0;
    let n = read_varint(buf, &mut pos)? as usize;
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let Some(&code) = buf.get(pos) else {
            bail_corrupt_error!("truncated record header");
        };
        pos += 1;
        let len = read_varint(buf, &mut pos)? as usize;
        entries.push((code, len));
    }
    let mut out = Vec::with_capacity(n);
    for (code, len) in entries {
        let Some(bytes) = buf.get(pos..pos + len) else {
            bail_corrupt_error!("truncated record body");
        };
        pos += len;
        out.push(decode_record_value(code, bytes)?);
    }
    Ok(out)
}

fn decode_record_value(code: u8, body: &[u8]) -> Result<Value> {
    match code {
        REC_NULL => {
            if !body.is_empty() {
                bail_corrupt_error!("null column with payload");
            }
            Ok(Value::Null)
        }
        REC_INT => {
            let mut pos = 0;
            let v = unzigzag(read_varint(body, &mut pos)?);
            if pos != body.len() {
                bail_corrupt_error!("integer column length mismatch");
            }
            Ok(Value::Integer(v))
        }
        REC_NUM => {
            let Some(&flags) = body.first() else {
                bail_corrupt_error!("empty numeric column");
            };
            let mut pos = 1;
            let e = unzigzag(read_varint(body, &mut pos)?);
            let m = read_varint(body, &mut pos)?;
            if pos != body.len() || e < i16::MIN as i64 || e > i16::MAX as i64 {
                bail_corrupt_error!("malformed numeric column");
            }
            Ok(Value::Num(Num::from_parts(
                flags & 1 != 0,
                flags & 2 != 0,
                e as i16,
                m,
            )))
        }
        REC_TEXT => match String::from_utf8(body.to_vec()) {
            Ok(s) => Ok(Value::Text(Text::from(s))),
            Err(_) => bail_corrupt_error!("record text is not UTF-8"),
        },
        REC_BLOB => Ok(Value::Blob(body.to_vec().into())),
        other => bail_corrupt_error!("unknown record type code {other}"),
    }
}
