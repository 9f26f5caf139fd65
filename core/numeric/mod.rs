use std::cmp::Ordering;
use std::fmt;

use bitflags::bitflags;

use crate::types::TextEncoding;

/// Largest scientific exponent of a finite value. Covers the IEEE double
/// range so doubles convert without inventing magnitudes the rest of the
/// engine cannot reproduce. Normalization turns anything above it into
/// infinity and anything below the negated bound into signed zero.
pub const MAX_ADJ_EXP: i32 = 308;

/// Exponent marker shared by NaN (`m == 0`) and infinity (`m != 0`).
const EXP_SPECIAL: i16 = i16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseFlags(u8);

bitflags! {
    impl ParseFlags: u8 {
        /// Accept a leading numeric prefix instead of requiring the whole
        /// input to match.
        const PREFIX_ONLY = 0b01;
        /// Skip leading and trailing ASCII whitespace.
        const IGNORE_WHITESPACE = 0b10;
    }
}

/// Decimal number `(-1)^sign * m * 10^e` with an exactness marker.
///
/// `approx` is set whenever a value has been rounded: arithmetic that ran
/// out of mantissa, overlong literals, or conversion from a non-integral
/// double. NaN and the infinities are distinguished approximate values and
/// compare as incomparable (NaN) or beyond every finite value (infinity).
#[derive(Debug, Clone, Copy)]
pub struct Num {
    sign: bool,
    approx: bool,
    e: i16,
    m: u64,
}

impl Default for Num {
    fn default() -> Self {
        Num::zero()
    }
}

/// Unnormalized intermediate produced by the arithmetic cores and collapsed
/// into a `Num` by `pack`.
struct Wide {
    sign: bool,
    approx: bool,
    e: i32,
    m: u128,
}

fn digits_of(m: u64) -> u32 {
    if m == 0 {
        1
    } else {
        m.ilog10() + 1
    }
}

fn pow10_u64(n: u32) -> u64 {
    10u64.pow(n)
}

fn pow10_u128(n: u32) -> u128 {
    10u128.pow(n)
}

/// Round the mantissa into u64 range (half-up on the first dropped digit),
/// strip trailing zeros, and clamp the scientific exponent into the finite
/// domain.
fn pack(w: Wide) -> Num {
    let Wide {
        sign,
        mut approx,
        mut e,
        mut m,
    } = w;
    if m == 0 {
        return Num {
            sign,
            approx,
            e: 0,
            m: 0,
        };
    }
    let mut round_up = false;
    while m > u64::MAX as u128 {
        let d = (m % 10) as u8;
        if d != 0 {
            approx = true;
        }
        round_up = d >= 5;
        m /= 10;
        e += 1;
    }
    let mut m = m as u64;
    if round_up {
        match m.checked_add(1) {
            Some(n) => m = n,
            None => {
                m = u64::MAX / 10 + 1;
                e += 1;
            }
        }
    }
    while m % 10 == 0 {
        m /= 10;
        e += 1;
    }
    let adj = e + digits_of(m) as i32 - 1;
    if adj > MAX_ADJ_EXP {
        return Num::infinity(sign);
    }
    if adj < -MAX_ADJ_EXP {
        return Num {
            sign,
            approx: true,
            e: 0,
            m: 0,
        };
    }
    Num {
        sign,
        approx,
        e: e as i16,
        m,
    }
}

impl Num {
    pub const fn nan() -> Self {
        Num {
            sign: false,
            approx: true,
            e: EXP_SPECIAL,
            m: 0,
        }
    }

    pub const fn infinity(negative: bool) -> Self {
        Num {
            sign: negative,
            approx: true,
            e: EXP_SPECIAL,
            m: 1,
        }
    }

    pub const fn zero() -> Self {
        Num {
            sign: false,
            approx: false,
            e: 0,
            m: 0,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Num {
            sign: v < 0,
            approx: false,
            e: 0,
            m: v.unsigned_abs(),
        }
    }

    pub fn from_u64(v: u64) -> Self {
        Num {
            sign: false,
            approx: false,
            e: 0,
            m: v,
        }
    }

    /// Rebuild from the 4-tuple wire form. Finite inputs are normalized the
    /// same way arithmetic results are; `e == i16::MAX` selects NaN or
    /// infinity.
    pub fn from_parts(sign: bool, approx: bool, e: i16, m: u64) -> Self {
        if e == EXP_SPECIAL {
            return if m == 0 { Num::nan() } else { Num::infinity(sign) };
        }
        pack(Wide {
            sign,
            approx,
            e: e as i32,
            m: m as u128,
        })
    }

    pub fn into_parts(self) -> (bool, bool, i16, u64) {
        (self.sign, self.approx, self.e, self.m)
    }

    pub fn is_nan(&self) -> bool {
        self.e == EXP_SPECIAL && self.m == 0
    }

    pub fn is_inf(&self) -> bool {
        self.e == EXP_SPECIAL && self.m != 0
    }

    fn is_special(&self) -> bool {
        self.e == EXP_SPECIAL
    }

    pub fn is_zero(&self) -> bool {
        !self.is_special() && self.m == 0
    }

    pub fn is_negative(&self) -> bool {
        self.sign
    }

    pub fn is_approx(&self) -> bool {
        self.approx
    }

    /// True for values with no fractional part. Mantissas are stored with
    /// trailing zeros stripped, so a negative exponent always means real
    /// fractional digits.
    pub fn is_integer(&self) -> bool {
        !self.is_special() && (self.m == 0 || self.e >= 0)
    }

    pub(crate) fn exponent(&self) -> i16 {
        self.e
    }

    pub(crate) fn mantissa(&self) -> u64 {
        self.m
    }

    /// Whole-string parse with whitespace tolerance, the form affinity
    /// coercion uses.
    pub fn from_text(text: &str) -> (Num, bool) {
        Num::parse(
            text.as_bytes(),
            TextEncoding::Utf8,
            ParseFlags::IGNORE_WHITESPACE,
        )
    }

    /// Parse decimal text. The second return is true when the input carried
    /// a decimal point or exponent marker (a "real" literal). Invalid or
    /// empty input yields NaN with `false`.
    pub fn parse(input: &[u8], enc: TextEncoding, flags: ParseFlags) -> (Num, bool) {
        let mut p = Units::new(input, enc);
        if flags.contains(ParseFlags::IGNORE_WHITESPACE) {
            skip_whitespace(&mut p);
        }
        let mut sign = false;
        match p.peek() {
            Unit::Char(b'-') => {
                sign = true;
                p.bump();
            }
            Unit::Char(b'+') => {
                p.bump();
            }
            _ => {}
        }

        if p.eat_ascii_ci("inf") {
            let _ = p.eat_ascii_ci("inity");
            if flags.contains(ParseFlags::IGNORE_WHITESPACE) {
                skip_whitespace(&mut p);
            }
            if !flags.contains(ParseFlags::PREFIX_ONLY) && !p.at_end() {
                return (Num::nan(), false);
            }
            return (Num::infinity(sign), true);
        }

        let mut m: u64 = 0;
        let mut e: i32 = 0;
        let mut approx = false;
        let mut seen_digit = false;
        let mut dropped = false;
        let mut is_real = false;

        while let Unit::Char(c @ b'0'..=b'9') = p.peek() {
            let d = (c - b'0') as u64;
            seen_digit = true;
            if m <= (u64::MAX - d) / 10 {
                m = m * 10 + d;
            } else {
                if !dropped {
                    dropped = true;
                    if d >= 5 {
                        m = round_up_mantissa(m, &mut e);
                    }
                }
                if d != 0 {
                    approx = true;
                }
                e += 1;
            }
            p.bump();
        }

        if let Unit::Char(b'.') = p.peek() {
            is_real = true;
            p.bump();
            while let Unit::Char(c @ b'0'..=b'9') = p.peek() {
                let d = (c - b'0') as u64;
                seen_digit = true;
                if m <= (u64::MAX - d) / 10 {
                    m = m * 10 + d;
                    e -= 1;
                } else {
                    if !dropped {
                        dropped = true;
                        if d >= 5 {
                            m = round_up_mantissa(m, &mut e);
                        }
                    }
                    if d != 0 {
                        approx = true;
                    }
                }
                p.bump();
            }
        }

        if seen_digit {
            if let Unit::Char(b'e' | b'E') = p.peek() {
                let mark = p.save();
                p.bump();
                let mut esign = 1i32;
                match p.peek() {
                    Unit::Char(b'-') => {
                        esign = -1;
                        p.bump();
                    }
                    Unit::Char(b'+') => {
                        p.bump();
                    }
                    _ => {}
                }
                let mut exp: i32 = 0;
                let mut exp_digits = false;
                while let Unit::Char(c @ b'0'..=b'9') = p.peek() {
                    exp_digits = true;
                    if exp < 10_000 {
                        exp = exp * 10 + (c - b'0') as i32;
                    }
                    p.bump();
                }
                if exp_digits {
                    is_real = true;
                    e = e.saturating_add(esign * exp);
                } else {
                    // "1e" and friends: the marker was not an exponent
                    p.restore(mark);
                }
            }
        }

        if flags.contains(ParseFlags::IGNORE_WHITESPACE) {
            skip_whitespace(&mut p);
        }
        if !seen_digit || (!flags.contains(ParseFlags::PREFIX_ONLY) && !p.at_end()) {
            return (Num::nan(), false);
        }
        let n = pack(Wide {
            sign,
            approx,
            e,
            m: m as u128,
        });
        (n, is_real)
    }

    /// Truncate toward zero and clamp to i64 range. `lossy` is true when the
    /// value was approximate, fractional, or clamped.
    pub fn to_i64(&self) -> (i64, bool) {
        if self.is_nan() {
            return (0, true);
        }
        if self.is_inf() {
            return (if self.sign { i64::MIN } else { i64::MAX }, true);
        }
        let mut lossy = self.approx;
        let mag: u128 = if self.e >= 0 {
            let shift = self.e as u32;
            if self.m == 0 {
                0
            } else if shift + digits_of(self.m) > 39 {
                u128::MAX
            } else {
                (self.m as u128)
                    .checked_mul(pow10_u128(shift))
                    .unwrap_or(u128::MAX)
            }
        } else {
            let shift = self.e.unsigned_abs() as u32;
            if shift >= 20 {
                if self.m != 0 {
                    lossy = true;
                }
                0
            } else {
                let div = pow10_u64(shift);
                let q = self.m / div;
                if self.m % div != 0 {
                    lossy = true;
                }
                q as u128
            }
        };
        if self.sign {
            if mag > 1u128 << 63 {
                (i64::MIN, true)
            } else if mag == 1u128 << 63 {
                (i64::MIN, lossy)
            } else {
                (-(mag as i64), lossy)
            }
        } else if mag > i64::MAX as u128 {
            (i64::MAX, true)
        } else {
            (mag as i64, lossy)
        }
    }

    pub fn to_i32(&self) -> (i32, bool) {
        let (v, lossy) = self.to_i64();
        if v > i32::MAX as i64 {
            (i32::MAX, true)
        } else if v < i32::MIN as i64 {
            (i32::MIN, true)
        } else {
            (v as i32, lossy)
        }
    }

    pub fn to_f64(&self) -> f64 {
        if self.is_nan() {
            return f64::NAN;
        }
        if self.is_inf() {
            return if self.sign {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            };
        }
        // Rust's float parser is correctly rounded, which this would not be
        // if written as mantissa * 10^e in double arithmetic.
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// Exact decimal reconstruction of the binary value where it fits the
    /// mantissa; otherwise nearest. Non-integral doubles are always marked
    /// approximate even when their decimal expansion fits exactly.
    pub fn from_f64(r: f64) -> Self {
        if r.is_nan() {
            return Num::nan();
        }
        if r.is_infinite() {
            return Num::infinity(r < 0.0);
        }
        if r == 0.0 {
            return Num {
                sign: r.is_sign_negative(),
                approx: false,
                e: 0,
                m: 0,
            };
        }
        let sign = r < 0.0;
        let mut approx = r.fract() != 0.0;
        let bits = r.abs().to_bits();
        let biased = ((bits >> 52) & 0x7ff) as i32;
        let frac = bits & ((1u64 << 52) - 1);
        let (mut m, mut e2) = if biased == 0 {
            (frac, -1074)
        } else {
            (frac | (1u64 << 52), biased - 1075)
        };
        let mut e10 = 0i32;
        while e2 > 0 {
            if m > u64::MAX / 2 {
                let d = m % 10;
                if d != 0 {
                    approx = true;
                }
                m /= 10;
                if d >= 5 {
                    m += 1;
                }
                e10 += 1;
            } else {
                m <<= 1;
                e2 -= 1;
            }
        }
        while e2 < 0 {
            if m > u64::MAX / 5 {
                if m & 1 != 0 {
                    approx = true;
                }
                m >>= 1;
            } else {
                m *= 5;
                e10 -= 1;
            }
            e2 += 1;
        }
        pack(Wide {
            sign,
            approx,
            e: e10,
            m: m as u128,
        })
    }

    pub fn negate(self) -> Num {
        if self.is_nan() {
            return self;
        }
        let mut r = self;
        r.sign = !r.sign;
        r
    }

    /// Drop any fractional digits, toward zero.
    pub(crate) fn trunc(self) -> Num {
        if self.is_special() || self.e >= 0 || self.m == 0 {
            return self;
        }
        let shift = self.e.unsigned_abs() as u32;
        if shift >= 20 {
            return Num {
                sign: self.sign,
                approx: self.approx,
                e: 0,
                m: 0,
            };
        }
        Num {
            sign: self.sign,
            approx: self.approx,
            e: 0,
            m: self.m / pow10_u64(shift),
        }
    }

    /// Comparison by mathematical value, independent of representation.
    /// Any NaN operand is incomparable.
    pub fn compare(a: Num, b: Num) -> Option<Ordering> {
        if a.is_nan() || b.is_nan() {
            return None;
        }
        match (a.is_inf(), b.is_inf()) {
            (true, true) => {
                return Some(match (a.sign, b.sign) {
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    _ => Ordering::Equal,
                });
            }
            (true, false) => {
                return Some(if a.sign { Ordering::Less } else { Ordering::Greater });
            }
            (false, true) => {
                return Some(if b.sign { Ordering::Greater } else { Ordering::Less });
            }
            (false, false) => {}
        }
        match (a.m == 0, b.m == 0) {
            (true, true) => return Some(Ordering::Equal),
            (true, false) => {
                return Some(if b.sign { Ordering::Greater } else { Ordering::Less });
            }
            (false, true) => {
                return Some(if a.sign { Ordering::Less } else { Ordering::Greater });
            }
            (false, false) => {}
        }
        match (a.sign, b.sign) {
            (true, false) => return Some(Ordering::Less),
            (false, true) => return Some(Ordering::Greater),
            _ => {}
        }
        let ord = cmp_magnitude(&a, &b);
        Some(if a.sign { ord.reverse() } else { ord })
    }
}

fn cmp_magnitude(a: &Num, b: &Num) -> Ordering {
    let da = digits_of(a.m);
    let db = digits_of(b.m);
    let adj_a = a.e as i32 + da as i32;
    let adj_b = b.e as i32 + db as i32;
    match adj_a.cmp(&adj_b) {
        Ordering::Equal => {}
        ord => return ord,
    }
    // align both mantissas to 20 digits; u64 mantissas never exceed that
    let ma = a.m as u128 * pow10_u128(20 - da);
    let mb = b.m as u128 * pow10_u128(20 - db);
    ma.cmp(&mb)
}

fn round_up_mantissa(m: u64, e: &mut i32) -> u64 {
    match m.checked_add(1) {
        Some(n) => n,
        None => {
            *e += 1;
            u64::MAX / 10 + 1
        }
    }
}

fn add_nums(a: Num, b: Num) -> Num {
    if a.is_nan() || b.is_nan() {
        return Num::nan();
    }
    match (a.is_inf(), b.is_inf()) {
        (true, true) => {
            return if a.sign == b.sign { a } else { Num::nan() };
        }
        (true, false) => return a,
        (false, true) => return b,
        (false, false) => {}
    }
    if a.m == 0 {
        let mut r = b;
        r.approx |= a.approx;
        if b.m == 0 {
            r.sign = a.sign && b.sign;
        }
        return r;
    }
    if b.m == 0 {
        let mut r = a;
        r.approx |= b.approx;
        return r;
    }
    let (hi, lo) = if a.e >= b.e { (a, b) } else { (b, a) };
    let mut hm = hi.m as u128;
    let mut he = hi.e as i32;
    let le = lo.e as i32;
    // widen the larger-exponent mantissa toward the smaller exponent; the
    // /20 bound leaves headroom for the addend
    while he > le && hm <= u128::MAX / 20 {
        hm *= 10;
        he -= 1;
    }
    let mut lm = lo.m as u128;
    let mut approx = a.approx || b.approx;
    if he > le {
        let mut diff = he - le;
        let mut round = false;
        while diff > 0 && lm > 0 {
            let d = lm % 10;
            if d != 0 {
                approx = true;
            }
            round = d >= 5;
            lm /= 10;
            diff -= 1;
        }
        if round {
            lm += 1;
        }
        if lm == 0 && lo.m != 0 {
            approx = true;
        }
    }
    let (sign, m) = if hi.sign == lo.sign {
        (hi.sign, hm + lm)
    } else {
        match hm.cmp(&lm) {
            Ordering::Equal => (false, 0),
            Ordering::Greater => (hi.sign, hm - lm),
            Ordering::Less => (lo.sign, lm - hm),
        }
    };
    pack(Wide {
        sign,
        approx,
        e: he,
        m,
    })
}

fn mul_nums(a: Num, b: Num) -> Num {
    if a.is_nan() || b.is_nan() {
        return Num::nan();
    }
    let sign = a.sign != b.sign;
    match (a.is_inf(), b.is_inf()) {
        (true, true) => return Num::infinity(sign),
        (true, false) => {
            return if b.m == 0 {
                Num::nan()
            } else {
                Num::infinity(sign)
            };
        }
        (false, true) => {
            return if a.m == 0 {
                Num::nan()
            } else {
                Num::infinity(sign)
            };
        }
        (false, false) => {}
    }
    pack(Wide {
        sign,
        approx: a.approx || b.approx,
        e: a.e as i32 + b.e as i32,
        m: a.m as u128 * b.m as u128,
    })
}

fn div_nums(a: Num, b: Num) -> Num {
    if a.is_nan() || b.is_nan() {
        return Num::nan();
    }
    let sign = a.sign != b.sign;
    match (a.is_inf(), b.is_inf()) {
        (true, true) => return Num::nan(),
        (true, false) => return Num::infinity(sign),
        (false, true) => {
            return Num {
                sign,
                approx: true,
                e: 0,
                m: 0,
            };
        }
        (false, false) => {}
    }
    if b.m == 0 {
        return if a.m == 0 {
            Num::nan()
        } else {
            Num::infinity(sign)
        };
    }
    if a.m == 0 {
        return Num {
            sign,
            approx: a.approx || b.approx,
            e: 0,
            m: 0,
        };
    }
    let mut m = a.m as u128;
    let mut shift = 0i32;
    while m <= u128::MAX / 10 {
        m *= 10;
        shift += 1;
    }
    let d = b.m as u128;
    let mut q = m / d;
    let r = m % d;
    let mut approx = a.approx || b.approx;
    if r != 0 {
        approx = true;
        if r * 2 >= d {
            q += 1;
        }
    }
    pack(Wide {
        sign,
        approx,
        e: a.e as i32 - b.e as i32 - shift,
        m: q,
    })
}

fn rem_nums(a: Num, b: Num) -> Num {
    if a.is_nan() || b.is_nan() || a.is_inf() || b.is_zero() {
        return Num::nan();
    }
    if b.is_inf() {
        return a;
    }
    if !a.approx && !b.approx {
        return rem_exact(a, b);
    }
    let q = div_nums(a, b).trunc();
    add_nums(a, mul_nums(q, b).negate())
}

/// Remainder of two exact values by modular arithmetic on the decimal
/// mantissas. Never rounds, so the result stays exact.
fn rem_exact(a: Num, b: Num) -> Num {
    let delta = a.e as i32 - b.e as i32;
    let (e, rm) = if delta < 0 {
        // scale |b| to a's exponent; once it needs more than 38 digits it
        // exceeds any u64 mantissa and the remainder is a itself
        let shift = delta.unsigned_abs();
        if shift > 38 {
            return a;
        }
        let Some(bm) = (b.m as u128).checked_mul(pow10_u128(shift)) else {
            return a;
        };
        (a.e as i32, a.m as u128 % bm)
    } else {
        let bm = b.m as u128;
        let mut rm = a.m as u128 % bm;
        for _ in 0..delta {
            rm = rm * 10 % bm;
        }
        (b.e as i32, rm)
    };
    pack(Wide {
        sign: a.sign,
        approx: false,
        e,
        m: rm,
    })
}

impl std::ops::Add for Num {
    type Output = Num;
    fn add(self, rhs: Num) -> Num {
        add_nums(self, rhs)
    }
}

impl std::ops::Sub for Num {
    type Output = Num;
    fn sub(self, rhs: Num) -> Num {
        add_nums(self, rhs.negate())
    }
}

impl std::ops::Mul for Num {
    type Output = Num;
    fn mul(self, rhs: Num) -> Num {
        mul_nums(self, rhs)
    }
}

impl std::ops::Div for Num {
    type Output = Num;
    fn div(self, rhs: Num) -> Num {
        div_nums(self, rhs)
    }
}

impl std::ops::Rem for Num {
    type Output = Num;
    fn rem(self, rhs: Num) -> Num {
        rem_nums(self, rhs)
    }
}

impl std::ops::Neg for Num {
    type Output = Num;
    fn neg(self) -> Num {
        self.negate()
    }
}

impl PartialEq for Num {
    fn eq(&self, other: &Self) -> bool {
        matches!(Num::compare(*self, *other), Some(Ordering::Equal))
    }
}

impl PartialOrd for Num {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Num::compare(*self, *other)
    }
}

impl From<i64> for Num {
    fn from(v: i64) -> Self {
        Num::from_i64(v)
    }
}

impl From<f64> for Num {
    fn from(v: f64) -> Self {
        Num::from_f64(v)
    }
}

impl fmt::Display for Num {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nan() {
            return f.write_str("NaN");
        }
        if self.is_inf() {
            return f.write_str(if self.sign { "-Inf" } else { "Inf" });
        }
        if self.m == 0 {
            return f.write_str("0");
        }
        let mut n = *self;
        while n.m % 10 == 0 {
            n.m /= 10;
            n.e += 1;
        }
        let digits = n.m.to_string();
        let nd = digits.len() as i32;
        let adj = n.e as i32 + nd - 1;
        let mut out = String::new();
        if n.sign {
            out.push('-');
        }
        // e == 0 means every rendered digit is significant, so plain
        // notation is already minimal no matter how many there are
        if n.e >= 0 && (n.e == 0 || adj <= 14) {
            out.push_str(&digits);
            for _ in 0..n.e {
                out.push('0');
            }
        } else if n.e < 0 && (-4..=14).contains(&adj) {
            if adj >= 0 {
                let point = (adj + 1) as usize;
                out.push_str(&digits[..point]);
                out.push('.');
                out.push_str(&digits[point..]);
            } else {
                out.push_str("0.");
                for _ in 0..(-adj - 1) {
                    out.push('0');
                }
                out.push_str(&digits);
            }
        } else {
            out.push_str(&digits[..1]);
            if nd > 1 {
                out.push('.');
                out.push_str(&digits[1..]);
            }
            out.push('e');
            if adj >= 0 {
                out.push('+');
            }
            out.push_str(&adj.to_string());
        }
        f.write_str(&out)
    }
}

#[derive(Clone, Copy)]
enum Unit {
    Char(u8),
    NonAscii,
    End,
}

/// ASCII view over 8-bit or 16-bit input. Non-ASCII units terminate a
/// number the same way any other invalid character does.
struct Units<'a> {
    bytes: &'a [u8],
    pos: usize,
    enc: TextEncoding,
}

impl<'a> Units<'a> {
    fn new(bytes: &'a [u8], enc: TextEncoding) -> Self {
        Units { bytes, pos: 0, enc }
    }

    fn peek(&self) -> Unit {
        match self.enc {
            TextEncoding::Utf8 => match self.bytes.get(self.pos) {
                None => Unit::End,
                Some(&b) if b.is_ascii() => Unit::Char(b),
                Some(_) => Unit::NonAscii,
            },
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                if self.pos >= self.bytes.len() {
                    return Unit::End;
                }
                if self.pos + 1 >= self.bytes.len() {
                    // lone trailing byte
                    return Unit::NonAscii;
                }
                let (lo, hi) = if self.enc == TextEncoding::Utf16Le {
                    (self.bytes[self.pos], self.bytes[self.pos + 1])
                } else {
                    (self.bytes[self.pos + 1], self.bytes[self.pos])
                };
                if hi == 0 && lo.is_ascii() {
                    Unit::Char(lo)
                } else {
                    Unit::NonAscii
                }
            }
        }
    }

    fn bump(&mut self) {
        self.pos += match self.enc {
            TextEncoding::Utf8 => 1,
            _ => 2,
        };
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Unit::End)
    }

    fn save(&self) -> usize {
        self.pos
    }

    fn restore(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn eat_ascii_ci(&mut self, word: &str) -> bool {
        let save = self.pos;
        for w in word.bytes() {
            match self.peek() {
                Unit::Char(c) if c.eq_ignore_ascii_case(&w) => self.bump(),
                _ => {
                    self.pos = save;
                    return false;
                }
            }
        }
        true
    }
}

fn skip_whitespace(p: &mut Units<'_>) {
    while let Unit::Char(c) = p.peek() {
        if !(c.is_ascii_whitespace() || c == 0x0b) {
            break;
        }
        p.bump();
    }
}
