use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collate::CollationDef;
use crate::error::BasaltError;
use crate::numeric::Num;
use crate::types::Value;
use crate::Result;

pub type ScalarFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;
pub type AggStepFn = Arc<dyn Fn(&mut Value, &[Value]) -> Result<()> + Send + Sync>;
pub type AggFinalizeFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Custom {
        step: AggStepFn,
        finalize: AggFinalizeFn,
    },
}

impl fmt::Debug for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggKind::Count => "Count",
            AggKind::Sum => "Sum",
            AggKind::Avg => "Avg",
            AggKind::Min => "Min",
            AggKind::Max => "Max",
            AggKind::Custom { .. } => "Custom",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub enum FuncKind {
    Scalar(ScalarFn),
    Aggregate(AggKind),
}

/// A callable registered with the store. `n_args == -1` accepts any arity;
/// lookup prefers an exact-arity registration over the varargs one, which
/// is how `max(x)` dispatches to the aggregate while `max(x, y)` reaches
/// the scalar.
#[derive(Clone)]
pub struct FuncDef {
    pub name: String,
    pub n_args: i32,
    pub kind: FuncKind,
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            FuncKind::Scalar(_) => "scalar",
            FuncKind::Aggregate(_) => "aggregate",
        };
        write!(f, "{}/{} ({kind})", self.name, self.n_args)
    }
}

impl FuncDef {
    pub fn scalar(name: impl Into<String>, n_args: i32, f: ScalarFn) -> Self {
        FuncDef {
            name: name.into(),
            n_args,
            kind: FuncKind::Scalar(f),
        }
    }

    pub fn aggregate(name: impl Into<String>, n_args: i32, kind: AggKind) -> Self {
        FuncDef {
            name: name.into(),
            n_args,
            kind: FuncKind::Aggregate(kind),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, FuncKind::Aggregate(_))
    }
}

/// Name and arity to function map shared by every session. The lock covers
/// map operations only; callables run after the guard is dropped.
pub struct FunctionRegistry {
    defs: Mutex<HashMap<(String, i32), Arc<FuncDef>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry {
            defs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let reg = Self::new();
        for def in builtin_defs() {
            reg.register(def);
        }
        reg
    }

    pub fn register(&self, def: FuncDef) {
        let key = (def.name.to_ascii_lowercase(), def.n_args);
        self.defs.lock().insert(key, Arc::new(def));
    }

    pub fn unregister(&self, name: &str, n_args: i32) -> bool {
        self.defs
            .lock()
            .remove(&(name.to_ascii_lowercase(), n_args))
            .is_some()
    }

    pub fn lookup(&self, name: &str, argc: i32) -> Option<Arc<FuncDef>> {
        let defs = self.defs.lock();
        let lower = name.to_ascii_lowercase();
        defs.get(&(lower.clone(), argc))
            .or_else(|| defs.get(&(lower, -1)))
            .cloned()
    }

    pub fn resolve(&self, name: &str, argc: i32) -> Result<Arc<FuncDef>> {
        self.lookup(name, argc)
            .ok_or_else(|| BasaltError::ParseError(format!("no such function: {name}/{argc}")))
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[derive(Debug)]
enum AggAcc {
    Count(i64),
    Sum {
        sum: Num,
        seen: bool,
        all_int: bool,
    },
    Avg {
        sum: Num,
        count: i64,
    },
    MinMax(Option<Value>),
    Custom(Value),
}

/// In-flight aggregate accumulator. Lives inside the target register until
/// `AggFinal` collapses it to a plain value.
#[derive(Debug)]
pub struct AggState {
    pub def: Arc<FuncDef>,
    acc: AggAcc,
}

impl AggState {
    pub fn new(def: Arc<FuncDef>) -> Result<Self> {
        let FuncKind::Aggregate(kind) = &def.kind else {
            return Err(BasaltError::InternalError(format!(
                "{} is not an aggregate",
                def.name
            )));
        };
        let acc = match kind {
            AggKind::Count => AggAcc::Count(0),
            AggKind::Sum => AggAcc::Sum {
                sum: Num::zero(),
                seen: false,
                all_int: true,
            },
            AggKind::Avg => AggAcc::Avg {
                sum: Num::zero(),
                count: 0,
            },
            AggKind::Min | AggKind::Max => AggAcc::MinMax(None),
            AggKind::Custom { .. } => AggAcc::Custom(Value::Null),
        };
        Ok(AggState { def, acc })
    }

    pub fn step(&mut self, args: &[Value]) -> Result<()> {
        match &mut self.acc {
            AggAcc::Count(n) => {
                // zero-arg count counts rows, one-arg count skips NULLs
                if args.is_empty() || !matches!(args[0], Value::Null) {
                    *n += 1;
                }
            }
            AggAcc::Sum {
                sum,
                seen,
                all_int,
            } => {
                let Some(v) = args.first() else {
                    return Ok(());
                };
                if matches!(v, Value::Null) {
                    return Ok(());
                }
                *seen = true;
                if !matches!(v, Value::Integer(_)) {
                    *all_int = false;
                }
                *sum = *sum + v.coerce_num();
            }
            AggAcc::Avg { sum, count } => {
                let Some(v) = args.first() else {
                    return Ok(());
                };
                if matches!(v, Value::Null) {
                    return Ok(());
                }
                *count += 1;
                *sum = *sum + v.coerce_num();
            }
            AggAcc::MinMax(best) => {
                let Some(v) = args.first() else {
                    return Ok(());
                };
                if matches!(v, Value::Null) {
                    return Ok(());
                }
                let want = match self.def.kind {
                    FuncKind::Aggregate(AggKind::Min) => Ordering::Less,
                    _ => Ordering::Greater,
                };
                match best {
                    None => *best = Some(v.deep_clone()),
                    Some(cur) => {
                        if v.partial_cmp_with(cur, &CollationDef::binary()) == Some(want) {
                            *best = Some(v.deep_clone());
                        }
                    }
                }
            }
            AggAcc::Custom(acc) => {
                let FuncKind::Aggregate(AggKind::Custom { step, .. }) = &self.def.kind else {
                    unreachable!("acc shape checked at construction");
                };
                (**step)(acc, args)?;
            }
        }
        Ok(())
    }

    pub fn finalize(self) -> Result<Value> {
        match self.acc {
            AggAcc::Count(n) => Ok(Value::Integer(n)),
            AggAcc::Sum {
                sum,
                seen,
                all_int,
            } => {
                if !seen {
                    return Ok(Value::Null);
                }
                if all_int {
                    let (v, lossy) = sum.to_i64();
                    if lossy {
                        return Err(BasaltError::IntegerOverflow);
                    }
                    return Ok(Value::Integer(v));
                }
                Ok(Value::Num(sum))
            }
            AggAcc::Avg { sum, count } => {
                if count == 0 {
                    return Ok(Value::Null);
                }
                Ok(Value::Num(sum / Num::from_i64(count)))
            }
            AggAcc::MinMax(best) => Ok(best.unwrap_or(Value::Null)),
            AggAcc::Custom(acc) => {
                let FuncKind::Aggregate(AggKind::Custom { finalize, .. }) = &self.def.kind else {
                    unreachable!("acc shape checked at construction");
                };
                (**finalize)(acc)
            }
        }
    }
}

fn builtin_defs() -> Vec<FuncDef> {
    vec![
        FuncDef::scalar("abs", 1, Arc::new(scalar_abs)),
        FuncDef::scalar("coalesce", -1, Arc::new(scalar_coalesce)),
        FuncDef::scalar("length", 1, Arc::new(scalar_length)),
        FuncDef::scalar("lower", 1, Arc::new(scalar_lower)),
        FuncDef::scalar("upper", 1, Arc::new(scalar_upper)),
        FuncDef::scalar("max", -1, Arc::new(scalar_max)),
        FuncDef::scalar("min", -1, Arc::new(scalar_min)),
        FuncDef::scalar("nullif", 2, Arc::new(scalar_nullif)),
        FuncDef::scalar("round", 1, Arc::new(scalar_round)),
        FuncDef::scalar("round", 2, Arc::new(scalar_round)),
        FuncDef::scalar("substr", 2, Arc::new(scalar_substr)),
        FuncDef::scalar("substr", 3, Arc::new(scalar_substr)),
        FuncDef::scalar("typeof", 1, Arc::new(scalar_typeof)),
        FuncDef::aggregate("avg", 1, AggKind::Avg),
        FuncDef::aggregate("count", 0, AggKind::Count),
        FuncDef::aggregate("count", 1, AggKind::Count),
        FuncDef::aggregate("max", 1, AggKind::Max),
        FuncDef::aggregate("min", 1, AggKind::Min),
        FuncDef::aggregate("sum", 1, AggKind::Sum),
    ]
}

fn scalar_abs(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::Integer(x) => match i64::checked_abs(*x) {
            Some(y) => Ok(Value::Integer(y)),
            // abs(i64::MIN) has no integer representation
            None => Err(BasaltError::IntegerOverflow),
        },
        other => {
            let n = other.coerce_num();
            Ok(Value::Num(if n.is_negative() { n.negate() } else { n }))
        }
    }
}

fn scalar_coalesce(args: &[Value]) -> Result<Value> {
    for v in args {
        if !matches!(v, Value::Null) {
            return Ok(v.deep_clone());
        }
    }
    Ok(Value::Null)
}

fn scalar_length(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Null => Value::Null,
        Value::Text(t) => Value::Integer(t.as_str().chars().count() as i64),
        // numbers report the length of their text rendering
        v @ (Value::Integer(_) | Value::Num(_)) => {
            Value::Integer(v.to_string().chars().count() as i64)
        }
        Value::Blob(b) => Value::Integer(b.len() as i64),
    })
}

fn scalar_lower(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Text(t) => Value::build_text(t.as_str().to_lowercase()),
        v => v.deep_clone(),
    })
}

fn scalar_upper(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Text(t) => Value::build_text(t.as_str().to_uppercase()),
        v => v.deep_clone(),
    })
}

fn scalar_minmax(args: &[Value], want: Ordering) -> Result<Value> {
    let mut best: Option<&Value> = None;
    for v in args {
        if matches!(v, Value::Null) {
            return Ok(Value::Null);
        }
        match best {
            None => best = Some(v),
            Some(cur) => {
                if v.partial_cmp_with(cur, &CollationDef::binary()) == Some(want) {
                    best = Some(v);
                }
            }
        }
    }
    Ok(best.map(Value::deep_clone).unwrap_or(Value::Null))
}

fn scalar_max(args: &[Value]) -> Result<Value> {
    scalar_minmax(args, Ordering::Greater)
}

fn scalar_min(args: &[Value]) -> Result<Value> {
    scalar_minmax(args, Ordering::Less)
}

fn scalar_nullif(args: &[Value]) -> Result<Value> {
    let equal = args[0].partial_cmp_with(&args[1], &CollationDef::binary())
        == Some(Ordering::Equal);
    Ok(if equal {
        Value::Null
    } else {
        args[0].deep_clone()
    })
}

fn scalar_round(args: &[Value]) -> Result<Value> {
    if matches!(args[0], Value::Null) {
        return Ok(Value::Null);
    }
    let digits = match args.get(1) {
        None => 0,
        Some(Value::Null) => return Ok(Value::Null),
        Some(v) => v.coerce_i64(),
    };
    Ok(Value::Num(round_num(args[0].coerce_num(), digits)))
}

/// Round to `digits` fractional places, half away from zero.
fn round_num(n: Num, digits: i64) -> Num {
    if n.is_nan() || n.is_inf() {
        return n;
    }
    let (sign, approx, e, m) = n.into_parts();
    let target = -(digits.clamp(-30, 30) as i32);
    if m == 0 || e as i32 >= target {
        return n;
    }
    let k = (target - e as i32) as u32;
    if k >= 20 {
        return Num::from_parts(sign, approx, 0, 0);
    }
    let div = 10u64.pow(k);
    let mut q = m / div;
    if (m % div) as u128 * 2 >= div as u128 {
        q += 1;
    }
    Num::from_parts(sign, approx, target as i16, q)
}

fn scalar_substr(args: &[Value]) -> Result<Value> {
    if matches!(args[0], Value::Null) || matches!(args[1], Value::Null) {
        return Ok(Value::Null);
    }
    let has_len = args.len() > 2;
    if has_len && matches!(args[2], Value::Null) {
        return Ok(Value::Null);
    }
    let mut p1 = args[1].coerce_i64();
    let mut p2 = if has_len {
        args[2].coerce_i64()
    } else {
        i64::MAX / 2
    };

    enum Items {
        Chars(Vec<char>),
        Bytes(Vec<u8>),
    }
    let items = match &args[0] {
        Value::Blob(b) => Items::Bytes(b.to_vec()),
        v => Items::Chars(v.to_string().chars().collect()),
    };
    let n = match &items {
        Items::Chars(c) => c.len() as i64,
        Items::Bytes(b) => b.len() as i64,
    };

    // index arithmetic per the usual SQL substr contract: 1-based start,
    // negative start counts from the end, position zero donates one unit
    // of an explicit positive length, negative length takes the chars
    // preceding the start
    if p1 < 0 {
        p1 += n;
        if p1 < 0 {
            if has_len && p2 > 0 {
                p2 += p1;
            }
            p1 = 0;
        }
    } else if p1 > 0 {
        p1 -= 1;
    } else if has_len && p2 > 0 {
        p2 -= 1;
    }
    if p2 < 0 {
        p1 += p2;
        p2 = -p2;
        if p1 < 0 {
            p2 += p1;
            p1 = 0;
        }
    }
    let begin = p1.clamp(0, n) as usize;
    let end = p1.saturating_add(p2.max(0)).clamp(0, n) as usize;

    Ok(match items {
        Items::Chars(c) => Value::build_text(c[begin..end].iter().collect::<String>()),
        Items::Bytes(b) => Value::from_blob(b[begin..end].to_vec()),
    })
}

fn scalar_typeof(args: &[Value]) -> Result<Value> {
    Ok(Value::build_text(args[0].type_name().to_string()))
}
