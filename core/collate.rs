use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;

use crate::error::BasaltError;
use crate::Result;

/// **Pre defined collation sequences**\
/// Collating functions only matter when comparing string values.
/// Numeric values are always compared numerically, and BLOBs are always compared byte-by-byte using memcmp().
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString, Default,
)]
#[strum(ascii_case_insensitive)]
pub enum Collation {
    /// Standard String compare
    #[default]
    Binary,
    /// Ascii case insensitive
    NoCase,
    /// Same as Binary but with trimmed whitespace
    Rtrim,
}

impl Collation {
    pub fn new(collation: &str) -> Result<Self> {
        Collation::from_str(collation).map_err(|_| {
            BasaltError::ParseError(format!("no such collation sequence: {collation}"))
        })
    }

    pub fn compare_strings(&self, lhs: &str, rhs: &str) -> Ordering {
        tracing::event!(Level::DEBUG, collate = %self, lhs, rhs);
        match self {
            Collation::Binary => Self::binary_cmp(lhs, rhs),
            Collation::NoCase => Self::nocase_cmp(lhs, rhs),
            Collation::Rtrim => Self::rtrim_cmp(lhs, rhs),
        }
    }

    /// Bytewise image of a string under this collation: two strings compare
    /// with `compare_strings` exactly as their sort keys compare with memcmp.
    /// The key codec relies on this equivalence.
    pub fn sort_key<'a>(&self, s: &'a str) -> Cow<'a, str> {
        match self {
            Collation::Binary => Cow::Borrowed(s),
            Collation::NoCase => {
                if s.bytes().any(|b| b.is_ascii_uppercase()) {
                    Cow::Owned(s.to_ascii_lowercase())
                } else {
                    Cow::Borrowed(s)
                }
            }
            Collation::Rtrim => Cow::Borrowed(s.trim_end()),
        }
    }

    fn binary_cmp(lhs: &str, rhs: &str) -> Ordering {
        lhs.cmp(rhs)
    }

    fn nocase_cmp(lhs: &str, rhs: &str) -> Ordering {
        let nocase_lhs = uncased::UncasedStr::new(lhs);
        let nocase_rhs = uncased::UncasedStr::new(rhs);
        nocase_lhs.cmp(nocase_rhs)
    }

    fn rtrim_cmp(lhs: &str, rhs: &str) -> Ordering {
        lhs.trim_end().cmp(rhs.trim_end())
    }
}

type CollationFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

#[derive(Clone)]
enum CollationKind {
    Builtin(Collation),
    Custom(CollationFn),
}

/// A named collation, either one of the builtins or a user comparator.
/// Identity is the name.
#[derive(Clone)]
pub struct CollationDef {
    pub name: String,
    kind: CollationKind,
}

impl CollationDef {
    pub fn builtin(collation: Collation) -> Self {
        CollationDef {
            name: collation.to_string(),
            kind: CollationKind::Builtin(collation),
        }
    }

    /// The default collation, shared so hot paths don't rebuild it.
    pub fn binary() -> Arc<CollationDef> {
        static BINARY: std::sync::OnceLock<Arc<CollationDef>> = std::sync::OnceLock::new();
        BINARY
            .get_or_init(|| Arc::new(CollationDef::builtin(Collation::Binary)))
            .clone()
    }

    pub fn custom(name: impl Into<String>, cmp: CollationFn) -> Self {
        CollationDef {
            name: name.into(),
            kind: CollationKind::Custom(cmp),
        }
    }

    pub fn cmp_text(&self, lhs: &str, rhs: &str) -> Ordering {
        match &self.kind {
            CollationKind::Builtin(c) => c.compare_strings(lhs, rhs),
            CollationKind::Custom(f) => f(lhs, rhs),
        }
    }

    pub fn as_builtin(&self) -> Option<Collation> {
        match self.kind {
            CollationKind::Builtin(c) => Some(c),
            CollationKind::Custom(_) => None,
        }
    }

    /// Sort key for index encoding. A user comparator has no bytewise
    /// image, so custom collations cannot appear in encoded keys.
    pub fn sort_key<'a>(&self, s: &'a str) -> Result<Cow<'a, str>> {
        match &self.kind {
            CollationKind::Builtin(c) => Ok(c.sort_key(s)),
            CollationKind::Custom(_) => Err(BasaltError::Misuse(format!(
                "collation {} has no sort key and cannot be used in index keys",
                self.name
            ))),
        }
    }
}

impl fmt::Debug for CollationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CollationKind::Builtin(c) => write!(f, "CollationDef::Builtin({c})"),
            CollationKind::Custom(_) => write!(f, "CollationDef::Custom({})", self.name),
        }
    }
}

impl PartialEq for CollationDef {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

/// Name to collation map shared by every session of a store. The lock is
/// only held for the map operation itself, never while a comparator runs.
pub struct CollationRegistry {
    defs: Mutex<HashMap<String, Arc<CollationDef>>>,
}

impl CollationRegistry {
    pub fn new() -> Self {
        let mut defs = HashMap::new();
        for c in [Collation::Binary, Collation::NoCase, Collation::Rtrim] {
            let def = Arc::new(CollationDef::builtin(c));
            defs.insert(def.name.to_ascii_lowercase(), def);
        }
        CollationRegistry {
            defs: Mutex::new(defs),
        }
    }

    pub fn register(&self, def: CollationDef) {
        let mut defs = self.defs.lock();
        defs.insert(def.name.to_ascii_lowercase(), Arc::new(def));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<CollationDef>> {
        let defs = self.defs.lock();
        defs.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<CollationDef>> {
        self.lookup(name)
            .ok_or_else(|| BasaltError::ParseError(format!("no such collation sequence: {name}")))
    }
}

impl Default for CollationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
