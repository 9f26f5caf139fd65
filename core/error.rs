use thiserror::Error;

#[derive(Debug, Clone, Error, miette::Diagnostic)]
pub enum BasaltError {
    #[error("Corrupt key or record: {0}")]
    Corrupt(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Runtime error: {0}")]
    Constraint(String),
    #[error("Storage is busy")]
    Busy,
    #[error("Interrupted")]
    Interrupted,
    #[error("Error: Resource is read-only")]
    ReadOnly,
    #[error("Schema changed since program was built")]
    SchemaChanged,
    #[error("Value exceeds engine size limits")]
    TooBig,
    #[error("Out of range: {0}")]
    OutOfRange(String),
    #[error("API misuse: {0}")]
    Misuse(String),
    #[error("Transaction error: {0}")]
    TxError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument supplied: {0}")]
    InvalidArgument(String),
    #[error("Runtime error: integer overflow")]
    IntegerOverflow,
}

impl BasaltError {
    /// Busy leaves the current instruction unexecuted; the statement may be
    /// stepped again and will retry it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Transaction-fatal errors reset the session transaction state instead
    /// of rolling back to the statement boundary.
    pub fn is_txn_fatal(&self) -> bool {
        matches!(self, Self::TxError(_))
    }

    /// Invariant breaches. Nothing about the store can be trusted afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::InternalError(_))
    }
}

#[macro_export]
macro_rules! bail_parse_error {
    ($($arg:tt)*) => {
        return Err($crate::error::BasaltError::ParseError(format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! bail_corrupt_error {
    ($($arg:tt)*) => {
        return Err($crate::error::BasaltError::Corrupt(format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! bail_constraint_error {
    ($($arg:tt)*) => {
        return Err($crate::error::BasaltError::Constraint(format!($($arg)*)))
    };
}
