use std::{error, fmt, result};

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location.
pub enum Error {
    /// API input or the index state is not what the operation expects.
    Invalid(String, String),
    /// Node allocation failed; the index is left in its pre-call state.
    OutOfMemory(String, String),
    /// Error converting from one type to another.
    FailConvert(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Invalid(p, msg) => write!(f, "{} Invalid: {}", p, msg),
            OutOfMemory(p, msg) => write!(f, "{} OutOfMemory: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
