//! Central error type shared by every `des-*` crate.
//!
//! Mirrors the taxonomy in the specification's error-handling design: a small
//! set of `Code`s, an `Error` that accumulates human-readable "tip" context as
//! it is propagated up through a call stack, and a `ResultExt` trait to attach
//! that context without writing `.map_err(...)` at every call site.

use std::fmt;

/// Error classification. Maps 1:1 onto the taxonomy kinds in the spec's
/// error-handling section rather than onto any particular wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Corrupted header/footer/index, unsupported version, region overlap.
    Internal,
    /// Name/container/external-object absent.
    NotFound,
    /// Object store / DB / HTTP upstream hiccup; safe to retry.
    Unavailable,
    /// A held lease could not be renewed; caller must stop mutating the shard.
    FailedPrecondition,
    /// Token bucket exhausted.
    ResourceExhausted,
    /// Bad configuration, invalid name characters, oversize metadata.
    InvalidArgument,
    /// Shutdown flag observed.
    Cancelled,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::Internal => "internal",
            Code::NotFound => "not_found",
            Code::Unavailable => "unavailable",
            Code::FailedPrecondition => "failed_precondition",
            Code::ResourceExhausted => "resource_exhausted",
            Code::InvalidArgument => "invalid_argument",
            Code::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The error type used throughout the workspace. Carries a `Code` plus an
/// ordered stack of context messages, the innermost pushed first.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: Code,
    /// Context messages, outermost (most recently added) last.
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Error {
            code,
            messages: vec![message.into()],
        }
    }

    /// Adds a context message without discarding the original.
    pub fn append(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Merge two errors, keeping `self`'s code and appending `other`'s trail.
    pub fn merge(mut self, other: Error) -> Self {
        self.messages.extend(other.messages);
        self
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.code, Code::Unavailable)
    }

    /// Maps this error onto the user-visible HTTP status policy from the
    /// spec's error-handling section: 404 missing, 503 everything else that
    /// isn't caller error, 4xx for validation.
    pub fn http_status(&self) -> u16 {
        match self.code {
            Code::NotFound => 404,
            Code::InvalidArgument => 400,
            Code::ResourceExhausted => 429,
            Code::Cancelled => 499,
            Code::FailedPrecondition => 409,
            Code::Unavailable | Code::Internal => 503,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.messages.join(" :: "))
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(Code::Unavailable, format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(Code::Internal, format!("json error: {e}"))
    }
}

/// Construct an `Error` at a call site, in the style of `make_err!(Code::X, "fmt {}", arg)`.
#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {
        $crate::Error::new($code, format!($($arg)+))
    };
}

/// Shorthand for the common case of a caller-supplied bad argument.
#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {
        $crate::Error::new($crate::Code::InvalidArgument, format!($($arg)+))
    };
}

/// Guard-clause macro: `error_if!(cond, "message {}", arg)` returns early with
/// an `InvalidArgument` error when `cond` is true.
#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            return Err($crate::make_input_err!($($arg)+));
        }
    };
}

/// Extension trait to attach context to any `Result`, converting the error
/// half into `des_error::Error` along the way.
pub trait ResultExt<T> {
    fn err_tip<F: FnOnce() -> S, S: Into<String>>(self, f: F) -> Result<T, Error>;
    fn err_tip_with_code<F: FnOnce(&Error) -> (Code, String)>(self, f: F) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn err_tip<F: FnOnce() -> S, S: Into<String>>(self, f: F) -> Result<T, Error> {
        self.map_err(|e| e.into().append(f().into()))
    }

    fn err_tip_with_code<F: FnOnce(&Error) -> (Code, String)>(self, f: F) -> Result<T, Error> {
        self.map_err(|e| {
            let e: Error = e.into();
            let (code, msg) = f(&e);
            Error { code, ..e }.append(msg)
        })
    }
}

/// Same as `ResultExt` but for an `Option`, turning `None` into a `NotFound`.
pub trait OptionExt<T> {
    fn err_tip<F: FnOnce() -> S, S: Into<String>>(self, f: F) -> Result<T, Error>;
}

impl<T> OptionExt<T> for Option<T> {
    fn err_tip<F: FnOnce() -> S, S: Into<String>>(self, f: F) -> Result<T, Error> {
        self.ok_or_else(|| Error::new(Code::NotFound, f().into()))
    }
}
