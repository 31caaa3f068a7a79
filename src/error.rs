//! `pgexec` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error};

use crate::{
    connection::ParseError,
    postgres::{ProtocolError, ServerError},
    row::DecodeError,
};

/// A specialized [`Result`] type for `pgexec` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `pgexec` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Error {
        self.context = context.into();
        self
    }

    /// The server `SQLSTATE`, when this error originated from the server.
    pub fn sqlstate(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Server(e) => Some(e.code()),
            _ => None,
        }
    }

    /// The query was canceled, either by [`cancel`][1] or by the query timeout.
    ///
    /// [1]: crate::statement::Statement::cancel
    pub fn is_canceled(&self) -> bool {
        matches!(&self.kind, ErrorKind::Canceled | ErrorKind::CanceledByTimeout)
    }

    pub(crate) fn will_heal_on_retry(&self) -> bool {
        match &self.kind {
            ErrorKind::Server(e) => e.will_heal_on_retry(),
            _ => false,
        }
    }
}

/// All possible error kind from the `pgexec` library.
pub enum ErrorKind {
    /// Connection url or option parsing failed.
    Config(ParseError),
    /// Unexpected or malformed backend message.
    Protocol(ProtocolError),
    /// The transport is gone; the connection is unusable.
    Io(io::Error),
    /// An error reported by the server, `SQLSTATE` preserved.
    Server(ServerError),
    /// Non utf8 bytes where a string is required.
    Utf8(Utf8Error),
    /// Column decoding failed.
    Decode(DecodeError),
    /// The server requested an authentication scheme the engine does not speak.
    UnsupportedAuth(UnsupportedAuth),
    /// A placeholder is malformed or its style is not permitted.
    Syntax(SyntaxError),
    /// A parameter slot was left unbound at execution.
    MissingParameter { index: usize },
    /// A locally rejected argument, e.g. an out-of-range parameter index.
    InvalidParameterValue(String),
    /// A named bind that the bound query does not contain.
    InvalidParameterName(String),
    /// A single result was required but the query produced several.
    TooManyResults,
    /// A result was required but the query produced none.
    NoData,
    /// Operating on a closed statement or connection.
    Closed,
    /// The requested behavior is intentionally not implemented.
    NotImplemented(&'static str),
    /// The server acknowledged an out-of-band cancel request.
    Canceled,
    /// Like [`Canceled`][ErrorKind::Canceled], but the cancel originated from
    /// the query timeout timer.
    CanceledByTimeout,
    /// One or more entries of a batch failed.
    Batch(BatchError),
}

/// The server requested an authentication scheme the engine does not speak.
#[derive(Debug, thiserror::Error)]
#[error("unsupported authentication method")]
pub struct UnsupportedAuth;

/// A placeholder is malformed or its style is not permitted by configuration.
#[derive(Debug, thiserror::Error)]
#[error("{detail} at position {position}")]
pub struct SyntaxError {
    /// Byte offset into the original query string.
    pub position: usize,
    pub detail: String,
}

/// Per-entry outcome of a failed batch execution.
///
/// `counts` always has one slot per submitted entry; the entry that failed
/// holds [`EXECUTE_FAILED`][crate::statement::EXECUTE_FAILED].
pub struct BatchError {
    pub counts: Vec<i64>,
    pub first_failure: usize,
    pub source: Box<Error>,
}

impl fmt::Debug for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchError")
            .field("counts", &self.counts)
            .field("first_failure", &self.first_failure)
            .field("source", &self.source)
            .finish()
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<ServerError>e => ErrorKind::Server(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<SyntaxError>e => ErrorKind::Syntax(e));
from!(<BatchError>e => ErrorKind::Batch(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Syntax(e) => e.fmt(f),
            Self::MissingParameter { index } => {
                write!(f, "parameter ${index} was not bound")
            }
            Self::InvalidParameterValue(m) => write!(f, "{m}"),
            Self::InvalidParameterName(name) => {
                write!(f, "the query contains no parameter named :{name}")
            }
            Self::TooManyResults => f.write_str("multiple results were returned by the query"),
            Self::NoData => f.write_str("no results were returned by the query"),
            Self::Closed => f.write_str("this statement has been closed"),
            Self::NotImplemented(what) => write!(f, "{what} is not implemented"),
            Self::Canceled => f.write_str("query canceled"),
            Self::CanceledByTimeout => f.write_str("query canceled by statement timeout"),
            Self::Batch(e) => write!(
                f,
                "batch entry {} failed: {}",
                e.first_failure, e.source
            ),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
