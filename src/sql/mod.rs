//! Sql string operation: placeholder styles, statement splitting, rewriting.
mod escape;
mod rewrite;
pub(crate) mod scan;

pub use rewrite::{CommandKind, RewriteOptions, RewrittenQuery, SubQuery, rewrite};

use crate::error::{Error, ErrorKind};

/// Placeholder syntax accepted in query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaceholderStyle {
    /// Accept positional `?`, named `:name` and native `$n`, merged under one
    /// global index space in lexical order.
    Any,
    /// Positional `?`, numbered left to right starting at 1.
    #[default]
    Jdbc,
    /// Named `:identifier`; every occurrence of one name shares one slot.
    Named,
    /// Native `$n`; the digits are the slot index.
    Native,
    /// No placeholder substitution at all.
    None,
}

impl PlaceholderStyle {
    pub fn of(mode: &str) -> Result<PlaceholderStyle, Error> {
        Ok(match mode {
            "any" => Self::Any,
            "jdbc" => Self::Jdbc,
            "named" => Self::Named,
            "native" => Self::Native,
            "none" => Self::None,
            other => {
                return Err(ErrorKind::InvalidParameterValue(format!(
                    "placeholder style must be one of any, jdbc, named, native, none but was: {other}"
                ))
                .into());
            }
        })
    }

    pub fn value(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Jdbc => "jdbc",
            Self::Named => "named",
            Self::Native => "native",
            Self::None => "none",
        }
    }
}

/// Requested `RETURNING` treatment for statements that do not spell one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReturningSpec {
    /// Leave the statement alone.
    #[default]
    None,
    /// Append `RETURNING *` to INSERT/UPDATE/DELETE without one.
    All,
    /// Append `RETURNING` with this projection list.
    Columns(Vec<String>),
}

impl ReturningSpec {
    pub(crate) fn wants_keys(&self) -> bool {
        !matches!(self, ReturningSpec::None)
    }
}

/// Type that represent sql string.
pub trait Sql {
    /// Returns sql string.
    fn sql(&self) -> &str;

    /// Return `true` if current statement should be cached.
    fn persistent(&self) -> bool;
}

impl Sql for &str {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl Sql for String {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

/// Non persistent query string.
#[derive(Debug)]
pub struct SqlOnce<'sql>(&'sql str);

impl Sql for SqlOnce<'_> {
    fn sql(&self) -> &str {
        self.0
    }

    fn persistent(&self) -> bool {
        false
    }
}

/// Extension trait for easier query persistence config.
pub trait SqlExt<'a> {
    /// Disable statement caching.
    fn once(self) -> SqlOnce<'a>;
}

impl<'a> SqlExt<'a> for &'a str {
    fn once(self) -> SqlOnce<'a> {
        SqlOnce(self)
    }
}

impl<'a> SqlExt<'a> for SqlOnce<'a> {
    fn once(self) -> SqlOnce<'a> {
        self
    }
}
