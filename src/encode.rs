//! The [`Encode`] trait and [`Encoded`] parameter value.
use crate::{
    postgres::{Oid, PgFormat, PgType},
    value::ValueRef,
};

/// Value that can be encoded to be bound to sql parameter.
pub trait Encode<'q> {
    fn encode(self) -> Encoded<'q>;
}

/// Postgres encoded parameter value.
///
/// Carries the value bytes, the parameter type oid, and the wire format the
/// bytes are in (text or binary).
#[derive(Debug, Clone)]
pub struct Encoded<'q> {
    value: ValueRef<'q>,
    is_null: bool,
    oid: Oid,
    format: PgFormat,
}

impl<'q> Encoded<'q> {
    pub(crate) fn new(value: ValueRef<'q>, oid: Oid, format: PgFormat) -> Self {
        Self { value, oid, format, is_null: false }
    }

    /// A value already rendered in postgres text format.
    pub fn text(value: impl Into<ValueRef<'q>>, oid: Oid) -> Self {
        Self::new(value.into(), oid, PgFormat::Text)
    }

    /// A value in postgres binary format.
    pub fn binary(value: impl Into<ValueRef<'q>>, oid: Oid) -> Self {
        Self::new(value.into(), oid, PgFormat::Binary)
    }

    /// An owned text value.
    pub fn owned(value: String, oid: Oid) -> Encoded<'static> {
        Encoded::new(value.into(), oid, PgFormat::Text)
    }

    /// The SQL `NULL` for the given parameter type.
    pub fn null(oid: Oid) -> Encoded<'static> {
        Encoded {
            value: ValueRef::inline(&[]),
            is_null: true,
            oid,
            format: PgFormat::Text,
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    pub(crate) fn value_len(&self) -> usize {
        self.value.len()
    }

    pub(crate) fn value_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }

    /// Copy borrowed bytes so the value can be stored across calls.
    pub fn into_owned(self) -> Encoded<'static> {
        Encoded {
            value: self.value.into_owned(),
            is_null: self.is_null,
            oid: self.oid,
            format: self.format,
        }
    }

    /// Render as a SQL literal for in-line substitution in simple query mode.
    ///
    /// Text values are quoted with `''` doubling; a known oid adds an
    /// explicit cast so the server resolves the same type as the extended
    /// protocol would.
    pub(crate) fn to_sql_literal(&self) -> String {
        if self.is_null {
            return "NULL".into();
        }
        match self.format {
            PgFormat::Text => {
                let text = String::from_utf8_lossy(self.value.as_bytes());
                let mut out = String::with_capacity(text.len() + 8);
                out.push('(');
                out.push('\'');
                for c in text.chars() {
                    if c == '\'' {
                        out.push('\'');
                    }
                    out.push(c);
                }
                out.push('\'');
                if let Some(cast) = cast_name(self.oid) {
                    out.push_str("::");
                    out.push_str(cast);
                }
                out.push(')');
                out
            }
            PgFormat::Binary => {
                // bytea hex form
                let mut out = String::with_capacity(self.value.len() * 2 + 12);
                out.push_str("('\\x");
                for b in self.value.as_bytes() {
                    use std::fmt::Write;
                    let _ = write!(out, "{b:02x}");
                }
                out.push_str("'::bytea)");
                out
            }
        }
    }
}

fn cast_name(oid: Oid) -> Option<&'static str> {
    Some(match oid {
        16 => "boolean",
        17 => "bytea",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        700 => "float4",
        701 => "float8",
        1082 => "date",
        1083 => "time",
        1114 => "timestamp",
        1184 => "timestamptz",
        114 => "json",
        3802 => "jsonb",
        _ => return None,
    })
}

macro_rules! encode_int {
    ($ty:ty) => {
        impl Encode<'static> for $ty {
            fn encode(self) -> Encoded<'static> {
                let mut buf = itoa::Buffer::new();
                let s = buf.format(self);
                Encoded::new(ValueRef::inline(s.as_bytes()), Self::OID, PgFormat::Text)
            }
        }
    };
}

encode_int!(i16);
encode_int!(i32);
encode_int!(i64);

impl Encode<'static> for bool {
    fn encode(self) -> Encoded<'static> {
        let s: &[u8] = if self { b"t" } else { b"f" };
        Encoded::new(ValueRef::inline(s), Self::OID, PgFormat::Text)
    }
}

impl Encode<'static> for f32 {
    fn encode(self) -> Encoded<'static> {
        Encoded::owned(format!("{self}"), Self::OID)
    }
}

impl Encode<'static> for f64 {
    fn encode(self) -> Encoded<'static> {
        Encoded::owned(format!("{self}"), Self::OID)
    }
}

impl<'q> Encode<'q> for &'q str {
    fn encode(self) -> Encoded<'q> {
        Encoded::text(self, str::OID)
    }
}

impl Encode<'static> for String {
    fn encode(self) -> Encoded<'static> {
        Encoded::owned(self, String::OID)
    }
}

impl<'q> Encode<'q> for &'q [u8] {
    fn encode(self) -> Encoded<'q> {
        Encoded::binary(self, <[u8]>::OID)
    }
}

impl Encode<'static> for Vec<u8> {
    fn encode(self) -> Encoded<'static> {
        Encoded::new(self.into(), Vec::<u8>::OID, PgFormat::Binary)
    }
}

impl<'q, T> Encode<'q> for Option<T>
where
    T: Encode<'q> + PgType,
{
    fn encode(self) -> Encoded<'q> {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(T::OID),
        }
    }
}

impl<'q> Encode<'q> for Encoded<'q> {
    fn encode(self) -> Encoded<'q> {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int_text_encoding() {
        let e = 1234i32.encode();
        assert_eq!(e.value_bytes(), b"1234");
        assert_eq!(e.oid(), 23);
        assert_eq!(e.format(), PgFormat::Text);
    }

    #[test]
    fn literal_escapes_quotes() {
        let e = "it's".encode();
        assert_eq!(e.to_sql_literal(), "('it''s')");
    }

    #[test]
    fn literal_casts_known_types() {
        assert_eq!(222i32.encode().to_sql_literal(), "('222'::int4)");
        assert_eq!(Encoded::null(23).to_sql_literal(), "NULL");
    }
}
