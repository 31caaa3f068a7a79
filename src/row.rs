//! Postgres row operation.
//!
//! - [`Field`]
//! - [`Row`]
//! - [`Column`]
//! - [`Decode`]
use bytes::{Buf, Bytes};
use std::sync::Arc;

use crate::{
    common::ByteStr,
    ext::BytesExt,
    postgres::{Oid, PgFormat, ProtocolError},
};

/// One column descriptor of a `RowDescription` message.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
#[derive(Debug, Clone)]
pub struct Field {
    pub name: ByteStr,
    /// The table oid, or zero when the field is not a plain column.
    pub table_oid: u32,
    /// The attribute number within its table, or zero.
    pub column_attr: u16,
    /// The object ID of the field's data type.
    pub oid: Oid,
    /// The data type size; negative values denote variable-width types.
    pub typlen: i16,
    /// The type modifier; meaning is type-specific.
    pub atttypmod: i32,
    pub format: PgFormat,
}

impl Field {
    /// Parse the body of a `RowDescription` message.
    pub(crate) fn parse_row_description(mut body: Bytes) -> Result<Arc<[Field]>, ProtocolError> {
        let field_len = body.get_u16();
        let mut fields = Vec::with_capacity(field_len as usize);
        for _ in 0..field_len {
            let name = body.get_nul_bytestr()?;
            fields.push(Field {
                name,
                table_oid: body.get_u32(),
                column_attr: body.get_u16(),
                oid: body.get_u32(),
                typlen: body.get_i16(),
                atttypmod: body.get_i32(),
                format: match body.get_u16() {
                    1 => PgFormat::Binary,
                    _ => PgFormat::Text,
                },
            });
        }
        Ok(fields.into())
    }
}

/// One data row, values split out of a `DataRow` message.
#[derive(Debug, Clone)]
pub struct Row {
    fields: Arc<[Field]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    /// Split a `DataRow` body against its row description.
    pub(crate) fn parse(fields: Arc<[Field]>, mut body: Bytes) -> Row {
        let value_len = body.get_u16();
        debug_assert_eq!(value_len as usize, fields.len(), "DataRow len mismatch");
        let mut values = Vec::with_capacity(value_len as usize);
        for _ in 0..value_len {
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }
        Row { fields, values }
    }

    /// Returns the number of fields/column in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total size of the value bytes, used to bound adaptive fetching.
    pub fn byte_size(&self) -> usize {
        self.values.iter().map(|v| v.as_ref().map_or(0, |b| b.len())).sum()
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, index: I) -> Result<R, DecodeError> {
        let nth = index.position(&self.fields)?;
        let field = &self.fields[nth];
        R::decode(Column {
            name: field.name.clone(),
            oid: field.oid,
            format: field.format,
            value: self.values[nth].clone(),
        })
    }
}

/// Column lookup by 0-based position or by field name.
pub trait Index {
    fn position(&self, fields: &[Field]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(&self, fields: &[Field]) -> Result<usize, DecodeError> {
        if *self >= fields.len() {
            return Err(DecodeError::IndexOutOfBounds { index: *self, len: fields.len() });
        }
        Ok(*self)
    }
}

impl Index for &str {
    fn position(&self, fields: &[Field]) -> Result<usize, DecodeError> {
        fields
            .iter()
            .position(|f| f.name == **self)
            .ok_or_else(|| DecodeError::ColumnNotFound((*self).to_owned()))
    }
}

/// A single value with its field metadata.
#[derive(Debug)]
pub struct Column {
    name: ByteStr,
    oid: Oid,
    format: PgFormat,
    value: Option<Bytes>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// The value bytes, or a null error.
    pub fn bytes(&self) -> Result<&Bytes, DecodeError> {
        self.value.as_ref().ok_or(DecodeError::UnexpectedNull)
    }

    /// The value as utf8 text, for text format decoding.
    pub fn text(&self) -> Result<&str, DecodeError> {
        Ok(std::str::from_utf8(self.bytes()?)?)
    }
}

/// An error when decoding a column value.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("column index {index} out of bounds, row has {len} columns")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("no column named {0:?}")]
    ColumnNotFound(String),
    #[error("column oid missmatch")]
    OidMissmatch,
    #[error("unexpected NULL")]
    UnexpectedNull,
    #[error("non utf8 text value: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed value: {0}")]
    Malformed(String),
    #[cfg(feature = "json")]
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "time")]
    #[error("invalid timestamp: {0}")]
    TimeParse(#[from] time::error::Parse),
}

/// Decode a [`Column`] value into a rust type.
pub trait Decode: Sized {
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

macro_rules! decode_int {
    ($ty:ty, $len:literal, $get:ident) => {
        impl Decode for $ty {
            fn decode(column: Column) -> Result<Self, DecodeError> {
                match column.format() {
                    PgFormat::Text => column
                        .text()?
                        .parse()
                        .map_err(|e| DecodeError::Malformed(format!("{e}"))),
                    PgFormat::Binary => {
                        let mut bytes = column.bytes()?.clone();
                        if bytes.len() != $len {
                            return Err(DecodeError::Malformed(format!(
                                "expected {} bytes, found {}",
                                $len,
                                bytes.len()
                            )));
                        }
                        Ok(bytes.$get())
                    }
                }
            }
        }
    };
}

decode_int!(i16, 2, get_i16);
decode_int!(i32, 4, get_i32);
decode_int!(i64, 8, get_i64);
decode_int!(f32, 4, get_f32);
decode_int!(f64, 8, get_f64);

impl Decode for bool {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.format() {
            PgFormat::Text => match column.text()? {
                "t" | "true" => Ok(true),
                "f" | "false" => Ok(false),
                other => Err(DecodeError::Malformed(format!("invalid bool {other:?}"))),
            },
            PgFormat::Binary => Ok(column.bytes()?.first() == Some(&1)),
        }
    }
}

impl Decode for String {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column.text()?.to_owned())
    }
}

impl Decode for Vec<u8> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.format() {
            PgFormat::Binary => Ok(column.bytes()?.to_vec()),
            PgFormat::Text => {
                let text = column.text()?;
                let hex = text.strip_prefix("\\x").ok_or_else(|| {
                    DecodeError::Malformed("bytea text value without \\x prefix".into())
                })?;
                let mut out = Vec::with_capacity(hex.len() / 2);
                let bytes = hex.as_bytes();
                for pair in bytes.chunks_exact(2) {
                    let hi = hex_digit(pair[0])?;
                    let lo = hex_digit(pair[1])?;
                    out.push(hi << 4 | lo);
                }
                Ok(out)
            }
        }
    }
}

fn hex_digit(b: u8) -> Result<u8, DecodeError> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(DecodeError::Malformed(format!("invalid hex digit {:?}", b as char))),
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.is_null() {
            return Ok(None);
        }
        T::decode(column).map(Some)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    pub(crate) fn description(fields: &[(&str, Oid)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(fields.len() as u16);
        for (name, oid) in fields {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(0); // table oid
            buf.put_u16(0); // attnum
            buf.put_u32(*oid);
            buf.put_i16(-1); // typlen
            buf.put_i32(-1); // atttypmod
            buf.put_u16(0); // text format
        }
        buf.freeze()
    }

    pub(crate) fn data_row(values: &[Option<&[u8]>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(v) => {
                    buf.put_i32(v.len() as i32);
                    buf.put_slice(v);
                }
                None => buf.put_i32(-1),
            }
        }
        buf.freeze()
    }

    #[test]
    fn parse_description_and_row() {
        let fields =
            Field::parse_row_description(description(&[("id", 23), ("name", 25)])).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "id");
        assert_eq!(fields[1].oid, 25);

        let row = Row::parse(fields, data_row(&[Some(b"420".as_slice()), Some(b"Foo".as_slice())]));
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 420);
        assert_eq!(row.try_get::<_, String>("name").unwrap(), "Foo");
    }

    #[test]
    fn null_decodes_to_option() {
        let fields = Field::parse_row_description(description(&[("v", 25)])).unwrap();
        let row = Row::parse(fields, data_row(&[None]));
        assert_eq!(row.try_get::<_, Option<String>>(0).unwrap(), None);
        assert!(matches!(
            row.try_get::<_, String>(0),
            Err(DecodeError::UnexpectedNull)
        ));
    }

    #[test]
    fn missing_column_reported() {
        let fields = Field::parse_row_description(description(&[("v", 25)])).unwrap();
        let row = Row::parse(fields, data_row(&[Some(b"x".as_slice())]));
        assert!(matches!(
            row.try_get::<_, String>("nope"),
            Err(DecodeError::ColumnNotFound(_))
        ));
        assert!(matches!(
            row.try_get::<_, String>(3),
            Err(DecodeError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn bytea_hex_text_decoding() {
        let fields = Field::parse_row_description(description(&[("v", 17)])).unwrap();
        let row = Row::parse(fields, data_row(&[Some(b"\\x01ff".as_slice())]));
        assert_eq!(row.try_get::<_, Vec<u8>>(0).unwrap(), vec![1, 255]);
    }
}
