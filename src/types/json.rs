use bytes::Buf;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgFormat, PgType},
    row::{Column, Decode, DecodeError},
};

/// Decode and Encode postgres json value.
///
/// # Panics
///
/// Note that when performing [`Encode`], if [`Serialize`] implementation
/// decide to fail, it will panics.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<T> PgType for Json<T> {
    /// jsonb, Binary JSON
    const OID: Oid = 3802;
}

impl<T> Decode for Json<T>
where
    T: DeserializeOwned,
{
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID && column.oid() != 114 {
            return Err(DecodeError::OidMissmatch);
        }
        let format = column.format();
        let mut value = column.into_value().ok_or(DecodeError::UnexpectedNull)?;
        if format == PgFormat::Binary {
            assert_eq!(value.get_u8(), b'\x01', "jsonb version");
        }
        Ok(Json(serde_json::from_slice(&value)?))
    }
}

impl<T: Serialize> Encode<'static> for Json<T> {
    fn encode(self) -> Encoded<'static> {
        let text = serde_json::to_string(&self.0).unwrap();
        Encoded::owned(text, Self::OID)
    }
}
