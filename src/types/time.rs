//! Date and timestamp codec.
//!
//! Postgres supports the special values `infinity` and `-infinity` for date
//! and timestamp columns. They map to the rust types' `MAX` and `MIN`: a
//! parameter at the extreme encodes as the special value, and the special
//! value decodes back to the extreme.
use time::{Date, PrimitiveDateTime, format_description::BorrowedFormatItem, macros::format_description};

use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgType},
    row::{Column, Decode, DecodeError},
};

impl PgType for Date {
    /// date
    const OID: Oid = 1082;
}

impl PgType for PrimitiveDateTime {
    /// date and time
    const OID: Oid = 1114;
}

const DATE: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");

const TIMESTAMP: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");

const POSITIVE_INFINITY: &str = "infinity";
const NEGATIVE_INFINITY: &str = "-infinity";

impl Encode<'static> for Date {
    fn encode(self) -> Encoded<'static> {
        let text = if self == Date::MAX {
            POSITIVE_INFINITY.to_owned()
        } else if self == Date::MIN {
            NEGATIVE_INFINITY.to_owned()
        } else {
            self.format(&DATE).expect("format is statically known")
        };
        Encoded::owned(text, Self::OID)
    }
}

impl Encode<'static> for PrimitiveDateTime {
    fn encode(self) -> Encoded<'static> {
        let text = if self == PrimitiveDateTime::MAX {
            POSITIVE_INFINITY.to_owned()
        } else if self == PrimitiveDateTime::MIN {
            NEGATIVE_INFINITY.to_owned()
        } else {
            self.format(&TIMESTAMP).expect("format is statically known")
        };
        Encoded::owned(text, Self::OID)
    }
}

impl Decode for Date {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID {
            return Err(DecodeError::OidMissmatch);
        }
        match column.text()? {
            POSITIVE_INFINITY => Ok(Date::MAX),
            NEGATIVE_INFINITY => Ok(Date::MIN),
            text => Date::parse(text, &DATE).map_err(<_>::into),
        }
    }
}

impl Decode for PrimitiveDateTime {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        if column.oid() != Self::OID {
            return Err(DecodeError::OidMissmatch);
        }
        match column.text()? {
            POSITIVE_INFINITY => Ok(PrimitiveDateTime::MAX),
            NEGATIVE_INFINITY => Ok(PrimitiveDateTime::MIN),
            text => PrimitiveDateTime::parse(text, &TIMESTAMP).map_err(<_>::into),
        }
    }
}
