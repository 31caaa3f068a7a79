//! Type integration with external types.
//!
//! Implementation of [`Decode`][d] and [`Encode`][e] for external types.
//!
//! Available for:
//!
//! - [`serde_json`]'s value types via [`Json`], requires `json` feature
//! - [`time`][::time]'s [`Date`][td], [`PrimitiveDateTime`][tp], requires `time` feature
//!
//! [d]: crate::Decode
//! [e]: crate::Encode
//! [td]: ::time::Date
//! [tp]: ::time::PrimitiveDateTime

#[cfg(feature = "json")]
mod json;
#[cfg(feature = "json")]
pub use json::Json;

#[cfg(feature = "time")]
mod time;
