//! Postgres statement execution engine.
//!
//! Takes a possibly multi-statement SQL string with bound parameters, turns
//! it into extended-query protocol traffic, manages reuse of server-side
//! prepared statements, and drives the reply stream into result envelopes
//! with cancellation and timeout.
//!
//! # Examples
//!
//! Execute a query:
//!
//! ```no_run
//! use pgexec::Connection;
//!
//! # async fn app() -> pgexec::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let mut stmt = conn.prepare("SELECT 420, ?")?;
//! stmt.set(1, "Foo")?;
//!
//! let rows = stmt.query_prepared().await?;
//! let row = rows.next_row().unwrap();
//! assert_eq!(row.try_get::<_, i32>(0).unwrap(), 420);
//! # Ok(())
//! # }
//! ```
//!
//! Batch with rewritten inserts:
//!
//! ```no_run
//! use pgexec::Connection;
//!
//! # async fn app() -> pgexec::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//! conn.options_mut().rewrite_batched_inserts = true;
//!
//! let mut stmt = conn.prepare("INSERT INTO foo(id) VALUES(?)")?;
//! for i in 0..14 {
//!     stmt.set(1, i)?;
//!     stmt.add_batch()?;
//! }
//! let counts = stmt.execute_batch().await?;
//! assert_eq!(counts.len(), 14);
//! # Ok(())
//! # }
//! ```
//!
//! Cancel a long execution from another task:
//!
//! ```no_run
//! use std::time::Duration;
//! use pgexec::Connection;
//!
//! # async fn app() -> pgexec::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//! let cancel = conn.cancel_token();
//!
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_millis(500)).await;
//!     let _ = cancel.cancel().await;
//! });
//!
//! let mut stmt = conn.statement();
//! let err = stmt.execute_text("SELECT pg_sleep(5)").await.unwrap_err();
//! assert!(err.is_canceled());
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod io;
mod net;

// Protocol
pub mod postgres;

// Encoding
mod value;
pub mod encode;

// Component
pub mod sql;
pub mod cache;
pub mod params;
pub mod row;
pub mod handler;
mod session;

// Operation
pub mod transport;
mod protocol;
pub mod cancel;
pub mod statement;

// Connection
pub mod connection;

pub mod types;

mod error;

#[doc(inline)]
pub use encode::Encode;
#[doc(inline)]
pub use row::{Decode, DecodeError, Row};
#[doc(inline)]
pub use sql::{PlaceholderStyle, ReturningSpec, SqlExt};

#[doc(inline)]
pub use cancel::CancelToken;
#[doc(inline)]
pub use connection::{Config, Connection};
#[doc(inline)]
pub use handler::ResultSet;
#[doc(inline)]
pub use params::ParameterList;
#[doc(inline)]
pub use protocol::RowStream;
#[doc(inline)]
pub use session::ParameterView;
#[doc(inline)]
pub use statement::{ResultMode, Statement};

#[doc(inline)]
pub use error::{BatchError, Error, ErrorKind, Result, SyntaxError, UnsupportedAuth};
