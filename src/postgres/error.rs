//! Protocol and server reported errors.
use bytes::{Buf, Bytes};

use crate::common::ByteStr;

/// An error when translating buffer from postgres.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected backend message {found:?}, expected {expect:?} during {phase:?}")]
    Unexpected {
        expect: Option<char>,
        found: char,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication method {auth}")]
    UnknownAuth { auth: i32 },
    #[error("non utf8 string in message: {0}")]
    NonUtf8(#[from] std::str::Utf8Error),
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found: found as char, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect as char),
            found: found as char,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found: found as char, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: i32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }
}

/// A five character `SQLSTATE` code, preserved verbatim from the server.
///
/// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SqlState([u8; 5]);

impl SqlState {
    /// `57014 query_canceled`
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    /// `26000 invalid_sql_statement_name`
    pub const INVALID_SQL_STATEMENT_NAME: SqlState = SqlState(*b"26000");
    /// `0A000 feature_not_supported`
    pub const FEATURE_NOT_SUPPORTED: SqlState = SqlState(*b"0A000");

    pub fn from_code(code: &str) -> Option<SqlState> {
        let bytes: [u8; 5] = code.as_bytes().try_into().ok()?;
        Some(SqlState(bytes))
    }

    pub fn code(&self) -> &str {
        // only constructed from checked ascii
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Debug for SqlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::fmt::Display for SqlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Identified fields of an `ErrorResponse` or `NoticeResponse` message body.
///
/// The body consists of one or more identified fields, followed by a zero byte
/// as a terminator. Fields can appear in any order, and unrecognized field
/// types are silently ignored.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Clone, Default)]
pub struct MessageFields {
    pub severity: ByteStr,
    pub code: ByteStr,
    pub message: ByteStr,
    pub detail: Option<ByteStr>,
    pub hint: Option<ByteStr>,
    pub position: Option<u32>,
}

impl MessageFields {
    pub(crate) fn parse(mut body: Bytes) -> MessageFields {
        let mut fields = MessageFields::default();

        while body.has_remaining() {
            let typ = body.get_u8();
            if typ == 0 {
                break;
            }
            let end = match body.iter().position(|e| *e == b'\0') {
                Some(end) => end,
                None => break,
            };
            let value = body.split_to(end);
            body.advance(1); // nul
            let Ok(value) = ByteStr::from_utf8(value) else {
                continue;
            };
            match typ {
                b'S' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                _ => {}
            }
        }

        fields
    }
}

/// An error reported by the server via `ErrorResponse`.
///
/// The `SQLSTATE` code is preserved verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {} ({})", .fields.severity, .fields.message, .fields.code)]
pub struct ServerError {
    fields: MessageFields,
}

impl ServerError {
    pub(crate) fn new(body: Bytes) -> ServerError {
        Self { fields: MessageFields::parse(body) }
    }

    pub fn severity(&self) -> &str {
        &self.fields.severity
    }

    /// The raw five character `SQLSTATE` code.
    pub fn code(&self) -> &str {
        &self.fields.code
    }

    pub fn sqlstate(&self) -> Option<SqlState> {
        SqlState::from_code(&self.fields.code)
    }

    pub fn message(&self) -> &str {
        &self.fields.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.fields.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.fields.hint.as_deref()
    }

    /// Error cursor position within the original query string, 1-based.
    pub fn position(&self) -> Option<u32> {
        self.fields.position
    }

    /// The server acknowledged an out-of-band cancel request.
    pub fn is_query_canceled(&self) -> bool {
        self.sqlstate() == Some(SqlState::QUERY_CANCELED)
    }

    /// Whether closing the server-side prepared statement and re-preparing is
    /// expected to resolve this error.
    ///
    /// Covers stale prepared plans (`26000`) and the "cached plan must not
    /// change result type" family reported as `0A000`.
    pub fn will_heal_on_retry(&self) -> bool {
        match self.sqlstate() {
            Some(SqlState::INVALID_SQL_STATEMENT_NAME) => true,
            Some(SqlState::FEATURE_NOT_SUPPORTED) => {
                let m = self.message();
                m.contains("cached plan") || m.contains("result type")
            }
            _ => false,
        }
    }
}

/// A warning reported by the server via `NoticeResponse`.
#[derive(Debug, Clone)]
pub struct Notice {
    fields: MessageFields,
}

impl Notice {
    pub(crate) fn new(body: Bytes) -> Notice {
        Self { fields: MessageFields::parse(body) }
    }

    pub fn severity(&self) -> &str {
        &self.fields.severity
    }

    pub fn code(&self) -> &str {
        &self.fields.code
    }

    pub fn message(&self) -> &str {
        &self.fields.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.fields.detail.as_deref()
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.fields.severity, self.fields.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BufMut;

    fn error_body(code: &str, message: &str) -> Bytes {
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(b'S');
        buf.put_slice(b"ERROR\0");
        buf.put_u8(b'C');
        buf.put_slice(code.as_bytes());
        buf.put_u8(0);
        buf.put_u8(b'M');
        buf.put_slice(message.as_bytes());
        buf.put_u8(0);
        buf.put_u8(b'P');
        buf.put_slice(b"17\0");
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn parse_error_fields() {
        let err = ServerError::new(error_body("42601", "syntax error at or near \"VALUES\""));
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42601");
        assert_eq!(err.position(), Some(17));
        assert!(!err.is_query_canceled());
    }

    #[test]
    fn query_canceled_state() {
        let err = ServerError::new(error_body("57014", "canceling statement due to user request"));
        assert!(err.is_query_canceled());
        assert!(!err.will_heal_on_retry());
    }

    #[test]
    fn heals_on_stale_plan() {
        let stale = ServerError::new(error_body("26000", "prepared statement \"q1\" does not exist"));
        assert!(stale.will_heal_on_retry());

        let changed = ServerError::new(error_body("0A000", "cached plan must not change result type"));
        assert!(changed.will_heal_on_retry());

        let other = ServerError::new(error_body("0A000", "SCROLL is not supported"));
        assert!(!other.will_heal_on_retry());
    }
}
