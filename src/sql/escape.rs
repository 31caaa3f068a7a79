//! JDBC escape sequence processing.
//!
//! Rewrites `{d '…'}`, `{t '…'}`, `{ts '…'}`, `{oj …}`, `{fn f(args)}` and
//! `{escape '…'}` into plain SQL. Function names inside `{fn …}` pass through
//! unchanged.
use std::borrow::Cow;

use super::scan::{Scanner, keyword_eq};
use crate::error::SyntaxError;

pub(crate) fn process_escapes(sql: &str) -> Result<Cow<'_, str>, SyntaxError> {
    if !has_brace(sql) {
        return Ok(Cow::Borrowed(sql));
    }
    let mut out = String::with_capacity(sql.len());
    rewrite_into(sql, &mut out)?;
    Ok(Cow::Owned(out))
}

fn has_brace(sql: &str) -> bool {
    let mut scan = Scanner::new(sql);
    while !scan.is_eof() {
        if scan.skip_quoted().is_some() {
            continue;
        }
        if scan.peek() == Some(b'{') {
            return true;
        }
        scan.pos += 1;
    }
    false
}

fn rewrite_into(sql: &str, out: &mut String) -> Result<(), SyntaxError> {
    let mut scan = Scanner::new(sql);
    while !scan.is_eof() {
        if let Some(range) = scan.skip_quoted() {
            out.push_str(&sql[range]);
            continue;
        }
        if scan.peek() == Some(b'{') {
            let open = scan.pos;
            let body = brace_body(&mut scan).ok_or_else(|| SyntaxError {
                position: open,
                detail: "unterminated escape sequence".into(),
            })?;
            rewrite_escape(&sql[body], open, out)?;
            continue;
        }
        let b = scan.peek().unwrap();
        out.push(b as char);
        scan.pos += 1;
    }
    Ok(())
}

/// Consume `{ ... }` (nesting respected) and return the body range.
fn brace_body(scan: &mut Scanner) -> Option<std::ops::Range<usize>> {
    debug_assert_eq!(scan.peek(), Some(b'{'));
    let start = scan.pos + 1;
    scan.pos += 1;
    let mut depth = 1usize;
    while depth > 0 {
        if scan.skip_quoted().is_some() {
            continue;
        }
        match scan.peek()? {
            b'{' => depth += 1,
            b'}' => depth -= 1,
            _ => {}
        }
        scan.pos += 1;
    }
    Some(start..scan.pos - 1)
}

fn rewrite_escape(body: &str, at: usize, out: &mut String) -> Result<(), SyntaxError> {
    let mut scan = Scanner::new(body);
    scan.skip_whitespace_and_comments();
    let keyword = scan.take_word().ok_or_else(|| SyntaxError {
        position: at,
        detail: "empty escape sequence".into(),
    })?;
    let rest = body[scan.pos..].trim();

    let prefix = if keyword_eq(keyword, "d") {
        "DATE "
    } else if keyword_eq(keyword, "t") {
        "TIME "
    } else if keyword_eq(keyword, "ts") {
        "TIMESTAMP "
    } else if keyword_eq(keyword, "escape") {
        "ESCAPE "
    } else if keyword_eq(keyword, "call") {
        "CALL "
    } else if keyword_eq(keyword, "oj") || keyword_eq(keyword, "fn") {
        ""
    } else {
        return Err(SyntaxError {
            position: at,
            detail: format!("unsupported escape sequence {{{keyword}}}"),
        });
    };

    out.push_str(prefix);
    // the body may itself contain escape sequences, e.g. {fn f({d '…'})}
    rewrite_into(rest, out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rewrite(sql: &str) -> String {
        process_escapes(sql).unwrap().into_owned()
    }

    #[test]
    fn untouched_without_braces() {
        assert!(matches!(
            process_escapes("SELECT 1").unwrap(),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn date_time_timestamp() {
        assert_eq!(rewrite("SELECT {d '2024-01-02'}"), "SELECT DATE '2024-01-02'");
        assert_eq!(rewrite("SELECT {t '10:20:30'}"), "SELECT TIME '10:20:30'");
        assert_eq!(
            rewrite("SELECT {ts '2024-01-02 10:20:30'}"),
            "SELECT TIMESTAMP '2024-01-02 10:20:30'"
        );
    }

    #[test]
    fn nested_fn_escape() {
        assert_eq!(
            rewrite("SELECT {fn lower({ts '2024-01-02 00:00:00'})}"),
            "SELECT lower(TIMESTAMP '2024-01-02 00:00:00')"
        );
    }

    #[test]
    fn braces_inside_strings_survive() {
        assert_eq!(rewrite("SELECT '{d}'"), "SELECT '{d}'");
    }

    #[test]
    fn call_escape() {
        assert_eq!(rewrite("{call add_customer(?, ?)}"), "CALL add_customer(?, ?)");
    }

    #[test]
    fn unterminated_reports_position() {
        let err = process_escapes("SELECT {d 'x'").unwrap_err();
        assert_eq!(err.position, 7);
    }
}
