//! Placeholder rewriting and statement splitting.
//!
//! One forward scan turns the caller's query text into native form: statement
//! separators split the text into sub-statements, and every placeholder
//! occurrence is replaced by `$n` against one global slot index space.
use std::ops::Range;

use super::{
    PlaceholderStyle, ReturningSpec, escape,
    scan::{Scanner, is_ident_start, keyword_eq},
};
use crate::error::{Error, SyntaxError};

/// Rewriter configuration, also the identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RewriteOptions {
    pub style: PlaceholderStyle,
    pub escape_processing: bool,
    /// When unset the text is passed through untouched, the way plain
    /// (non-prepared) statements are sent.
    pub parameterized: bool,
    pub returning: ReturningSpec,
}

/// The product of one rewrite: native-form text plus per-sub-statement
/// placeholder metadata.
#[derive(Debug)]
pub struct RewrittenQuery {
    sql: String,
    subqueries: Vec<SubQuery>,
    param_count: usize,
    /// Placeholder name to 1-based slot, in first-seen order. Under ANY
    /// style the slots need not start at 1.
    names: Vec<(String, usize)>,
}

/// One sub-statement of a rewritten query.
#[derive(Debug)]
pub struct SubQuery {
    /// Byte range into [`RewrittenQuery::sql`].
    range: Range<usize>,
    /// Global slot (1-based) for each placeholder occurrence, in order.
    param_slots: Vec<usize>,
    /// Byte range of each original placeholder occurrence in the input text,
    /// kept so errors can report the form the caller wrote.
    source_spans: Vec<Range<usize>>,
    /// Byte range of each rewritten `$n` occurrence, relative to this
    /// sub-statement's text.
    out_spans: Vec<Range<usize>>,
    command: CommandKind,
    returning: bool,
    /// The `( ... )` VALUES tuple of a rewritable insert, relative to this
    /// sub-statement's text.
    values_tuple: Option<Range<usize>>,
}

/// The leading command word of a sub-statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
    Empty,
}

impl RewrittenQuery {
    /// The full rewritten text, sub-statements joined by `;`.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn subqueries(&self) -> &[SubQuery] {
        &self.subqueries
    }

    /// Total number of parameter slots across all sub-statements.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Placeholder name to slot mapping, for NAMED style binds. Empty when
    /// the query has no named placeholders.
    pub fn names(&self) -> &[(String, usize)] {
        &self.names
    }

    /// Resolve a parameter name to its 1-based slot.
    pub fn name_slot(&self, name: &str) -> Option<usize> {
        self.names.iter().find(|(n, _)| n == name).map(|(_, slot)| *slot)
    }

    pub fn sub_sql(&self, sub: &SubQuery) -> &str {
        &self.sql[sub.range.clone()]
    }

    /// Whether the whole query is more than one sub-statement.
    pub fn is_composite(&self) -> bool {
        self.subqueries.len() > 1
    }

    pub fn is_empty(&self) -> bool {
        self.subqueries.iter().all(|s| s.command == CommandKind::Empty)
    }

    /// The only sub-statement, when the query is not composite.
    pub fn single(&self) -> Option<&SubQuery> {
        match self.subqueries.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }

    /// Splice a rewritable insert into a multi-row VALUES statement.
    ///
    /// The tuple is replicated `rows` times with slot indexes shifted by the
    /// query's parameter count per row, so row `r` binds slots
    /// `r*k+1 ..= r*k+k`. Returns `None` when the query is not a single
    /// rewritable insert.
    pub(crate) fn fuse_insert(&self, rows: usize) -> Option<String> {
        let sub = self.single()?;
        let tuple = sub.values_tuple.clone()?;
        let text = self.sub_sql(sub);
        let k = self.param_count;

        let mut out = String::with_capacity(text.len() + (tuple.len() + 1) * rows);
        out.push_str(&text[..tuple.end]);
        for row in 1..rows {
            out.push(',');
            renumber_tuple(&text[tuple.clone()], row * k, &mut out);
        }
        out.push_str(&text[tuple.end..]);
        Some(out)
    }
}

impl SubQuery {
    pub fn param_slots(&self) -> &[usize] {
        &self.param_slots
    }

    /// The original text span of one placeholder occurrence.
    pub fn source_span(&self, occurrence: usize) -> Option<Range<usize>> {
        self.source_spans.get(occurrence).cloned()
    }

    pub fn command(&self) -> CommandKind {
        self.command
    }

    /// A `RETURNING` clause is present (written or appended).
    pub fn returning_columns(&self) -> bool {
        self.returning
    }

    /// Matches `INSERT INTO t [(cols)] VALUES (tuple)` with at most a
    /// trailing `RETURNING`, so batches can splice extra tuples.
    pub fn is_rewritable_insert(&self) -> bool {
        self.values_tuple.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.command == CommandKind::Empty
    }
}

/// Rewrite `sql` under `options`.
///
/// The output is deterministic: the same text and options always produce the
/// same rewritten form, which is what makes it usable as a cache key.
pub fn rewrite(sql: &str, options: &RewriteOptions) -> Result<RewrittenQuery, Error> {
    let processed;
    let sql = if options.escape_processing {
        processed = escape::process_escapes(sql)?;
        &processed
    } else {
        sql
    };

    let style = match options.parameterized {
        true => options.style,
        false => PlaceholderStyle::None,
    };

    let mut builders: Vec<SubBuilder> = Vec::new();
    let mut cur = SubBuilder::default();
    let mut names: Vec<(String, usize)> = Vec::new();
    let mut next_slot = 1usize;

    let mut scan = Scanner::new(sql);
    while !scan.is_eof() {
        if let Some(range) = scan.skip_quoted() {
            cur.text.push_str(&sql[range]);
            continue;
        }

        let b = scan.peek().unwrap();
        match b {
            b';' => {
                scan.pos += 1;
                builders.push(std::mem::take(&mut cur));
            }
            b'?' => match style {
                PlaceholderStyle::Jdbc | PlaceholderStyle::Any => {
                    let span = scan.pos..scan.pos + 1;
                    scan.pos += 1;
                    let slot = next_slot;
                    next_slot += 1;
                    cur.push_slot(slot, span);
                }
                PlaceholderStyle::Named | PlaceholderStyle::Native => {
                    return Err(SyntaxError {
                        position: scan.pos,
                        detail: format!(
                            "positional parameter ? is not allowed by placeholder style {}",
                            style.value()
                        ),
                    }
                    .into());
                }
                PlaceholderStyle::None => {
                    cur.text.push('?');
                    scan.pos += 1;
                }
            },
            b'$' if scan.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => match style {
                PlaceholderStyle::Native | PlaceholderStyle::Any => {
                    let start = scan.pos;
                    scan.pos += 1;
                    let mut n = 0usize;
                    while let Some(d) = scan.peek().filter(u8::is_ascii_digit) {
                        n = n * 10 + usize::from(d - b'0');
                        scan.pos += 1;
                    }
                    if n == 0 || n > i16::MAX as usize {
                        return Err(SyntaxError {
                            position: start,
                            detail: format!("malformed placeholder {}", &sql[start..scan.pos]),
                        }
                        .into());
                    }
                    next_slot = next_slot.max(n + 1);
                    cur.push_slot(n, start..scan.pos);
                }
                PlaceholderStyle::Jdbc | PlaceholderStyle::Named => {
                    return Err(SyntaxError {
                        position: scan.pos,
                        detail: format!(
                            "native parameter is not allowed by placeholder style {}",
                            style.value()
                        ),
                    }
                    .into());
                }
                PlaceholderStyle::None => {
                    cur.text.push('$');
                    scan.pos += 1;
                }
            },
            b':' => {
                if scan.peek_at(1) == Some(b':') {
                    // a cast, never a placeholder
                    cur.text.push_str("::");
                    scan.pos += 2;
                } else if scan.peek_at(1).is_some_and(is_named_start) {
                    match style {
                        PlaceholderStyle::Named | PlaceholderStyle::Any => {
                            let start = scan.pos;
                            scan.pos += 1;
                            let name_start = scan.pos;
                            while scan.peek().is_some_and(is_named_cont) {
                                scan.pos += 1;
                            }
                            let name = &sql[name_start..scan.pos];
                            let slot = match names.iter().find(|(n, _)| n == name) {
                                Some((_, slot)) => *slot,
                                None => {
                                    let slot = next_slot;
                                    next_slot += 1;
                                    names.push((name.to_owned(), slot));
                                    slot
                                }
                            };
                            cur.push_slot(slot, start..scan.pos);
                        }
                        PlaceholderStyle::Jdbc | PlaceholderStyle::Native => {
                            return Err(SyntaxError {
                                position: scan.pos,
                                detail: format!(
                                    "named parameter is not allowed by placeholder style {}",
                                    style.value()
                                ),
                            }
                            .into());
                        }
                        PlaceholderStyle::None => {
                            cur.text.push(':');
                            scan.pos += 1;
                        }
                    }
                } else {
                    cur.text.push(':');
                    scan.pos += 1;
                }
            }
            b if is_ident_start(b) => {
                // consume whole words so a trailing `e` is never mistaken
                // for an E'...' string opener
                let word = scan.take_word().unwrap();
                cur.text.push_str(word);
            }
            _ => {
                cur.text.push(b as char);
                scan.pos += 1;
            }
        }
    }
    builders.push(cur);

    // empty trailing sub-statements are discarded
    while builders.len() > 1 && builders.last().is_some_and(|b| b.text.trim().is_empty()) {
        builders.pop();
    }

    let param_count = next_slot - 1;

    let mut sql_out = String::with_capacity(sql.len());
    let mut subqueries = Vec::with_capacity(builders.len());
    for (i, mut builder) in builders.into_iter().enumerate() {
        builder.analyze(&options.returning);
        if i > 0 {
            sql_out.push(';');
        }
        let start = sql_out.len();
        sql_out.push_str(&builder.text);
        subqueries.push(SubQuery {
            range: start..sql_out.len(),
            param_slots: builder.param_slots,
            source_spans: builder.source_spans,
            out_spans: builder.out_spans,
            command: builder.command,
            returning: builder.returning,
            values_tuple: builder.values_tuple,
        });
    }

    Ok(RewrittenQuery {
        sql: sql_out,
        subqueries,
        param_count,
        names,
    })
}

// named parameters accept a narrower charset than a SQL identifier
fn is_named_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_named_cont(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[derive(Default)]
struct SubBuilder {
    text: String,
    param_slots: Vec<usize>,
    source_spans: Vec<Range<usize>>,
    out_spans: Vec<Range<usize>>,
    command: CommandKind,
    returning: bool,
    values_tuple: Option<Range<usize>>,
}

impl Default for CommandKind {
    fn default() -> Self {
        CommandKind::Empty
    }
}

impl SubBuilder {
    fn push_slot(&mut self, slot: usize, source: Range<usize>) {
        let start = self.text.len();
        self.text.push('$');
        let mut buf = itoa::Buffer::new();
        self.text.push_str(buf.format(slot));
        self.param_slots.push(slot);
        self.source_spans.push(source);
        self.out_spans.push(start..self.text.len());
    }

    fn analyze(&mut self, returning: &ReturningSpec) {
        let mut scan = Scanner::new(&self.text);
        scan.skip_whitespace_and_comments();
        let Some(word) = scan.take_word() else {
            self.command = CommandKind::Empty;
            return;
        };

        self.command = if keyword_eq(word, "insert") {
            CommandKind::Insert
        } else if keyword_eq(word, "update") {
            CommandKind::Update
        } else if keyword_eq(word, "delete") {
            CommandKind::Delete
        } else if keyword_eq(word, "select") {
            CommandKind::Select
        } else {
            CommandKind::Other
        };

        self.returning = has_top_level_returning(&self.text);

        if self.command == CommandKind::Insert {
            self.values_tuple = rewritable_insert_tuple(&self.text);
            // splicing requires every placeholder to live inside the tuple
            if let Some(tuple) = &self.values_tuple {
                let all_inside = self
                    .out_spans
                    .iter()
                    .all(|s| s.start >= tuple.start && s.end <= tuple.end);
                if !all_inside {
                    self.values_tuple = None;
                }
            }
        }

        if returning.wants_keys()
            && !self.returning
            && matches!(
                self.command,
                CommandKind::Insert | CommandKind::Update | CommandKind::Delete
            )
        {
            match returning {
                ReturningSpec::All => self.text.push_str(" RETURNING *"),
                ReturningSpec::Columns(cols) => {
                    self.text.push_str(" RETURNING ");
                    for (i, col) in cols.iter().enumerate() {
                        if i > 0 {
                            self.text.push_str(", ");
                        }
                        self.text.push_str(col);
                    }
                }
                ReturningSpec::None => unreachable!(),
            }
            self.returning = true;
        }
    }
}

/// Top-level (paren depth zero, unquoted) RETURNING keyword scan.
fn has_top_level_returning(text: &str) -> bool {
    let mut scan = Scanner::new(text);
    let mut depth = 0usize;
    while !scan.is_eof() {
        if scan.skip_quoted().is_some() {
            continue;
        }
        match scan.peek().unwrap() {
            b'(' => {
                depth += 1;
                scan.pos += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                scan.pos += 1;
            }
            b if is_ident_start(b) => {
                let word = scan.take_word().unwrap();
                if depth == 0 && keyword_eq(word, "returning") {
                    return true;
                }
            }
            _ => scan.pos += 1,
        }
    }
    false
}

/// Match `INSERT INTO <relation> [(<col-list>)] VALUES ( <tuple> )` with no
/// trailing clause other than `RETURNING`, and return the tuple span.
fn rewritable_insert_tuple(text: &str) -> Option<Range<usize>> {
    let mut scan = Scanner::new(text);

    scan.skip_whitespace_and_comments();
    if !keyword_eq(scan.take_word()?, "insert") {
        return None;
    }
    scan.skip_whitespace_and_comments();
    if !keyword_eq(scan.take_word()?, "into") {
        return None;
    }

    // possibly qualified, possibly quoted relation name
    scan.skip_whitespace_and_comments();
    scan.take_word()?;
    while scan.peek() == Some(b'.') {
        scan.pos += 1;
        scan.take_word()?;
    }

    scan.skip_whitespace_and_comments();
    if scan.peek() == Some(b'(') {
        scan.take_paren_group()?;
        scan.skip_whitespace_and_comments();
    }

    if !keyword_eq(scan.take_word()?, "values") {
        return None;
    }
    scan.skip_whitespace_and_comments();
    let tuple = scan.take_paren_group()?;

    scan.skip_whitespace_and_comments();
    match scan.peek() {
        None => Some(tuple),
        // a second tuple disqualifies splicing
        Some(b',') => None,
        Some(b) if is_ident_start(b) => {
            keyword_eq(scan.take_word()?, "returning").then_some(tuple)
        }
        Some(_) => None,
    }
}

/// Copy a VALUES tuple shifting every `$n` by `offset`.
fn renumber_tuple(tuple: &str, offset: usize, out: &mut String) {
    let mut scan = Scanner::new(tuple);
    while !scan.is_eof() {
        if let Some(range) = scan.skip_quoted() {
            out.push_str(&tuple[range]);
            continue;
        }
        let b = scan.peek().unwrap();
        if b == b'$' && scan.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
            scan.pos += 1;
            let mut n = 0usize;
            while let Some(d) = scan.peek().filter(u8::is_ascii_digit) {
                n = n * 10 + usize::from(d - b'0');
                scan.pos += 1;
            }
            out.push('$');
            let mut buf = itoa::Buffer::new();
            out.push_str(buf.format(n + offset));
        } else if is_ident_start(b) {
            out.push_str(scan.take_word().unwrap());
        } else {
            out.push(b as char);
            scan.pos += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn options(style: PlaceholderStyle) -> RewriteOptions {
        RewriteOptions { style, parameterized: true, ..Default::default() }
    }

    #[test]
    fn jdbc_positional_numbering() {
        let q = rewrite("SELECT ?, ? WHERE a = ?", &options(PlaceholderStyle::Jdbc)).unwrap();
        assert_eq!(q.sql(), "SELECT $1, $2 WHERE a = $3");
        assert_eq!(q.param_count(), 3);
    }

    #[test]
    fn named_occurrences_share_one_slot() {
        let q = rewrite(
            "SELECT :a, :b, :a WHERE x = :b",
            &options(PlaceholderStyle::Named),
        )
        .unwrap();
        assert_eq!(q.sql(), "SELECT $1, $2, $1 WHERE x = $2");
        assert_eq!(q.param_count(), 2);
        assert_eq!(q.name_slot("a"), Some(1));
        assert_eq!(q.name_slot("b"), Some(2));
        assert_eq!(q.name_slot("c"), None);
    }

    #[test]
    fn mixed_styles_merge_into_one_index_space() {
        let q = rewrite(
            "INSERT INTO t(a,b) VALUES($1,$2),($1,$2); \
             INSERT INTO t(a,b) VALUES(?,?); \
             INSERT INTO t(a,b) VALUES(:a,:b),(:a,:b),(:a,:b)",
            &options(PlaceholderStyle::Any),
        )
        .unwrap();
        assert_eq!(q.subqueries().len(), 3);
        assert_eq!(q.param_count(), 6);

        let subs = q.subqueries();
        assert_eq!(subs[0].param_slots(), &[1, 2, 1, 2]);
        assert_eq!(subs[1].param_slots(), &[3, 4]);
        assert_eq!(subs[2].param_slots(), &[5, 6, 5, 6, 5, 6]);
        assert_eq!(q.name_slot("a"), Some(5));
        assert_eq!(q.name_slot("b"), Some(6));
        assert_eq!(
            q.sub_sql(&subs[2]).trim(),
            "INSERT INTO t(a,b) VALUES($5,$6),($5,$6),($5,$6)"
        );
    }

    #[test]
    fn native_rewrite_is_idempotent() {
        let input = "SELECT $1, $2 WHERE a = $1";
        let first = rewrite(input, &options(PlaceholderStyle::Native)).unwrap();
        assert_eq!(first.sql(), input);
        let second = rewrite(first.sql(), &options(PlaceholderStyle::Native)).unwrap();
        assert_eq!(second.sql(), first.sql());
    }

    #[test]
    fn quoted_regions_hide_everything() {
        let q = rewrite(
            "SELECT '?;', \":x\", -- ? :x $1 ;\n $t$ ? ; $t$, ? /* ; ? */",
            &options(PlaceholderStyle::Any),
        )
        .unwrap();
        assert_eq!(q.subqueries().len(), 1);
        assert_eq!(q.param_count(), 1);
        assert!(q.sql().contains("'?;'"));
        assert!(q.sql().contains("$t$ ? ; $t$"));
    }

    #[test]
    fn casts_are_not_named_parameters() {
        let q = rewrite("SELECT a::int4, :b", &options(PlaceholderStyle::Named)).unwrap();
        assert_eq!(q.sql(), "SELECT a::int4, $1");
        assert_eq!(q.name_slot("b"), Some(1));
    }

    #[test]
    fn forbidden_style_reports_position() {
        let err = rewrite("SELECT ?", &options(PlaceholderStyle::Named)).unwrap_err();
        match err.into_kind() {
            ErrorKind::Syntax(e) => assert_eq!(e.position, 7),
            other => panic!("expected syntax error, got {other}"),
        }
    }

    #[test]
    fn malformed_native_placeholder() {
        let err = rewrite("SELECT $0", &options(PlaceholderStyle::Native)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Syntax(_)));
    }

    #[test]
    fn trailing_empty_statements_discarded() {
        let q = rewrite("SELECT 1; ; ", &options(PlaceholderStyle::Jdbc)).unwrap();
        assert_eq!(q.subqueries().len(), 1);

        let q = rewrite("SELECT 1;;SELECT 2", &options(PlaceholderStyle::Jdbc)).unwrap();
        assert_eq!(q.subqueries().len(), 3);
        assert!(q.subqueries()[1].is_empty());
    }

    #[test]
    fn rewritable_insert_detection() {
        let q = rewrite(
            "INSERT INTO s.t (a, b) VALUES (?, ?)",
            &options(PlaceholderStyle::Jdbc),
        )
        .unwrap();
        assert!(q.subqueries()[0].is_rewritable_insert());

        // trailing RETURNING is allowed
        let q = rewrite(
            "INSERT INTO t VALUES (?) RETURNING id",
            &options(PlaceholderStyle::Jdbc),
        )
        .unwrap();
        assert!(q.subqueries()[0].is_rewritable_insert());
        assert!(q.subqueries()[0].returning_columns());

        // multi-tuple VALUES cannot be spliced
        let q = rewrite(
            "INSERT INTO t VALUES (?), (?)",
            &options(PlaceholderStyle::Jdbc),
        )
        .unwrap();
        assert!(!q.subqueries()[0].is_rewritable_insert());

        // ON CONFLICT disqualifies
        let q = rewrite(
            "INSERT INTO t VALUES (?) ON CONFLICT DO NOTHING",
            &options(PlaceholderStyle::Jdbc),
        )
        .unwrap();
        assert!(!q.subqueries()[0].is_rewritable_insert());
    }

    #[test]
    fn auto_returning_appended_for_keys() {
        let opts = RewriteOptions {
            style: PlaceholderStyle::Jdbc,
            parameterized: true,
            returning: ReturningSpec::All,
            ..Default::default()
        };
        let q = rewrite("INSERT INTO t(a) VALUES(?)", &opts).unwrap();
        assert_eq!(q.sql(), "INSERT INTO t(a) VALUES($1) RETURNING *");
        assert!(q.subqueries()[0].returning_columns());

        // an explicit RETURNING is never doubled
        let q = rewrite("INSERT INTO t(a) VALUES(?) RETURNING id", &opts).unwrap();
        assert_eq!(q.sql(), "INSERT INTO t(a) VALUES($1) RETURNING id");

        // SELECT is left alone
        let q = rewrite("SELECT ?", &opts).unwrap();
        assert_eq!(q.sql(), "SELECT $1");
    }

    #[test]
    fn fuse_insert_renumbers_rows() {
        let q = rewrite(
            "INSERT INTO t(a, b) VALUES (?, ?)",
            &options(PlaceholderStyle::Jdbc),
        )
        .unwrap();
        let fused = q.fuse_insert(3).unwrap();
        assert_eq!(
            fused,
            "INSERT INTO t(a, b) VALUES ($1, $2),($3, $4),($5, $6)"
        );

        let q = rewrite(
            "INSERT INTO t VALUES (?) RETURNING id",
            &options(PlaceholderStyle::Jdbc),
        )
        .unwrap();
        assert_eq!(
            q.fuse_insert(2).unwrap(),
            "INSERT INTO t VALUES ($1),($2) RETURNING id"
        );
    }

    #[test]
    fn unparameterized_text_passes_through() {
        let q = rewrite(
            "SELECT ? WHERE a = :b",
            &RewriteOptions {
                style: PlaceholderStyle::Any,
                parameterized: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(q.sql(), "SELECT ? WHERE a = :b");
        assert_eq!(q.param_count(), 0);
    }

    #[test]
    fn rewrite_is_stable() {
        let opts = options(PlaceholderStyle::Any);
        let a = rewrite("SELECT ?, :n, $3", &opts).unwrap();
        let b = rewrite("SELECT ?, :n, $3", &opts).unwrap();
        assert_eq!(a.sql(), b.sql());
        assert_eq!(a.param_count(), b.param_count());
    }
}
