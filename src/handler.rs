//! Result sinks driven by the protocol engine.
//!
//! The engine reports four events: result rows, command status, warnings and
//! errors. A handler accumulates them into result envelopes; the batch
//! handler additionally tracks per-entry update counts.
use std::sync::Arc;

use crate::{
    Error,
    postgres::Notice,
    row::{Field, Row},
    statement::{EXECUTE_FAILED, PortalName, SUCCESS_NO_INFO},
};

/// Parsed `CommandComplete` tag.
#[derive(Debug, Clone)]
pub struct CommandTag {
    /// The first word of the tag, e.g. `INSERT`, `SELECT`, `BEGIN`.
    pub command: String,
    /// Affected row count, when the command reports one.
    pub rows: u64,
    /// For single-row `INSERT` on pre-oid-removal servers; zero otherwise.
    pub insert_oid: u64,
}

impl CommandTag {
    pub(crate) fn parse(tag: &str) -> CommandTag {
        let mut words = tag.split_whitespace();
        let command = words.next().unwrap_or_default().to_owned();
        let (rows, insert_oid) = match command.as_str() {
            "INSERT" => {
                let oid = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                let rows = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                (rows, oid)
            }
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => {
                (words.last().and_then(|w| w.parse().ok()).unwrap_or(0), 0)
            }
            _ => (0, 0),
        };
        CommandTag { command, rows, insert_oid }
    }
}

/// A portal the server suspended because the `Execute` row limit was hit.
///
/// Further rows are fetched on demand with `Execute(portal, fetch_size)`.
#[derive(Debug, Clone)]
pub struct SuspendedPortal {
    pub(crate) portal: PortalName,
    pub(crate) fetch_size: u32,
}

/// Accumulated rows of one statement in a result chain.
#[derive(Debug)]
pub struct ResultSet {
    fields: Arc<[Field]>,
    rows: std::collections::VecDeque<Row>,
    cursor: Option<SuspendedPortal>,
    closed: bool,
}

impl ResultSet {
    pub(crate) fn new(
        fields: Arc<[Field]>,
        rows: Vec<Row>,
        cursor: Option<SuspendedPortal>,
    ) -> ResultSet {
        ResultSet { fields, rows: rows.into(), cursor, closed: false }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub(crate) fn fields_arc(&self) -> Arc<[Field]> {
        Arc::clone(&self.fields)
    }

    /// Rows currently buffered client side.
    pub fn buffered(&self) -> usize {
        self.rows.len()
    }

    /// Take the next buffered row.
    ///
    /// When this returns `None` and [`is_complete`][ResultSet::is_complete]
    /// is false, the portal is suspended server side and
    /// [`fetch_more`][crate::statement::Statement::fetch_more] retrieves the
    /// next batch.
    pub fn next_row(&mut self) -> Option<Row> {
        if self.closed {
            return None;
        }
        self.rows.pop_front()
    }

    /// No more rows exist server side.
    pub fn is_complete(&self) -> bool {
        self.cursor.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn cursor(&self) -> Option<&SuspendedPortal> {
        self.cursor.as_ref()
    }

    pub(crate) fn append(&mut self, rows: Vec<Row>, still_suspended: bool) {
        self.rows.extend(rows);
        if !still_suspended {
            self.cursor = None;
        }
    }

    pub(crate) fn set_fetch_size(&mut self, fetch_size: u32) {
        if let Some(cursor) = &mut self.cursor {
            cursor.fetch_size = fetch_size;
        }
    }

    /// Drop the buffered rows. Returns the suspended portal, if any, so the
    /// owner can close it server side.
    pub(crate) fn close(&mut self) -> Option<PortalName> {
        self.closed = true;
        self.rows.clear();
        self.cursor.take().map(|c| c.portal)
    }
}

/// One entry of the result chain: a row stream or a completed command.
#[derive(Debug)]
pub enum ResultEnvelope {
    Rows(ResultSet),
    Command(CommandTag),
    /// The sub-statement was empty text.
    Empty,
}

impl ResultEnvelope {
    pub fn result_set(&self) -> Option<&ResultSet> {
        match self {
            ResultEnvelope::Rows(rs) if !rs.is_closed() => Some(rs),
            _ => None,
        }
    }

    pub fn result_set_mut(&mut self) -> Option<&mut ResultSet> {
        match self {
            ResultEnvelope::Rows(rs) if !rs.is_closed() => Some(rs),
            _ => None,
        }
    }

    pub fn update_count(&self) -> Option<u64> {
        match self {
            ResultEnvelope::Command(tag) => Some(tag.rows),
            _ => None,
        }
    }

    pub fn insert_oid(&self) -> Option<u64> {
        match self {
            ResultEnvelope::Command(tag) => Some(tag.insert_oid),
            _ => None,
        }
    }
}

/// Sink interface the protocol engine drives.
pub(crate) trait ResultHandler {
    fn on_rows(&mut self, fields: Arc<[Field]>, rows: Vec<Row>, cursor: Option<SuspendedPortal>);
    fn on_command_status(&mut self, tag: CommandTag);
    fn on_empty_query(&mut self);
    fn on_warning(&mut self, notice: Notice);
    fn on_error(&mut self, error: Error);
}

/// Collects envelopes for one statement execution.
#[derive(Default)]
pub(crate) struct StatementResultHandler {
    pub envelopes: Vec<ResultEnvelope>,
    pub warnings: Vec<Notice>,
    pub error: Option<Error>,
}

impl StatementResultHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultHandler for StatementResultHandler {
    fn on_rows(&mut self, fields: Arc<[Field]>, rows: Vec<Row>, cursor: Option<SuspendedPortal>) {
        self.envelopes.push(ResultEnvelope::Rows(ResultSet::new(fields, rows, cursor)));
    }

    fn on_command_status(&mut self, tag: CommandTag) {
        self.envelopes.push(ResultEnvelope::Command(tag));
    }

    fn on_empty_query(&mut self) {
        self.envelopes.push(ResultEnvelope::Empty);
    }

    fn on_warning(&mut self, notice: Notice) {
        self.warnings.push(notice);
    }

    fn on_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Collects per-entry update counts for a batch execution.
///
/// One execution may cover one batch entry (possibly composite, its
/// sub-statement counts summed) or a fused group of several entries. The
/// statement brackets each execution with
/// [`begin_entry`][BatchResultHandler::begin_entry] and
/// [`finish_entry`][BatchResultHandler::finish_entry].
pub(crate) struct BatchResultHandler {
    pub counts: Vec<i64>,
    span: usize,
    acc: u64,
    entry_failed: bool,
    pub warnings: Vec<Notice>,
    pub error: Option<Error>,
    pub first_failure: Option<usize>,
    /// Generated keys rows accumulated across entries.
    pub keys: Option<ResultSet>,
    expected: usize,
}

impl BatchResultHandler {
    pub fn new(expected: usize) -> Self {
        BatchResultHandler {
            counts: Vec::with_capacity(expected),
            span: 1,
            acc: 0,
            entry_failed: false,
            warnings: Vec::new(),
            error: None,
            first_failure: None,
            keys: None,
            expected,
        }
    }

    /// The next execution covers `entries` batch entries.
    pub fn begin_entry(&mut self, entries: usize) {
        self.span = entries;
        self.acc = 0;
        self.entry_failed = false;
    }

    /// Fold the finished execution into the per-entry counts.
    pub fn finish_entry(&mut self) {
        if self.entry_failed {
            for _ in 0..self.span {
                self.counts.push(EXECUTE_FAILED);
            }
        } else if self.span == 1 {
            self.counts.push(self.acc as i64);
        } else {
            // a fused group loses the per-entry attribution
            for _ in 0..self.span {
                self.counts.push(SUCCESS_NO_INFO);
            }
        }
        self.span = 1;
    }

    /// Pad the counts out to the full batch length with the failed sentinel.
    pub fn fail_rest(&mut self) {
        while self.counts.len() < self.expected {
            self.counts.push(EXECUTE_FAILED);
        }
    }
}

impl ResultHandler for BatchResultHandler {
    fn on_rows(&mut self, fields: Arc<[Field]>, rows: Vec<Row>, _: Option<SuspendedPortal>) {
        // generated-keys rows; merged into one result set across entries
        match &mut self.keys {
            Some(keys) => keys.append(rows, false),
            None => self.keys = Some(ResultSet::new(fields, rows, None)),
        }
    }

    fn on_command_status(&mut self, tag: CommandTag) {
        self.acc += tag.rows;
    }

    fn on_empty_query(&mut self) {}

    fn on_warning(&mut self, notice: Notice) {
        self.warnings.push(notice);
    }

    fn on_error(&mut self, error: Error) {
        self.entry_failed = true;
        if self.error.is_none() {
            self.first_failure = Some(self.counts.len());
            self.error = Some(error);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_tag_forms() {
        let t = CommandTag::parse("INSERT 0 5");
        assert_eq!(t.command, "INSERT");
        assert_eq!(t.rows, 5);
        assert_eq!(t.insert_oid, 0);

        let t = CommandTag::parse("UPDATE 3");
        assert_eq!(t.rows, 3);

        let t = CommandTag::parse("SELECT 12");
        assert_eq!(t.rows, 12);

        let t = CommandTag::parse("BEGIN");
        assert_eq!(t.rows, 0);

        let t = CommandTag::parse("CREATE TABLE");
        assert_eq!(t.command, "CREATE");
        assert_eq!(t.rows, 0);
    }

    #[test]
    fn batch_handler_fused_and_plain_entries() {
        let mut handler = BatchResultHandler::new(5);

        // one fused execution covering three entries
        handler.begin_entry(3);
        handler.on_command_status(CommandTag::parse("INSERT 0 3"));
        handler.finish_entry();

        // two plain executions
        handler.begin_entry(1);
        handler.on_command_status(CommandTag::parse("INSERT 0 1"));
        handler.finish_entry();
        handler.begin_entry(1);
        handler.on_command_status(CommandTag::parse("INSERT 0 1"));
        handler.finish_entry();

        assert_eq!(
            handler.counts,
            vec![SUCCESS_NO_INFO, SUCCESS_NO_INFO, SUCCESS_NO_INFO, 1, 1]
        );
    }

    #[test]
    fn batch_handler_sums_composite_entry() {
        let mut handler = BatchResultHandler::new(1);
        handler.begin_entry(1);
        handler.on_command_status(CommandTag::parse("INSERT 0 2"));
        handler.on_command_status(CommandTag::parse("INSERT 0 1"));
        handler.on_command_status(CommandTag::parse("INSERT 0 3"));
        handler.finish_entry();
        assert_eq!(handler.counts, vec![6]);
    }

    #[test]
    fn batch_handler_failure_sentinel() {
        let mut handler = BatchResultHandler::new(3);

        handler.begin_entry(1);
        handler.on_command_status(CommandTag::parse("INSERT 0 1"));
        handler.finish_entry();

        handler.begin_entry(1);
        handler.on_error(crate::error::ErrorKind::NoData.into());
        handler.finish_entry();

        handler.fail_rest();

        assert_eq!(handler.first_failure, Some(1));
        assert_eq!(handler.counts, vec![1, EXECUTE_FAILED, EXECUTE_FAILED]);
    }
}
