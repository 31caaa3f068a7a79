//! Postgres protocol operations.
//!
//! Drives the extended-query state machine for one execution: writes
//! Parse/Bind/Describe/Execute/Sync against a [`PgTransport`], then reads the
//! reply stream and dispatches it into a [`ResultHandler`]. The engine never
//! interprets SQL; it passes bytes through and relies on the server for
//! errors.
use std::{collections::VecDeque, sync::Arc};

use crate::{
    Result,
    cache::CachedQuery,
    common::{span, verbose},
    encode::Encoded,
    handler::{CommandTag, ResultHandler, SuspendedPortal},
    postgres::{Oid, PgFormat, backend, frontend},
    row::{Field, Row},
    statement::{PortalName, StatementName},
    transport::{DeferredClose, PgTransport, PgTransportExt},
};

/// Per-execution behavior flags.
///
/// A plain bit set; combining is `|`, querying is
/// [`contains`][ExecFlags::contains].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecFlags(u32);

impl ExecFlags {
    pub const NONE: ExecFlags = ExecFlags(0);
    /// The caller expects no result sets.
    pub const NO_RESULTS: ExecFlags = ExecFlags(1 << 0);
    /// Skip promotion bookkeeping; the query will not be reused.
    pub const ONESHOT: ExecFlags = ExecFlags(1 << 1);
    /// Fetch through a held portal in `fetch_size` batches.
    pub const FORWARD_CURSOR: ExecFlags = ExecFlags(1 << 2);
    /// Deliver both the rows and the command status of each sub-statement.
    pub const BOTH_ROWS_AND_STATUS: ExecFlags = ExecFlags(1 << 3);
    /// Do not open a transaction block implicitly.
    pub const SUPPRESS_BEGIN: ExecFlags = ExecFlags(1 << 4);
    /// Open the implicit transaction block `READ ONLY`.
    pub const READ_ONLY_HINT: ExecFlags = ExecFlags(1 << 5);
    /// Force text transfer for result rows.
    pub const NO_BINARY_TRANSFER: ExecFlags = ExecFlags(1 << 6);
    /// Use the simple `Query` message with literal substitution.
    pub const EXECUTE_AS_SIMPLE: ExecFlags = ExecFlags(1 << 7);
    /// Only describe the statement; do not bind or execute.
    pub const DESCRIBE_ONLY: ExecFlags = ExecFlags(1 << 8);
    /// Describe the portal even when the statement was already described.
    pub const FORCE_DESCRIBE_PORTAL: ExecFlags = ExecFlags(1 << 9);

    pub fn contains(self, other: ExecFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: ExecFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ExecFlags {
    type Output = ExecFlags;

    fn bitor(self, rhs: ExecFlags) -> ExecFlags {
        ExecFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ExecFlags {
    fn bitor_assign(&mut self, rhs: ExecFlags) {
        self.0 |= rhs.0;
    }
}

/// One execution request against the engine.
pub(crate) struct ExecuteInput<'a> {
    pub query: &'a CachedQuery,
    /// Bound values for the whole slot space, indexed by slot - 1.
    pub params: &'a [Encoded<'static>],
    pub flags: ExecFlags,
    /// Row limit for non-cursor executions; zero is unlimited.
    pub max_rows: u32,
    /// Per-`Execute` row limit in cursor mode.
    pub fetch_size: u32,
    /// Execute against this named server-side statement.
    pub stmt_name: Option<StatementName>,
    /// The named statement still needs its `Parse`.
    pub parse_needed: bool,
}

const SAVEPOINT_SQL: &str = "SAVEPOINT pgexec_savepoint";

/// Run one execution and feed its results into `handler`.
///
/// On a server error the engine records it in the handler, consumes the
/// stream through the next `ReadyForQuery`, and returns `Ok`; the caller
/// decides whether the error aborts or the batch continues.
pub(crate) async fn execute<C: PgTransport>(
    io: &mut C,
    input: ExecuteInput<'_>,
    handler: &mut dyn ResultHandler,
) -> Result<()> {
    span!("execute");
    if input.flags.contains(ExecFlags::EXECUTE_AS_SIMPLE) {
        return execute_simple(io, input, handler).await;
    }
    execute_extended(io, input, handler).await
}

/// Whether this execution should open a transaction block first.
fn needs_begin<C: PgTransport>(io: &C, flags: ExecFlags) -> bool {
    !flags.contains(ExecFlags::SUPPRESS_BEGIN) && io.tx_status() == b'I'
}

/// Whether to guard the execution with a savepoint, per the `auto_save`
/// setting.
fn needs_savepoint<C: PgTransport>(io: &C, input: &ExecuteInput<'_>, begin: bool) -> bool {
    use crate::connection::AutoSave::*;
    let in_txn = begin || io.tx_status() == b'T';
    if !in_txn || input.flags.contains(ExecFlags::SUPPRESS_BEGIN) {
        return false;
    }
    match io.options().auto_save {
        Never => false,
        // a reused server-prepared statement can fail with a stale plan,
        // which retry heals only if the transaction survived
        Conservative => input.stmt_name.is_some() && !input.parse_needed,
        Always => true,
    }
}

fn flush_deferred_closes<C: PgTransport>(io: &mut C) {
    for close in io.take_deferred_closes() {
        match close {
            DeferredClose::Statement(name) => {
                verbose!("deferred close statement {name}");
                io.send(frontend::Close { variant: b'S', name: name.as_str() });
            }
            DeferredClose::Portal(name) => {
                verbose!("deferred close portal {name}");
                io.send(frontend::Close { variant: b'P', name: name.as_str() });
            }
        }
    }
}

/// Send an internal statement through the unnamed extended path.
fn send_internal<C: PgTransport>(io: &mut C, sql: &str) {
    io.send(frontend::Parse { prepare_name: "", sql, oids: &[] });
    io.send(frontend::Bind {
        portal_name: "",
        stmt_name: "",
        params: &[],
        result_format: PgFormat::Text,
    });
    io.send(frontend::Execute { portal_name: "", max_row: 0 });
}

async fn execute_extended<C: PgTransport>(
    io: &mut C,
    input: ExecuteInput<'_>,
    handler: &mut dyn ResultHandler,
) -> Result<()> {
    let query = input.query.query();
    let describe_only = input.flags.contains(ExecFlags::DESCRIBE_ONLY);

    // deferred server-side closes ride in front of the real work
    flush_deferred_closes(io);

    // None entries are internal statements whose ParseComplete carries no
    // promotion; Some entries promote the named statement on success.
    let mut pending_parses: VecDeque<Option<(StatementName, Vec<Oid>)>> = VecDeque::new();
    let mut swallow_statuses = 0usize;

    let begin = needs_begin(io, input.flags);
    if begin && !describe_only {
        let begin_sql = match input.flags.contains(ExecFlags::READ_ONLY_HINT) {
            true => "BEGIN READ ONLY",
            false => "BEGIN",
        };
        send_internal(io, begin_sql);
        pending_parses.push_back(None);
        swallow_statuses += 1;
    }
    if needs_savepoint(io, &input, begin) && !describe_only {
        send_internal(io, SAVEPOINT_SQL);
        pending_parses.push_back(None);
        swallow_statuses += 1;
    }

    let result_format = match input.stmt_name.is_some()
        && io.options().force_binary
        && !input.flags.contains(ExecFlags::NO_BINARY_TRANSFER)
    {
        true => PgFormat::Binary,
        false => PgFormat::Text,
    };

    let cursor_portal = match input.flags.contains(ExecFlags::FORWARD_CURSOR) {
        true => Some(PortalName::next()),
        false => None,
    };

    for sub in query.subqueries() {
        let sub_sql = query.sub_sql(sub);
        let bind_count = sub.param_slots().iter().copied().max().unwrap_or(0);
        let params = &input.params[..bind_count.min(input.params.len())];
        let oids: Vec<Oid> = params.iter().map(Encoded::oid).collect();

        let stmt = match &input.stmt_name {
            Some(name) => {
                if input.parse_needed {
                    io.send(frontend::Parse {
                        prepare_name: name.as_str(),
                        sql: sub_sql,
                        oids: &oids,
                    });
                    pending_parses.push_back(Some((name.clone(), oids.clone())));
                }
                name.as_str()
            }
            None => {
                io.send(frontend::Parse { prepare_name: "", sql: sub_sql, oids: &oids });
                pending_parses.push_back(None);
                ""
            }
        };

        if describe_only {
            io.send(frontend::Describe { kind: b'S', name: stmt });
            continue;
        }

        let portal = cursor_portal.as_ref().map(|p| p.as_str()).unwrap_or("");
        io.send(frontend::Bind {
            portal_name: portal,
            stmt_name: stmt,
            params,
            result_format,
        });

        // row-less executions skip the portal describe, except where a
        // re-described portal is forced for named statements
        let skip_describe = input.flags.contains(ExecFlags::NO_RESULTS)
            && !input.flags.contains(ExecFlags::FORCE_DESCRIBE_PORTAL)
            && !input.flags.contains(ExecFlags::BOTH_ROWS_AND_STATUS);
        if !skip_describe {
            io.send(frontend::Describe { kind: b'P', name: portal });
        }

        let max_row = match &cursor_portal {
            Some(_) => input.fetch_size,
            None => input.max_rows,
        };
        io.send(frontend::Execute { portal_name: portal, max_row });
    }

    io.send(frontend::Sync);
    io.flush().await?;

    read_results(
        io,
        handler,
        ReadContext {
            flags: input.flags,
            cursor_portal,
            fetch_size: input.fetch_size,
            promote_to: Some(input.query),
            pending_parses,
            swallow_statuses,
        },
    )
    .await
}

/// Roll the transaction back to the statement savepoint, for the
/// retry-once path.
pub(crate) async fn rollback_to_savepoint<C: PgTransport>(io: &mut C) -> Result<()> {
    io.send(frontend::Query { sql: "ROLLBACK TO SAVEPOINT pgexec_savepoint" });
    io.ready_request();
    io.ready().await
}

async fn execute_simple<C: PgTransport>(
    io: &mut C,
    input: ExecuteInput<'_>,
    handler: &mut dyn ResultHandler,
) -> Result<()> {
    let query = input.query.query();

    // deferred closes cannot ride a simple Query; run them as their own
    // extended round first
    let deferred = io.take_deferred_closes();
    if !deferred.is_empty() {
        for close in deferred {
            match close {
                DeferredClose::Statement(name) => {
                    io.send(frontend::Close { variant: b'S', name: name.as_str() });
                }
                DeferredClose::Portal(name) => {
                    io.send(frontend::Close { variant: b'P', name: name.as_str() });
                }
            }
        }
        io.send(frontend::Sync);
        io.ready_request();
    }

    let mut swallow_statuses = 0usize;
    let mut sql = String::with_capacity(query.sql().len());
    if needs_begin(io, input.flags) {
        match input.flags.contains(ExecFlags::READ_ONLY_HINT) {
            true => sql.push_str("BEGIN READ ONLY;"),
            false => sql.push_str("BEGIN;"),
        }
        swallow_statuses += 1;
    }
    substitute_literals(query.sql(), input.params, &mut sql);

    io.send(frontend::Query { sql: &sql });
    io.flush().await?;

    read_results(
        io,
        handler,
        ReadContext {
            flags: input.flags,
            cursor_portal: None,
            fetch_size: 0,
            promote_to: None,
            pending_parses: VecDeque::new(),
            swallow_statuses,
        },
    )
    .await
}

/// Replace every `$n` of rewritten text with the bound value as a literal.
fn substitute_literals(text: &str, params: &[Encoded<'static>], out: &mut String) {
    use crate::sql::scan::Scanner;

    let mut scan = Scanner::new(text);
    while !scan.is_eof() {
        if let Some(range) = scan.skip_quoted() {
            out.push_str(&text[range]);
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
            match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(value) => out.push_str(&value.to_sql_literal()),
                // left as-is, the server reports the missing parameter
                None => {
                    out.push('$');
                    let mut buf = itoa::Buffer::new();
                    out.push_str(buf.format(n));
                }
            }
        } else {
            out.push(b as char);
            scan.pos += 1;
        }
    }
}

struct ReadContext<'a> {
    flags: ExecFlags,
    cursor_portal: Option<PortalName>,
    fetch_size: u32,
    promote_to: Option<&'a CachedQuery>,
    pending_parses: VecDeque<Option<(StatementName, Vec<Oid>)>>,
    swallow_statuses: usize,
}

/// Drive the reply stream into the handler until `ReadyForQuery`.
async fn read_results<C: PgTransport>(
    io: &mut C,
    handler: &mut dyn ResultHandler,
    mut ctx: ReadContext<'_>,
) -> Result<()> {
    let mut fields: Option<Arc<[Field]>> = None;
    let mut rows: Vec<Row> = Vec::new();
    let mut errored = false;

    loop {
        use backend::BackendMessage::*;
        let message = match io.recv().await {
            Ok(message) => message,
            Err(err) => {
                // server skips to Sync after an error; consume through the
                // ReadyForQuery before surfacing it
                handler.on_error(err);
                errored = true;
                io.ready().await?;
                break;
            }
        };
        match message {
            ParseComplete(_) => {
                if let Some(Some((name, oids))) = ctx.pending_parses.pop_front() {
                    if let Some(query) = ctx.promote_to {
                        verbose!("promoted to server statement {name}");
                        query.promote(name, oids);
                    }
                }
            }
            BindComplete(_) | CloseComplete(_) | NoData(_) => {}
            ParameterDescription(_) => {}
            RowDescription(rd) => {
                fields = Some(Field::parse_row_description(rd.body)?);
                rows = Vec::new();
            }
            DataRow(dr) => match &fields {
                Some(fields) => rows.push(Row::parse(Arc::clone(fields), dr.body)),
                None => Err(crate::postgres::ProtocolError::unexpected_phase(
                    backend::DataRow::MSGTYPE,
                    "data row without row description",
                ))?,
            },
            CommandComplete(c) => {
                let tag = CommandTag::parse(&c.tag);
                if ctx.swallow_statuses > 0 {
                    ctx.swallow_statuses -= 1;
                    continue;
                }
                match fields.take() {
                    Some(fields) => {
                        let both = ctx.flags.contains(ExecFlags::BOTH_ROWS_AND_STATUS);
                        handler.on_rows(fields, std::mem::take(&mut rows), None);
                        if both {
                            handler.on_command_status(tag);
                        }
                    }
                    None => handler.on_command_status(tag),
                }
            }
            PortalSuspended(_) => {
                // only reachable with a row limit; in cursor mode the portal
                // stays live for later Execute rounds
                let cursor = ctx.cursor_portal.clone().map(|portal| SuspendedPortal {
                    portal,
                    fetch_size: ctx.fetch_size,
                });
                match fields.take() {
                    Some(fields) => handler.on_rows(fields, std::mem::take(&mut rows), cursor),
                    None => {}
                }
            }
            EmptyQueryResponse(_) => handler.on_empty_query(),
            ReadyForQuery(r) => {
                io.set_tx_status(r.tx_status);
                break;
            }
            f => Err(f.unexpected("query result stream"))?,
        }
    }

    // a described-only statement leaves its row description undelivered;
    // rows interrupted by an error are discarded with it
    if !errored {
        if let Some(fields) = fields.take() {
            handler.on_rows(fields, rows, None);
        }
    }

    for notice in io.take_notices() {
        handler.on_warning(notice);
    }

    Ok(())
}

/// Fetch the next batch of rows from a suspended portal.
///
/// Returns the rows and whether the portal is still suspended.
pub(crate) async fn fetch_portal<C: PgTransport>(
    io: &mut C,
    fields: Arc<[Field]>,
    portal: &PortalName,
    fetch_size: u32,
) -> Result<(Vec<Row>, bool)> {
    io.send(frontend::Execute { portal_name: portal.as_str(), max_row: fetch_size });
    io.send(frontend::Sync);
    io.flush().await?;

    let mut rows = Vec::new();
    let mut suspended = false;

    loop {
        use backend::BackendMessage::*;
        match io.recv().await {
            Err(err) => {
                io.ready().await?;
                return Err(err);
            }
            Ok(DataRow(dr)) => rows.push(Row::parse(Arc::clone(&fields), dr.body)),
            Ok(PortalSuspended(_)) => suspended = true,
            Ok(CommandComplete(_)) => suspended = false,
            Ok(ReadyForQuery(r)) => {
                io.set_tx_status(r.tx_status);
                break;
            }
            Ok(f) => Err(f.unexpected("portal fetch"))?,
        }
    }

    Ok((rows, suspended))
}

/// Double the cursor fetch size, bounded by the observed row width and the
/// configured memory budget.
pub(crate) fn adaptive_fetch_size(current: u32, rows: &[Row], budget: usize) -> u32 {
    if rows.is_empty() {
        return current.saturating_mul(2);
    }
    let widest = rows.iter().map(Row::byte_size).max().unwrap_or(1).max(1);
    let cap = (budget / widest).max(1) as u32;
    current.saturating_mul(2).min(cap)
}

/// A lazy, finite, non-restartable sequence of rows.
///
/// Buffered rows are yielded first; when the backing portal is suspended the
/// stream drives further `Execute(portal, fetch_size)` rounds on demand.
/// The stream must be polled to completion (or dropped only between rounds),
/// otherwise it will disturb the subsequent query.
#[must_use = "streams do nothing unless polled"]
pub struct RowStream<'c, C: PgTransport> {
    io: &'c mut C,
    fields: Arc<[Field]>,
    rows: std::collections::VecDeque<Row>,
    portal: Option<PortalName>,
    fetch_size: u32,
    phase: StreamPhase,
}

enum StreamPhase {
    Idle,
    Flush,
    Recv,
    Done,
}

impl<'c, C: PgTransport> RowStream<'c, C> {
    pub(crate) fn new(io: &'c mut C, result: crate::handler::ResultSet) -> RowStream<'c, C> {
        let fields = result.fields_arc();
        let fetch_size = result.cursor().map(|c| c.fetch_size).unwrap_or(0);
        let mut stream = RowStream {
            io,
            fields,
            rows: Default::default(),
            portal: None,
            fetch_size,
            phase: StreamPhase::Idle,
        };
        stream.load(result);
        stream
    }

    fn load(&mut self, mut result: crate::handler::ResultSet) {
        while let Some(row) = result.next_row() {
            self.rows.push_back(row);
        }
        self.portal = result.close();
    }
}

impl<C: PgTransport> futures_core::Stream for RowStream<'_, C> {
    type Item = Result<Row>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::{Poll, ready};

        let me = self.get_mut();
        loop {
            if let Some(row) = me.rows.pop_front() {
                return Poll::Ready(Some(Ok(row)));
            }

            match me.phase {
                StreamPhase::Done => return Poll::Ready(None),
                StreamPhase::Idle => {
                    let Some(portal) = &me.portal else {
                        me.phase = StreamPhase::Done;
                        continue;
                    };
                    me.io.send(frontend::Execute {
                        portal_name: portal.as_str(),
                        max_row: me.fetch_size,
                    });
                    me.io.send(frontend::Sync);
                    me.phase = StreamPhase::Flush;
                }
                StreamPhase::Flush => {
                    ready!(me.io.poll_flush(cx)?);
                    me.phase = StreamPhase::Recv;
                }
                StreamPhase::Recv => {
                    use backend::BackendMessage::*;
                    match ready!(me.io.poll_recv(cx)) {
                        Ok(DataRow(dr)) => {
                            me.rows.push_back(Row::parse(Arc::clone(&me.fields), dr.body));
                        }
                        Ok(PortalSuspended(_)) => {}
                        Ok(CommandComplete(_)) => {
                            me.portal = None;
                        }
                        Ok(ReadyForQuery(r)) => {
                            me.io.set_tx_status(r.tx_status);
                            me.phase = match me.portal {
                                Some(_) => StreamPhase::Idle,
                                None => StreamPhase::Done,
                            };
                        }
                        Ok(f) => {
                            me.phase = StreamPhase::Done;
                            return Poll::Ready(Some(Err(f.unexpected("row stream").into())));
                        }
                        Err(err) => {
                            me.phase = StreamPhase::Done;
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
            }
        }
    }
}
