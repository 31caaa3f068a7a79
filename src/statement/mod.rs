//! The user-facing statement executor.
//!
//! A [`Statement`] owns batch state, cancellation state, the timeout timer,
//! and the most recent result chain. It orchestrates the rewriter, the query
//! cache, the protocol engine and the result handlers. All mutating
//! operations go through `&mut self`; one statement never has two in-flight
//! executions.
mod name;

pub use name::{Id, PortalName, StatementName};

use std::{sync::Arc, time::Duration};

use crate::{
    Result,
    cache::{CacheKey, CachedQuery, QueryCache},
    cancel::{CancelToken, TimeoutTimer},
    connection::PreferQueryMode,
    encode::{Encode, Encoded},
    error::{BatchError, Error, ErrorKind},
    handler::{
        BatchResultHandler, ResultEnvelope, ResultHandler, ResultSet, StatementResultHandler,
    },
    params::ParameterList,
    postgres::{Notice, Oid},
    protocol::{self, ExecFlags, ExecuteInput},
    row::Field,
    sql::{ReturningSpec, RewriteOptions, Sql, rewrite},
    transport::{DeferredClose, PgTransport},
};

/// The batch entry succeeded but the number of affected rows is unknown.
pub const SUCCESS_NO_INFO: i64 = -2;
/// The batch entry failed.
pub const EXECUTE_FAILED: i64 = -3;

/// How [`Statement::more_results`] treats the result it moves past.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    CloseCurrent,
    KeepCurrent,
    CloseAll,
}

/// One SQL executor bound to a connection.
///
/// Simple statements take SQL text per call; prepared (and callable)
/// statements are bound to one cached query and carry a parameter list.
pub struct Statement<C: PgTransport> {
    link: C,
    kind: StatementKind,
    batch: Vec<BatchEntry>,
    chain: ResultChain,
    generated_keys: Option<ResultEnvelope>,
    warnings: Vec<Notice>,

    fetch_size: u32,
    max_rows: u32,
    timeout: Duration,
    prepare_threshold: u32,
    force_binary: bool,
    adaptive_fetch: bool,
    escape_processing: bool,

    close_on_completion: bool,
    closed: bool,

    /// Generated keys requested for the next execution only.
    wants_keys_once: ReturningSpec,
    /// Generated keys requested for every execution, set at prepare time.
    wants_keys_always: ReturningSpec,
}

enum StatementKind {
    Simple,
    Prepared(PreparedData),
    Callable(PreparedData),
}

struct PreparedData {
    query: CachedQuery,
    /// The query was borrowed from the connection cache and must be released.
    borrowed: bool,
    params: ParameterList,
}

enum BatchEntry {
    /// A plain SQL entry queued on a simple statement.
    Sql(CachedQuery),
    /// A snapshot of the parameter list on a prepared statement.
    Params(ParameterList),
}

impl<C: PgTransport> Statement<C> {
    /// A simple statement: SQL is passed per execution and placeholders are
    /// not substituted.
    pub fn new(link: C) -> Statement<C> {
        let fetch_size = link.options().default_fetch_size;
        let prepare_threshold = link.options().prepare_threshold;
        let force_binary = link.options().force_binary;
        let adaptive_fetch = link.options().adaptive_fetch;
        let escape_processing = link.options().escape_processing;
        Statement {
            fetch_size,
            max_rows: 0,
            timeout: Duration::ZERO,
            prepare_threshold,
            force_binary,
            adaptive_fetch,
            escape_processing,
            link,
            kind: StatementKind::Simple,
            batch: Vec::new(),
            chain: ResultChain::default(),
            generated_keys: None,
            warnings: Vec::new(),
            close_on_completion: false,
            closed: false,
            wants_keys_once: ReturningSpec::None,
            wants_keys_always: ReturningSpec::None,
        }
    }

    /// A prepared statement bound to `sql`.
    pub fn prepare(link: C, sql: impl Sql) -> Result<Statement<C>> {
        Self::prepare_returning(link, sql, ReturningSpec::None)
    }

    /// A prepared statement that returns generated keys on every execution.
    pub fn prepare_returning(
        mut link: C,
        sql: impl Sql,
        keys: ReturningSpec,
    ) -> Result<Statement<C>> {
        let data = Self::bind_query(&mut link, sql, keys.clone())?;
        let mut statement = Statement::new(link);
        statement.kind = StatementKind::Prepared(data);
        statement.wants_keys_always = keys;
        Ok(statement)
    }

    /// A callable statement for `{call f(...)}` escapes; behaves as a
    /// prepared statement with the executor's bind/describe/execute set.
    pub fn prepare_call(mut link: C, sql: impl Sql) -> Result<Statement<C>> {
        let data = Self::bind_query(&mut link, sql, ReturningSpec::None)?;
        let mut statement = Statement::new(link);
        statement.kind = StatementKind::Callable(data);
        Ok(statement)
    }

    fn bind_query(link: &mut C, sql: impl Sql, keys: ReturningSpec) -> Result<PreparedData> {
        let options = RewriteOptions {
            style: link.options().placeholder_style,
            escape_processing: link.options().escape_processing,
            parameterized: true,
            returning: keys,
        };
        let key = CacheKey { sql: sql.sql().trim().to_owned(), options };

        let (query, borrowed) = match sql.persistent() {
            true => {
                let (query, closes) =
                    link.query_cache().borrow(key, |k| rewrite(&k.sql, &k.options))?;
                for close in closes {
                    link.defer_close(DeferredClose::Statement(close));
                }
                (query, true)
            }
            false => (QueryCache::detached(key, |k| rewrite(&k.sql, &k.options))?, false),
        };

        let params = ParameterList::with_names(query.query().param_count(), query.query().names());
        Ok(PreparedData { query, borrowed, params })
    }

    fn check_closed(&self) -> Result<()> {
        match self.closed {
            true => Err(ErrorKind::Closed.into()),
            false => Ok(()),
        }
    }

    fn prepared(&mut self) -> Result<&mut PreparedData> {
        match &mut self.kind {
            StatementKind::Prepared(data) | StatementKind::Callable(data) => Ok(data),
            StatementKind::Simple => Err(ErrorKind::InvalidParameterValue(
                "statement is not prepared; bind values through prepare()".into(),
            )
            .into()),
        }
    }

    // ===== parameter binding =====

    /// Bind a value to a 1-based parameter slot.
    pub fn set<V: Encode<'static>>(&mut self, index: usize, value: V) -> Result<()> {
        self.check_closed()?;
        self.prepared()?.params.bind(index, value)
    }

    /// Bind a value by placeholder name, for NAMED style queries.
    pub fn set_named<V: Encode<'static>>(&mut self, name: &str, value: V) -> Result<()> {
        self.check_closed()?;
        self.prepared()?.params.bind_named(name, value)
    }

    /// Bind the SQL `NULL` with an explicit type oid.
    pub fn set_null(&mut self, index: usize, oid: Oid) -> Result<()> {
        self.check_closed()?;
        self.prepared()?.params.bind_null(index, oid)
    }

    /// Mark every parameter slot unbound.
    pub fn clear_parameters(&mut self) -> Result<()> {
        self.check_closed()?;
        self.prepared()?.params.clear();
        Ok(())
    }

    // ===== execution =====

    /// Execute a SQL string, possibly multi-statement.
    ///
    /// Returns `true` when the first result is a row set.
    pub async fn execute_text(&mut self, sql: impl Sql) -> Result<bool> {
        self.execute_text_flags(sql, ExecFlags::NONE).await?;
        Ok(self.chain.current().is_some_and(|e| e.result_set().is_some()))
    }

    /// Execute a SQL string and require a single row-set result.
    pub async fn execute_query(&mut self, sql: impl Sql) -> Result<&mut ResultSet> {
        if !self.execute_text(sql).await? {
            return Err(ErrorKind::NoData.into());
        }
        self.single_result_set()
    }

    /// Execute a SQL string and require no row-set results; returns the
    /// first update count.
    pub async fn execute_update(&mut self, sql: impl Sql) -> Result<u64> {
        self.execute_text_flags(sql, ExecFlags::NO_RESULTS).await?;
        self.check_no_result_update()?;
        Ok(self.update_count().unwrap_or(0))
    }

    /// Like [`execute_update`][Statement::execute_update], capturing
    /// generated keys per `keys`.
    pub async fn execute_update_returning(
        &mut self,
        sql: impl Sql,
        keys: ReturningSpec,
    ) -> Result<u64> {
        self.wants_keys_once = keys;
        self.execute_text_flags(sql, ExecFlags::NONE).await?;
        Ok(self.update_count().unwrap_or(0))
    }

    /// Returning generated keys by column index is not supported by the
    /// wire protocol's RETURNING projection.
    pub fn execute_update_returning_indexes(&mut self, _sql: &str, _indexes: &[u32]) -> Result<u64> {
        Err(ErrorKind::NotImplemented("returning autogenerated keys by column index").into())
    }

    async fn execute_text_flags(&mut self, sql: impl Sql, flags: ExecFlags) -> Result<()> {
        self.check_closed()?;

        let keys = std::mem::replace(&mut self.wants_keys_once, ReturningSpec::None);
        let options = RewriteOptions {
            style: self.link.options().placeholder_style,
            escape_processing: self.escape_processing,
            // plain statements do not substitute placeholders
            parameterized: false,
            returning: keys.clone(),
        };
        let key = CacheKey { sql: sql.sql().trim().to_owned(), options };

        let cache_text =
            self.link.options().prefer_query_mode == PreferQueryMode::ExtendedCacheEverything;
        let (query, borrowed) = match cache_text && sql.persistent() {
            true => {
                let (query, closes) =
                    self.link.query_cache().borrow(key, |k| rewrite(&k.sql, &k.options))?;
                for close in closes {
                    self.link.defer_close(DeferredClose::Statement(close));
                }
                (query, true)
            }
            false => (QueryCache::detached(key, |k| rewrite(&k.sql, &k.options))?, false),
        };

        let result = self.execute_with_retry(&query, &ParameterList::new(0), keys, flags).await;
        if borrowed {
            self.link.query_cache().release(&query);
        }
        result
    }

    /// Execute the bound query with the currently bound parameters.
    ///
    /// Returns `true` when the first result is a row set.
    pub async fn execute_prepared(&mut self) -> Result<bool> {
        self.execute_prepared_flags(ExecFlags::NONE).await
    }

    async fn execute_prepared_flags(&mut self, flags: ExecFlags) -> Result<bool> {
        self.check_closed()?;
        let data = self.prepared()?;
        let query = data.query.clone();
        let params = data.params.duplicate();
        let keys = match std::mem::replace(&mut self.wants_keys_once, ReturningSpec::None) {
            ReturningSpec::None => self.wants_keys_always.clone(),
            once => once,
        };

        self.execute_with_retry(&query, &params, keys, flags).await?;
        Ok(self.chain.current().is_some_and(|e| e.result_set().is_some()))
    }

    /// Execute the bound query and require a single row-set result.
    pub async fn query_prepared(&mut self) -> Result<&mut ResultSet> {
        if !self.execute_prepared().await? {
            return Err(ErrorKind::NoData.into());
        }
        self.single_result_set()
    }

    /// Execute the bound query and require no row-set results.
    pub async fn update_prepared(&mut self) -> Result<u64> {
        self.execute_prepared_flags(ExecFlags::NO_RESULTS).await?;
        self.check_no_result_update()?;
        Ok(self.update_count().unwrap_or(0))
    }

    /// Round-trip a `Describe` of the bound query without executing it,
    /// returning the result field descriptors (empty for a row-less
    /// statement).
    pub async fn describe_prepared(&mut self) -> Result<Vec<Field>> {
        self.check_closed()?;
        let query = self.prepared()?.query.clone();
        self.execute_once(
            &query,
            &ParameterList::new(0),
            ReturningSpec::None,
            ExecFlags::DESCRIBE_ONLY,
        )
        .await?;
        query.set_described();

        let fields = match self.chain.current() {
            Some(ResultEnvelope::Rows(rs)) => rs.fields().to_vec(),
            _ => Vec::new(),
        };
        Ok(fields)
    }

    /// A failed non-composite execution whose error is expected to heal is
    /// retried exactly once, after closing and re-preparing the cached plan.
    async fn execute_with_retry(
        &mut self,
        query: &CachedQuery,
        params: &ParameterList,
        keys: ReturningSpec,
        flags: ExecFlags,
    ) -> Result<()> {
        match self.execute_once(query, params, keys.clone(), flags).await {
            Err(err)
                if !query.query().is_composite()
                    && err.will_heal_on_retry()
                    && self.retry_permitted() =>
            {
                if let Some(name) = query.take_server_name() {
                    self.link.defer_close(DeferredClose::Statement(name));
                }
                if self.link.tx_status() == b'E' {
                    protocol::rollback_to_savepoint(&mut self.link).await?;
                }
                self.execute_once(query, params, keys, flags).await
            }
            other => other,
        }
    }

    fn retry_permitted(&self) -> bool {
        use crate::connection::AutoSave;
        match self.link.tx_status() {
            // an implicit transaction already rolled back; retry is clean
            b'I' => true,
            // inside a transaction a retry only works from a savepoint
            _ => self.link.options().auto_save != AutoSave::Never,
        }
    }

    async fn execute_once(
        &mut self,
        query: &CachedQuery,
        params: &ParameterList,
        keys: ReturningSpec,
        mut flags: ExecFlags,
    ) -> Result<()> {
        // local failures surface before any bytes go on the wire
        let bound = params.bound()?;
        let oids: Vec<Oid> = bound.iter().map(Encoded::oid).collect();

        let wants_keys = keys.wants_keys();
        if wants_keys {
            flags |= ExecFlags::BOTH_ROWS_AND_STATUS;
            flags.remove(ExecFlags::NO_RESULTS);
        }

        // a composite query would rebind the held portal per sub-statement
        if self.fetch_size > 0 && !self.link.options().autocommit && !query.query().is_composite() {
            flags |= ExecFlags::FORWARD_CURSOR;
        }
        if self.link.options().autocommit || query.query().is_empty() {
            flags |= ExecFlags::SUPPRESS_BEGIN;
        }
        if self.link.options().read_only_hint {
            flags |= ExecFlags::READ_ONLY_HINT;
        }
        // a describe round-trip has no simple-protocol equivalent
        if self.simple_mode() && !flags.contains(ExecFlags::DESCRIBE_ONLY) {
            flags |= ExecFlags::EXECUTE_AS_SIMPLE;
        }
        if self.is_one_shot(query) {
            flags |= ExecFlags::ONESHOT;
        }

        // forced binary transfer needs the parameter and column types known
        // up front, so an undescribed statement gets a describe round first
        if self.force_binary
            && !query.is_described()
            && !flags.contains(ExecFlags::EXECUTE_AS_SIMPLE)
            && !flags.contains(ExecFlags::DESCRIBE_ONLY)
        {
            let mut describe = StatementResultHandler::new();
            protocol::execute(
                &mut self.link,
                ExecuteInput {
                    query,
                    params: &bound,
                    flags: flags | ExecFlags::DESCRIBE_ONLY,
                    max_rows: 0,
                    fetch_size: 0,
                    stmt_name: None,
                    parse_needed: false,
                },
                &mut describe,
            )
            .await?;
            if let Some(error) = describe.error {
                return Err(error);
            }
            query.set_described();
        }

        let (stmt_name, parse_needed) = self.named_path(query, &oids, flags);

        self.close_for_next_execution();

        let shared = Arc::clone(self.link.cancel_shared());
        shared.start_execute();
        let timer = (!self.timeout.is_zero()).then(|| TimeoutTimer::arm(&shared, self.timeout));

        let mut handler = StatementResultHandler::new();
        let run = protocol::execute(
            &mut self.link,
            ExecuteInput {
                query,
                params: &bound,
                flags,
                max_rows: self.max_rows,
                fetch_size: self.fetch_size,
                stmt_name,
                parse_needed,
            },
            &mut handler,
        )
        .await;

        if let Some(timer) = timer {
            timer.disarm();
        }
        let timed_out = shared.took_timeout();
        shared.finish_execute().await;

        // transport failure: the statement is unusable
        run?;

        self.warnings.append(&mut handler.warnings);

        if let Some(error) = handler.error.take() {
            return Err(map_canceled(error, timed_out));
        }

        self.install_results(handler.envelopes, wants_keys);
        Ok(())
    }

    fn simple_mode(&self) -> bool {
        match self.link.options().prefer_query_mode {
            PreferQueryMode::Simple => true,
            PreferQueryMode::ExtendedForPrepared => matches!(self.kind, StatementKind::Simple),
            _ => false,
        }
    }

    /// Counts the execution and decides whether this one skips promotion.
    fn is_one_shot(&self, query: &CachedQuery) -> bool {
        let count = query.increase_execute_count();
        (self.prepare_threshold == 0 || count <= u64::from(self.prepare_threshold))
            && !self.force_binary
    }

    /// Resolve the server-side statement name for this execution.
    fn named_path(
        &mut self,
        query: &CachedQuery,
        oids: &[Oid],
        flags: ExecFlags,
    ) -> (Option<StatementName>, bool) {
        if flags.contains(ExecFlags::ONESHOT)
            || flags.contains(ExecFlags::EXECUTE_AS_SIMPLE)
            || query.query().is_composite()
        {
            return (None, false);
        }

        match query.server_name() {
            Some(name) if query.types_match(oids) => (Some(name), false),
            Some(_) => {
                // parameter types changed under a named plan; re-prepare
                if let Some(stale) = query.take_server_name() {
                    self.link.defer_close(DeferredClose::Statement(stale));
                }
                (Some(StatementName::next()), true)
            }
            None => (Some(StatementName::next()), true),
        }
    }

    fn install_results(&mut self, envelopes: Vec<ResultEnvelope>, wants_keys: bool) {
        if wants_keys {
            let mut iter = envelopes.into_iter();
            self.generated_keys = iter.next();
            self.chain = ResultChain::new(iter.collect());
        } else {
            self.chain = ResultChain::new(envelopes);
        }
    }

    fn close_for_next_execution(&mut self) {
        self.warnings.clear();
        self.chain.close_all(&mut self.link);
        self.chain = ResultChain::default();
        if let Some(mut keys) = self.generated_keys.take() {
            if let Some(rs) = keys.result_set_mut() {
                if let Some(portal) = rs.close() {
                    self.link.defer_close(DeferredClose::Portal(portal));
                }
            }
        }
    }

    // ===== batch =====

    /// Queue a SQL string for [`execute_batch`][Statement::execute_batch].
    pub fn add_batch_sql(&mut self, sql: &str) -> Result<()> {
        self.check_closed()?;
        let options = RewriteOptions {
            style: self.link.options().placeholder_style,
            escape_processing: self.escape_processing,
            parameterized: false,
            returning: ReturningSpec::None,
        };
        let key = CacheKey { sql: sql.trim().to_owned(), options };
        let query = QueryCache::detached(key, |k| rewrite(&k.sql, &k.options))?;
        self.batch.push(BatchEntry::Sql(query));
        Ok(())
    }

    /// Queue the current parameter values as one batch entry.
    pub fn add_batch(&mut self) -> Result<()> {
        self.check_closed()?;
        let data = self.prepared()?;
        let snapshot = data.params.duplicate();
        self.batch.push(BatchEntry::Params(snapshot));
        Ok(())
    }

    pub fn clear_batch(&mut self) {
        self.batch.clear();
    }

    /// Run the queued entries in order.
    ///
    /// On success the returned vec has one update count per entry. On
    /// failure the error carries the accumulated counts with
    /// [`EXECUTE_FAILED`] at the failing index.
    pub async fn execute_batch(&mut self) -> Result<Vec<i64>> {
        self.check_closed()?;
        self.close_for_next_execution();

        if self.batch.is_empty() {
            return Ok(Vec::new());
        }
        let entries = std::mem::take(&mut self.batch);

        let wants_keys = self.wants_keys_always.wants_keys();
        let mut flags = match wants_keys {
            // mixed binary and text in one generated-keys column set cannot
            // be handled; disable binary transfer for these batches
            true => ExecFlags::BOTH_ROWS_AND_STATUS | ExecFlags::NO_BINARY_TRANSFER,
            false => ExecFlags::NO_RESULTS,
        };
        if self.link.options().autocommit {
            flags |= ExecFlags::SUPPRESS_BEGIN;
        }
        if self.link.options().read_only_hint {
            flags |= ExecFlags::READ_ONLY_HINT;
        }
        if self.simple_mode() {
            flags |= ExecFlags::EXECUTE_AS_SIMPLE;
        }

        let plan = self.plan_batch(entries, wants_keys)?;
        let mut handler = BatchResultHandler::new(plan.expected);

        let shared = Arc::clone(self.link.cancel_shared());
        shared.start_execute();
        let timer = (!self.timeout.is_zero()).then(|| TimeoutTimer::arm(&shared, self.timeout));

        let run = self.run_batch(plan, flags, &mut handler).await;

        if let Some(timer) = timer {
            timer.disarm();
        }
        let timed_out = shared.took_timeout();
        shared.finish_execute().await;

        run?;

        self.warnings.append(&mut handler.warnings);
        if wants_keys {
            if let Some(keys) = handler.keys.take() {
                self.generated_keys = Some(ResultEnvelope::Rows(keys));
            }
        }

        match handler.error.take() {
            None => Ok(handler.counts),
            Some(source) => {
                handler.fail_rest();
                Err(BatchError {
                    counts: handler.counts,
                    first_failure: handler.first_failure.unwrap_or(0),
                    source: Box::new(map_canceled(source, timed_out)),
                }
                .into())
            }
        }
    }

    async fn run_batch(
        &mut self,
        plan: BatchPlan,
        flags: ExecFlags,
        handler: &mut BatchResultHandler,
    ) -> Result<()> {
        for exec in plan.executions {
            handler.begin_entry(exec.span);

            let bound = match exec.params.bound() {
                Ok(bound) => bound,
                Err(err) => {
                    handler.on_error(err);
                    handler.finish_entry();
                    break;
                }
            };
            let oids: Vec<Oid> = bound.iter().map(Encoded::oid).collect();

            let (stmt_name, parse_needed) = match exec.reusable {
                true => {
                    let one_shot = self.is_one_shot(&exec.query);
                    match one_shot {
                        true => (None, false),
                        false => self.named_path(&exec.query, &oids, flags),
                    }
                }
                false => (None, false),
            };

            let mut exec_flags = flags;
            if stmt_name.is_some() {
                // named statements in a batch re-describe the portal so a
                // result-shape change cannot slip through
                exec_flags |= ExecFlags::FORCE_DESCRIBE_PORTAL;
            }

            protocol::execute(
                &mut self.link,
                ExecuteInput {
                    query: &exec.query,
                    params: &bound,
                    flags: exec_flags,
                    max_rows: 0,
                    fetch_size: 0,
                    stmt_name,
                    parse_needed,
                },
                handler,
            )
            .await?;

            handler.finish_entry();

            if handler.error.is_some() {
                // keep collecting only while the transaction state permits
                match self.link.tx_status() {
                    b'E' => {
                        use crate::connection::AutoSave;
                        if self.link.options().auto_save == AutoSave::Never {
                            break;
                        }
                        protocol::rollback_to_savepoint(&mut self.link).await?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Merge consecutive rewritable-insert entries into multi-row VALUES
    /// executions, bounded by the protocol's 32767 parameters per bind.
    fn plan_batch(&mut self, entries: Vec<BatchEntry>, wants_keys: bool) -> Result<BatchPlan> {
        const MAX_BIND_PARAMS: usize = 32767;

        let expected = entries.len();
        let mut executions = Vec::new();

        let fuse = match (&self.kind, self.link.options().rewrite_batched_inserts) {
            (StatementKind::Prepared(data), true) if !wants_keys => {
                let q = data.query.query();
                let k = q.param_count();
                let fusable = q
                    .single()
                    .is_some_and(|s| s.is_rewritable_insert() && !s.returning_columns());
                (fusable && k > 0).then(|| (data.query.clone(), k))
            }
            _ => None,
        };

        match fuse {
            Some((query, k)) => {
                let rows_per_exec = (MAX_BIND_PARAMS / k).max(1);
                let mut params: Vec<ParameterList> = Vec::new();
                for entry in entries {
                    match entry {
                        BatchEntry::Params(list) => params.push(list),
                        BatchEntry::Sql(_) => {
                            return Err(ErrorKind::InvalidParameterValue(
                                "mixed sql and parameter batch entries".into(),
                            )
                            .into());
                        }
                    }
                }

                for group in params.chunks(rows_per_exec) {
                    if group.len() == 1 {
                        executions.push(BatchExec {
                            query: query.clone(),
                            params: group[0].duplicate(),
                            span: 1,
                            reusable: true,
                        });
                        continue;
                    }

                    let fused_sql = query
                        .query()
                        .fuse_insert(group.len())
                        .expect("checked rewritable insert");
                    // spliced text is already in native form, whatever the
                    // connection's placeholder style
                    let fused_options = RewriteOptions {
                        style: crate::sql::PlaceholderStyle::Native,
                        escape_processing: false,
                        parameterized: true,
                        returning: ReturningSpec::None,
                    };
                    let fused = QueryCache::detached(
                        CacheKey { sql: fused_sql, options: fused_options },
                        |key| rewrite(&key.sql, &key.options),
                    )?;

                    let mut merged = ParameterList::new(k * group.len());
                    for (row, list) in group.iter().enumerate() {
                        for (i, value) in list.bound()?.into_iter().enumerate() {
                            merged.bind(row * k + i + 1, value)?;
                        }
                    }

                    executions.push(BatchExec {
                        query: fused,
                        params: merged,
                        span: group.len(),
                        reusable: false,
                    });
                }
            }
            None => {
                for entry in entries {
                    let exec = match entry {
                        BatchEntry::Sql(query) => BatchExec {
                            query,
                            params: ParameterList::new(0),
                            span: 1,
                            reusable: false,
                        },
                        BatchEntry::Params(params) => {
                            let data = self.prepared()?;
                            BatchExec {
                                query: data.query.clone(),
                                params,
                                span: 1,
                                reusable: true,
                            }
                        }
                    };
                    executions.push(exec);
                }
            }
        }

        Ok(BatchPlan { executions, expected })
    }

    // ===== results =====

    /// The current result's update count, when it is a command result.
    pub fn update_count(&self) -> Option<u64> {
        self.chain.current().and_then(ResultEnvelope::update_count)
    }

    /// The current result's row set.
    pub fn result_set(&mut self) -> Option<&mut ResultSet> {
        self.chain.current_mut().and_then(ResultEnvelope::result_set_mut)
    }

    /// Advance the result chain.
    ///
    /// Returns `true` when the new current result is a row set.
    pub fn more_results(&mut self, mode: ResultMode) -> Result<bool> {
        self.check_closed()?;

        if mode == ResultMode::CloseCurrent {
            self.chain.close_current(&mut self.link);
        }
        self.chain.advance();
        if mode == ResultMode::CloseAll {
            self.chain.close_processed(&mut self.link);
        }

        Ok(self.chain.current().is_some_and(|e| e.result_set().is_some()))
    }

    /// The generated-keys result of the last execution, or an empty one.
    pub fn generated_keys(&mut self) -> &mut ResultSet {
        let env = self.generated_keys.get_or_insert_with(|| {
            ResultEnvelope::Rows(ResultSet::new(Arc::from(Vec::<Field>::new()), Vec::new(), None))
        });
        match env {
            ResultEnvelope::Rows(rs) => rs,
            _ => unreachable!("generated keys envelope is always rows"),
        }
    }

    fn single_result_set(&mut self) -> Result<&mut ResultSet> {
        if self.chain.len() > 1 {
            return Err(ErrorKind::TooManyResults.into());
        }
        self.chain
            .current_mut()
            .and_then(ResultEnvelope::result_set_mut)
            .ok_or_else(|| ErrorKind::NoData.into())
    }

    fn check_no_result_update(&self) -> Result<()> {
        for env in self.chain.envelopes() {
            if env.result_set().is_some() {
                return Err(ErrorKind::TooManyResults.into());
            }
        }
        Ok(())
    }

    /// Take the current result set as a lazy row stream.
    ///
    /// Buffered rows are yielded first; a suspended portal is driven in
    /// `fetch_size` batches as the stream is polled. The result set is
    /// removed from the chain.
    pub fn row_stream(&mut self) -> Option<crate::protocol::RowStream<'_, C>> {
        let env = self.chain.current_mut()?;
        let result = match std::mem::replace(env, ResultEnvelope::Empty) {
            ResultEnvelope::Rows(rs) if !rs.is_closed() => rs,
            other => {
                *env = other;
                return None;
            }
        };
        Some(crate::protocol::RowStream::new(&mut self.link, result))
    }

    /// Fetch the next batch of rows into the current result set through its
    /// suspended portal. Returns `false` when the portal is exhausted.
    pub async fn fetch_more(&mut self) -> Result<bool> {
        self.check_closed()?;

        let adaptive = self.adaptive_fetch;
        let budget = self.link.options().adaptive_fetch_maximum;

        let Some(rs) = self.chain.current_mut().and_then(ResultEnvelope::result_set_mut) else {
            return Ok(false);
        };
        let Some(cursor) = rs.cursor().cloned() else {
            return Ok(false);
        };
        let fields = rs.fields_arc();

        let (rows, suspended) =
            protocol::fetch_portal(&mut self.link, fields, &cursor.portal, cursor.fetch_size)
                .await?;

        let rs = self
            .chain
            .current_mut()
            .and_then(ResultEnvelope::result_set_mut)
            .expect("result set unchanged across fetch");
        if adaptive {
            let next = protocol::adaptive_fetch_size(cursor.fetch_size, &rows, budget);
            rs.set_fetch_size(next);
        }
        let any = !rows.is_empty();
        rs.append(rows, suspended);
        if !suspended {
            self.link.defer_close(DeferredClose::Portal(cursor.portal));
        }

        Ok(any || suspended)
    }

    // ===== warnings =====

    /// Warnings chained since the last execution started.
    pub fn take_warnings(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.warnings)
    }

    pub fn clear_warnings(&mut self) {
        self.warnings.clear();
    }

    // ===== cancellation and tuning =====

    /// A handle able to cancel this statement's in-flight execution from
    /// another task.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(Arc::clone(self.link.cancel_shared()))
    }

    /// Request cancellation of the current execution; a no-op when idle.
    pub async fn cancel(&self) -> Result<()> {
        self.cancel_token().cancel().await
    }

    /// Fail the execution with a timeout-flavored cancel after `timeout`.
    /// Zero disables the timer.
    pub fn set_query_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Rows fetched per cursor round trip; zero fetches everything at once.
    pub fn set_fetch_size(&mut self, rows: u32) {
        self.fetch_size = rows;
    }

    /// Cap on returned rows per result; zero is unlimited.
    pub fn set_max_rows(&mut self, max_rows: u32) {
        self.max_rows = max_rows;
    }

    /// Executions of one query before it is promoted to a named server-side
    /// statement. Negative forces binary transfer with a threshold of one.
    pub fn set_prepare_threshold(&mut self, threshold: i32) {
        if threshold < 0 {
            self.force_binary = true;
            self.prepare_threshold = 1;
        } else {
            self.prepare_threshold = threshold as u32;
        }
    }

    pub fn prepare_threshold(&self) -> u32 {
        self.prepare_threshold
    }

    pub fn set_adaptive_fetch(&mut self, adaptive: bool) {
        self.adaptive_fetch = adaptive;
    }

    pub fn set_escape_processing(&mut self, enabled: bool) {
        self.escape_processing = enabled;
    }

    /// Close this statement as soon as its last open result set closes.
    pub fn close_on_completion(&mut self) {
        self.close_on_completion = true;
    }

    pub fn is_close_on_completion(&self) -> bool {
        self.close_on_completion
    }

    /// Close the current result set, then self-close if
    /// [`close_on_completion`][Statement::close_on_completion] is armed and
    /// nothing remains open.
    pub fn close_result(&mut self) -> Result<()> {
        self.check_closed()?;
        self.chain.close_current(&mut self.link);
        self.check_completion();
        Ok(())
    }

    fn check_completion(&mut self) {
        if !self.close_on_completion {
            return;
        }
        if self.chain.any_open() {
            return;
        }
        // single-shot: the close below must not re-enter here
        self.close_on_completion = false;
        self.release_resources();
        self.close_on_completion = true;
    }

    /// Close the statement. Closing an already closed statement is a no-op.
    pub fn close(&mut self) {
        self.release_resources();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn release_resources(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.chain.close_all(&mut self.link);
        if let Some(mut keys) = self.generated_keys.take() {
            if let Some(rs) = keys.result_set_mut() {
                if let Some(portal) = rs.close() {
                    self.link.defer_close(DeferredClose::Portal(portal));
                }
            }
        }

        if let StatementKind::Prepared(data) | StatementKind::Callable(data) = &self.kind {
            if data.borrowed {
                let query = data.query.clone();
                self.link.query_cache().release(&query);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn link(&mut self) -> &mut C {
        &mut self.link
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        self.chain.len()
    }
}

impl<C: PgTransport> Drop for Statement<C> {
    fn drop(&mut self) {
        self.release_resources();
    }
}

fn map_canceled(error: Error, timed_out: bool) -> Error {
    let is_cancel = matches!(
        error.kind(),
        ErrorKind::Server(e) if e.is_query_canceled()
    );
    match (is_cancel, timed_out) {
        (true, true) => ErrorKind::CanceledByTimeout.into(),
        (true, false) => ErrorKind::Canceled.into(),
        _ => error,
    }
}

struct BatchPlan {
    executions: Vec<BatchExec>,
    expected: usize,
}

struct BatchExec {
    query: CachedQuery,
    params: ParameterList,
    span: usize,
    /// Shares promotion state with the bound statement; fused one-shot
    /// queries do not.
    reusable: bool,
}

/// The result chain of the most recent execution, arena style: envelopes in
/// order, a cursor for the current one, and the first-unclosed watermark.
#[derive(Default)]
struct ResultChain {
    envelopes: Vec<ResultEnvelope>,
    current: usize,
    first_unclosed: usize,
}

impl ResultChain {
    fn new(envelopes: Vec<ResultEnvelope>) -> ResultChain {
        ResultChain { envelopes, current: 0, first_unclosed: 0 }
    }

    fn len(&self) -> usize {
        self.envelopes.len()
    }

    fn envelopes(&self) -> &[ResultEnvelope] {
        &self.envelopes
    }

    fn current(&self) -> Option<&ResultEnvelope> {
        self.envelopes.get(self.current)
    }

    fn current_mut(&mut self) -> Option<&mut ResultEnvelope> {
        self.envelopes.get_mut(self.current)
    }

    fn advance(&mut self) {
        if self.current < self.envelopes.len() {
            self.current += 1;
        }
    }

    fn any_open(&self) -> bool {
        self.envelopes.iter().any(|e| e.result_set().is_some())
    }

    fn close_current<C: PgTransport>(&mut self, link: &mut C) {
        if let Some(env) = self.envelopes.get_mut(self.current) {
            close_envelope(env, link);
        }
    }

    /// Close processed results between the first-unclosed watermark and the
    /// current result; the watermark stays a prefix of the chain.
    fn close_processed<C: PgTransport>(&mut self, link: &mut C) {
        while self.first_unclosed < self.current.min(self.envelopes.len()) {
            close_envelope(&mut self.envelopes[self.first_unclosed], link);
            self.first_unclosed += 1;
        }
    }

    fn close_all<C: PgTransport>(&mut self, link: &mut C) {
        for env in &mut self.envelopes {
            close_envelope(env, link);
        }
        self.first_unclosed = self.envelopes.len();
    }
}

fn close_envelope<C: PgTransport>(env: &mut ResultEnvelope, link: &mut C) {
    if let Some(rs) = env.result_set_mut() {
        if let Some(portal) = rs.close() {
            link.defer_close(DeferredClose::Portal(portal));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        connection::AutoSave,
        sql::PlaceholderStyle,
        transport::mock::MockLink,
    };

    fn script_insert_ok(link: &mut MockLink, rows: u64) {
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_no_data();
        link.script_command_complete(&format!("INSERT 0 {rows}"));
    }

    #[tokio::test]
    async fn prepared_query_single_select() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_row_description(&[("a", 23)]);
        link.script_data_row(&[Some(b"420".as_slice())]);
        link.script_command_complete("SELECT 1");
        link.script_ready(b'I');

        let mut stmt = Statement::prepare(link, "SELECT ?").unwrap();
        stmt.set(1, 420).unwrap();

        let rows = stmt.query_prepared().await.unwrap();
        let row = rows.next_row().unwrap();
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 420);
        assert!(rows.next_row().is_none());

        // unnamed extended pipeline: Parse Bind Describe Execute Sync
        assert_eq!(stmt.link().sent_types(), vec![b'P', b'B', b'D', b'E', b'S']);
        let frames = stmt.link().sent_frames();
        assert_eq!(MockLink::frame_strings(&frames[0].1)[0], "");
        assert_eq!(MockLink::frame_strings(&frames[0].1)[1], "SELECT $1");
    }

    #[tokio::test]
    async fn promotion_on_threshold_crossing() {
        let link = MockLink::new();
        let mut stmt = Statement::prepare(link, "INSERT INTO t(a) VALUES(?)").unwrap();
        stmt.set_prepare_threshold(3);

        // executions 1..=3 ride the unnamed path
        for _ in 0..3 {
            script_insert_ok(stmt.link(), 1);
            stmt.link().script_ready(b'I');
            stmt.set(1, 5).unwrap();
            stmt.update_prepared().await.unwrap();

            let frames = stmt.link().sent_frames();
            assert_eq!(frames[0].0, b'P');
            assert_eq!(MockLink::frame_strings(&frames[0].1)[0], "", "unnamed below threshold");
            stmt.link().clear_sent();
        }

        // the 4th execution parses under a server-side name
        script_insert_ok(stmt.link(), 1);
        stmt.link().script_ready(b'I');
        stmt.set(1, 5).unwrap();
        stmt.update_prepared().await.unwrap();

        let frames = stmt.link().sent_frames();
        assert_eq!(frames[0].0, b'P');
        let name = MockLink::frame_strings(&frames[0].1)[0].clone();
        assert!(name.starts_with('q'), "named statement, got {name:?}");
        stmt.link().clear_sent();

        // the 5th omits Parse and binds the named statement
        stmt.link().script_bind_complete();
        stmt.link().script_no_data();
        stmt.link().script_command_complete("INSERT 0 1");
        stmt.link().script_ready(b'I');
        stmt.set(1, 5).unwrap();
        stmt.update_prepared().await.unwrap();

        let frames = stmt.link().sent_frames();
        assert_eq!(frames[0].0, b'B', "no Parse once promoted");
        assert_eq!(MockLink::frame_strings(&frames[0].1)[1], name);
    }

    #[tokio::test]
    async fn multi_statement_result_chain() {
        let mut link = MockLink::new();
        for rows in [2u64, 1, 3] {
            script_insert_ok(&mut link, rows);
        }
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        let has_rows = stmt
            .execute_text("INSERT INTO t VALUES(1),(2);INSERT INTO t VALUES(3);INSERT INTO t VALUES(4),(5),(6)")
            .await
            .unwrap();
        assert!(!has_rows);

        assert_eq!(stmt.update_count(), Some(2));
        assert!(!stmt.more_results(ResultMode::CloseCurrent).unwrap());
        assert_eq!(stmt.update_count(), Some(1));
        assert!(!stmt.more_results(ResultMode::CloseCurrent).unwrap());
        assert_eq!(stmt.update_count(), Some(3));
        assert!(!stmt.more_results(ResultMode::CloseAll).unwrap());
        assert_eq!(stmt.update_count(), None);
    }

    #[tokio::test]
    async fn mixed_placeholder_styles_share_global_slots() {
        let mut link = MockLink::new();
        link.options_mut().placeholder_style = PlaceholderStyle::Any;
        for rows in [2u64, 1, 3] {
            script_insert_ok(&mut link, rows);
        }
        link.script_ready(b'I');

        let sql = "INSERT INTO t(a,b) VALUES($1,$2),($1,$2);\
                   INSERT INTO t(a,b) VALUES(?,?);\
                   INSERT INTO t(a,b) VALUES(:a,:b),(:a,:b),(:a,:b)";
        let mut stmt = Statement::prepare(link, sql).unwrap();
        for (i, v) in [111, 222, 333, 444, 555, 666].into_iter().enumerate() {
            stmt.set(i + 1, v).unwrap();
        }

        assert!(!stmt.execute_prepared().await.unwrap());

        let parse_sqls: Vec<String> = stmt
            .link()
            .sent_frames()
            .into_iter()
            .filter(|(t, _)| *t == b'P')
            .map(|(_, body)| MockLink::frame_strings(&body)[1].clone())
            .collect();
        assert_eq!(parse_sqls.len(), 3);
        assert!(parse_sqls[0].contains("($1,$2),($1,$2)"));
        assert!(parse_sqls[1].contains("($3,$4)"));
        assert!(parse_sqls[2].contains("($5,$6),($5,$6),($5,$6)"));

        assert_eq!(stmt.update_count(), Some(2));
        stmt.more_results(ResultMode::CloseCurrent).unwrap();
        assert_eq!(stmt.update_count(), Some(1));
        stmt.more_results(ResultMode::CloseCurrent).unwrap();
        assert_eq!(stmt.update_count(), Some(3));
    }

    #[tokio::test]
    async fn batch_of_composite_entries_sums_counts() {
        let mut link = MockLink::new();
        link.options_mut().placeholder_style = PlaceholderStyle::Any;
        // two entries, each a three-statement composite
        for _ in 0..2 {
            for rows in [2u64, 1, 3] {
                script_insert_ok(&mut link, rows);
            }
            link.script_ready(b'I');
        }

        let sql = "INSERT INTO t(a,b) VALUES($1,$2),($1,$2);\
                   INSERT INTO t(a,b) VALUES(?,?);\
                   INSERT INTO t(a,b) VALUES(:a,:b),(:a,:b),(:a,:b)";
        let mut stmt = Statement::prepare(link, sql).unwrap();

        for base in [10i32, 1] {
            for i in 1..=6usize {
                stmt.set(i, base * i as i32).unwrap();
            }
            stmt.add_batch().unwrap();
        }

        let counts = stmt.execute_batch().await.unwrap();
        assert_eq!(counts, vec![6, 6]);
    }

    #[tokio::test]
    async fn batch_fuses_rewritable_inserts() {
        let mut link = MockLink::new();
        link.options_mut().rewrite_batched_inserts = true;
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_no_data();
        link.script_command_complete("INSERT 0 3");
        link.script_ready(b'I');

        let mut stmt = Statement::prepare(link, "INSERT INTO t(a, b) VALUES (?, ?)").unwrap();
        for v in [(1, 2), (3, 4), (5, 6)] {
            stmt.set(1, v.0).unwrap();
            stmt.set(2, v.1).unwrap();
            stmt.add_batch().unwrap();
        }

        let counts = stmt.execute_batch().await.unwrap();
        assert_eq!(counts, vec![SUCCESS_NO_INFO, SUCCESS_NO_INFO, SUCCESS_NO_INFO]);

        let frames = stmt.link().sent_frames();
        let parse_sql = MockLink::frame_strings(&frames[0].1)[1].clone();
        assert_eq!(
            parse_sql,
            "INSERT INTO t(a, b) VALUES ($1, $2),($3, $4),($5, $6)"
        );
    }

    #[tokio::test]
    async fn missing_parameter_fails_before_the_wire() {
        let link = MockLink::new();
        let mut stmt = Statement::prepare(link, "SELECT ?").unwrap();

        let err = stmt.query_prepared().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MissingParameter { index: 1 }));
        assert!(stmt.link().sent_frames().is_empty());
    }

    #[tokio::test]
    async fn server_error_is_drained_and_preserved() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_error("42601", "syntax error at or near \"FORM\"");
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        let err = stmt.execute_text("SELECT FORM t").await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42601"));
        assert!(stmt.link().script_is_empty(), "stream drained to ReadyForQuery");
    }

    #[tokio::test]
    async fn canceled_error_kind() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_error("57014", "canceling statement due to user request");
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        let err = stmt.execute_text("SELECT pg_sleep(5)").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Canceled));
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn generated_keys_removed_from_chain() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_row_description(&[("id", 23)]);
        link.script_data_row(&[Some(b"7".as_slice())]);
        link.script_command_complete("INSERT 0 1");
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        let count = stmt
            .execute_update_returning("INSERT INTO t(a) VALUES(1)", ReturningSpec::All)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let keys = stmt.generated_keys();
        let row = keys.next_row().unwrap();
        assert_eq!(row.try_get::<_, i32>("id").unwrap(), 7);

        // the rewriter appended the projection
        let frames = stmt.link().sent_frames();
        let parse_sql = MockLink::frame_strings(&frames[0].1)[1].clone();
        assert_eq!(parse_sql, "INSERT INTO t(a) VALUES(1) RETURNING *");
    }

    #[tokio::test]
    async fn simple_mode_substitutes_literals() {
        let mut link = MockLink::new();
        link.options_mut().prefer_query_mode = PreferQueryMode::Simple;
        link.script_row_description(&[("c", 25)]);
        link.script_data_row(&[Some(b"it's".as_slice())]);
        link.script_command_complete("SELECT 1");
        link.script_ready(b'I');

        let mut stmt = Statement::prepare(link, "SELECT ?").unwrap();
        stmt.set(1, "it's").unwrap();
        stmt.execute_prepared().await.unwrap();

        let frames = stmt.link().sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, b'Q');
        assert_eq!(MockLink::frame_strings(&frames[0].1)[0], "SELECT ('it''s')");
    }

    #[tokio::test]
    async fn empty_query_response() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_no_data();
        link.script_empty_query();
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        assert!(!stmt.execute_text("  ").await.unwrap());
        assert_eq!(stmt.update_count(), None);
        assert_eq!(stmt.chain_len(), 1);
    }

    #[tokio::test]
    async fn parameter_status_and_warnings_surface() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_no_data();
        link.script_parameter_status("application_name", "X");
        link.script_notice("implicit index created");
        link.script_command_complete("SET");
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        stmt.execute_text("SET application_name = 'X'").await.unwrap();

        let view = stmt.link().session();
        assert_eq!(view.get("application_name").as_deref(), Some("X"));

        let warnings = stmt.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message(), "implicit index created");
    }

    #[tokio::test]
    async fn implicit_begin_outside_autocommit() {
        let mut link = MockLink::new();
        link.options_mut().autocommit = false;
        // BEGIN responses
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_command_complete("BEGIN");
        // the statement itself
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_row_description(&[("a", 23)]);
        link.script_data_row(&[Some(b"1".as_slice())]);
        link.script_command_complete("SELECT 1");
        link.script_ready(b'T');

        let mut stmt = Statement::new(link);
        assert!(stmt.execute_text("SELECT 1").await.unwrap());

        let frames = stmt.link().sent_frames();
        assert_eq!(MockLink::frame_strings(&frames[0].1)[1], "BEGIN");
        // the BEGIN status is not part of the user-visible chain
        assert_eq!(stmt.chain_len(), 1);
        assert_eq!(stmt.link().tx_status(), b'T');
    }

    #[tokio::test]
    async fn savepoint_guard_with_autosave_always() {
        let mut link = MockLink::new();
        link.options_mut().autocommit = false;
        link.options_mut().auto_save = AutoSave::Always;
        for _ in 0..2 {
            // BEGIN then SAVEPOINT
            link.script_parse_complete();
            link.script_bind_complete();
        }
        link.script_command_complete("BEGIN");
        link.script_command_complete("SAVEPOINT");
        script_insert_ok(&mut link, 1);
        link.script_ready(b'T');

        let mut stmt = Statement::new(link);
        stmt.execute_update("INSERT INTO t VALUES(1)").await.unwrap();

        let sqls: Vec<String> = stmt
            .link()
            .sent_frames()
            .into_iter()
            .filter(|(t, _)| *t == b'P')
            .map(|(_, body)| MockLink::frame_strings(&body)[1].clone())
            .collect();
        assert_eq!(sqls[0], "BEGIN");
        assert_eq!(sqls[1], "SAVEPOINT pgexec_savepoint");
    }

    #[tokio::test]
    async fn stale_plan_retries_once() {
        let link = MockLink::new();
        let mut stmt = Statement::prepare(link, "SELECT ?").unwrap();
        stmt.set_prepare_threshold(1);

        // first execution: one-shot, succeeds
        stmt.link().script_parse_complete();
        stmt.link().script_bind_complete();
        stmt.link().script_row_description(&[("a", 23)]);
        stmt.link().script_command_complete("SELECT 0");
        stmt.link().script_ready(b'I');
        stmt.set(1, 1).unwrap();
        stmt.execute_prepared().await.unwrap();
        stmt.link().clear_sent();

        // second execution goes named and fails with a stale plan, then the
        // retry re-prepares and succeeds
        stmt.link().script_error("26000", "prepared statement does not exist");
        stmt.link().script_ready(b'I');
        stmt.link().script_parse_complete();
        stmt.link().script_bind_complete();
        stmt.link().script_row_description(&[("a", 23)]);
        stmt.link().script_command_complete("SELECT 0");
        stmt.link().script_ready(b'I');

        stmt.set(1, 2).unwrap();
        stmt.execute_prepared().await.unwrap();

        let parses: Vec<String> = stmt
            .link()
            .sent_frames()
            .into_iter()
            .filter(|(t, _)| *t == b'P')
            .map(|(_, body)| MockLink::frame_strings(&body)[0].clone())
            .collect();
        assert_eq!(parses.len(), 2, "one parse per attempt");
        assert!(!parses[1].is_empty(), "retry re-prepares under a fresh name");
    }

    #[tokio::test]
    async fn cursor_mode_suspends_and_fetches_more() {
        let mut link = MockLink::new();
        link.options_mut().autocommit = false;
        // BEGIN
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_command_complete("BEGIN");
        // first batch
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_row_description(&[("n", 23)]);
        link.script_data_row(&[Some(b"1".as_slice())]);
        link.script_data_row(&[Some(b"2".as_slice())]);
        link.script_portal_suspended();
        link.script_ready(b'T');

        let mut stmt = Statement::new(link);
        stmt.set_fetch_size(2);
        assert!(stmt.execute_text("SELECT n FROM series").await.unwrap());

        {
            let rs = stmt.result_set().unwrap();
            assert_eq!(rs.buffered(), 2);
            assert!(!rs.is_complete());
        }

        // continuation round
        stmt.link().script_data_row(&[Some(b"3".as_slice())]);
        stmt.link().script_command_complete("SELECT 3");
        stmt.link().script_ready(b'T');

        assert!(stmt.fetch_more().await.unwrap());
        let rs = stmt.result_set().unwrap();
        assert_eq!(rs.buffered(), 3);
        assert!(rs.is_complete());

        // the engine executed through a named portal
        let execs: Vec<String> = stmt
            .link()
            .sent_frames()
            .into_iter()
            .filter(|(t, _)| *t == b'E')
            .map(|(_, body)| MockLink::frame_strings(&body)[0].clone())
            .collect();
        assert!(execs.iter().all(|p| p.starts_with('c')), "named portal: {execs:?}");
    }

    #[tokio::test]
    async fn row_stream_drives_suspended_portal() {
        use futures_core::Stream;
        use std::pin::Pin;

        async fn stream_next<C: PgTransport>(
            stream: &mut crate::protocol::RowStream<'_, C>,
        ) -> Option<Result<crate::row::Row>> {
            std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_next(cx)).await
        }

        let mut link = MockLink::new();
        link.options_mut().autocommit = false;
        // BEGIN
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_command_complete("BEGIN");
        // first batch, two rows then suspension
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_row_description(&[("n", 23)]);
        link.script_data_row(&[Some(b"1".as_slice())]);
        link.script_data_row(&[Some(b"2".as_slice())]);
        link.script_portal_suspended();
        link.script_ready(b'T');
        // continuation round driven by the stream
        link.script_data_row(&[Some(b"3".as_slice())]);
        link.script_command_complete("SELECT 3");
        link.script_ready(b'T');

        let mut stmt = Statement::new(link);
        stmt.set_fetch_size(2);
        assert!(stmt.execute_text("SELECT n FROM series").await.unwrap());

        let mut stream = stmt.row_stream().unwrap();
        let mut seen = Vec::new();
        while let Some(row) = stream_next(&mut stream).await {
            seen.push(row.unwrap().try_get::<_, i32>(0).unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn close_on_completion_latch() {
        let mut link = MockLink::new();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_row_description(&[("a", 23)]);
        link.script_data_row(&[Some(b"1".as_slice())]);
        link.script_command_complete("SELECT 1");
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        stmt.execute_text("SELECT 1").await.unwrap();
        stmt.close_on_completion();

        stmt.close_result().unwrap();
        assert!(stmt.is_closed());

        let err = stmt.execute_text("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Closed));
    }

    #[tokio::test]
    async fn deferred_closes_ride_the_next_execution() {
        let mut link = MockLink::new();
        link.defer_close(DeferredClose::Statement(StatementName::next()));
        link.script_close_complete();
        link.script_parse_complete();
        link.script_bind_complete();
        link.script_no_data();
        link.script_command_complete("SELECT 0");
        link.script_ready(b'I');

        let mut stmt = Statement::new(link);
        stmt.execute_text("SELECT 1").await.unwrap();

        let types = stmt.link().sent_types();
        assert_eq!(types[0], b'C', "Close precedes the pipeline: {types:?}");
        assert!(stmt.link().take_deferred_closes().is_empty());
    }

    #[tokio::test]
    async fn forbidden_style_is_a_syntax_error() {
        let mut link = MockLink::new();
        link.options_mut().placeholder_style = PlaceholderStyle::Native;
        let err = match Statement::prepare(link, "SELECT :name") {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err.kind(), ErrorKind::Syntax(_)));
    }
}
