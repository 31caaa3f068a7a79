//! Postgres Connection.
mod config;

pub use config::{AutoSave, Config, EngineOptions, ParseError, PreferQueryMode};

use bytes::{Buf, BytesMut};
use std::{
    io,
    sync::Arc,
    task::{Context, Poll, ready},
};

use crate::{
    Result,
    cache::QueryCache,
    cancel::{CancelAddr, CancelShared, CancelToken},
    common::verbose,
    error::UnsupportedAuth,
    net::Socket,
    postgres::{BackendProtocol, FrontendProtocol, Notice, backend, frontend},
    session::{ParameterView, SessionParams},
    statement::Statement,
    transport::{DeferredClose, PgTransport, PgTransportExt},
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

// sent asynchronously for LISTEN/NOTIFY, which the engine does not consume
const NOTIFICATION_RESPONSE: u8 = b'A';

/// A single postgres session.
///
/// The connection owns the socket, the query cache, and the session
/// parameter map. All message io is serialized through `&mut self`: one
/// connection never has two in-flight executions.
///
/// The connection handles `ParameterStatus`, `NoticeResponse` and
/// `ErrorResponse` messages transparently.
#[derive(Debug)]
pub struct Connection {
    // io
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,

    // engine state
    options: EngineOptions,
    cache: QueryCache,
    deferred: Vec<DeferredClose>,
    notices: Vec<Notice>,
    session: SessionParams,
    cancel: Arc<CancelShared>,

    // diagnostic
    sync_pending: usize,
    tx: u8,
}

impl Connection {
    /// Perform a startup message via url.
    pub async fn connect(url: &str) -> Result<Self> {
        let config = Config::parse(url)
            .map_err(|e| crate::Error::from(e).with_context("invalid connection url"))?;
        Self::connect_with(config).await
    }

    /// Perform a startup message with config from environment variables.
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env()).await
    }

    /// Perform a startup message with config.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let (socket, addr) = match &config.socket {
            Some(path) => (
                Socket::connect_socket(path).await?,
                CancelAddr::Unix { path: path.as_str().to_owned() },
            ),
            None => (
                Socket::connect_tcp(&config.host, config.port).await?,
                CancelAddr::Tcp {
                    host: config.host.as_str().to_owned(),
                    port: config.port,
                },
            ),
        };

        let mut me = Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            cache: QueryCache::new(config.options.statement_cache_capacity),
            deferred: Vec::new(),
            notices: Vec::new(),
            session: SessionParams::default(),
            cancel: CancelShared::new(addr),
            sync_pending: 0,
            tx: b'I',
            options: config.options.clone(),
        };

        me.startup(&config).await?;

        Ok(me)
    }

    /// The startup phase.
    ///
    /// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
    async fn startup(&mut self, config: &Config) -> Result<()> {
        let application_name = self.options.application_name.clone();
        self.send_startup(frontend::Startup {
            user: &config.user,
            database: Some(&config.dbname),
            application_name: application_name.as_deref(),
            replication: None,
        });
        self.flush().await?;

        // The server then sends an appropriate authentication request message,
        // to which the frontend must reply.
        loop {
            use backend::Authentication::*;
            match self.recv().await? {
                Ok => break,
                CleartextPassword => {
                    self.send(frontend::PasswordMessage { password: &config.pass });
                    self.flush().await?;
                }
                _ => Err(UnsupportedAuth)?,
            }
        }

        // After AuthenticationOk the backend sends ParameterStatus messages,
        // BackendKeyData, and finally ReadyForQuery.
        loop {
            use backend::BackendMessage::*;
            match self.recv().await? {
                ReadyForQuery(r) => {
                    self.tx = r.tx_status;
                    break;
                }
                BackendKeyData(key) => self.cancel.set_key(key),
                f => Err(f.unexpected("startup phase"))?,
            }
        }

        Ok(())
    }

    /// Create a statement bound to this connection.
    pub fn statement(&mut self) -> Statement<&mut Connection> {
        Statement::new(self)
    }

    /// Prepare `sql` against this connection's query cache.
    pub fn prepare(&mut self, sql: impl crate::sql::Sql) -> Result<Statement<&mut Connection>> {
        Statement::prepare(self, sql)
    }

    /// Prepare `sql`, returning generated keys on every execution.
    pub fn prepare_returning(
        &mut self,
        sql: impl crate::sql::Sql,
        keys: crate::sql::ReturningSpec,
    ) -> Result<Statement<&mut Connection>> {
        Statement::prepare_returning(self, sql, keys)
    }

    /// Engine configuration knobs, e.g. placeholder style or the batched
    /// insert rewrite.
    pub fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    /// A handle able to cancel this connection's in-flight execution from
    /// another task, via a second short-lived connection.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(Arc::clone(&self.cancel))
    }

    /// Read-only view of the server reported session parameters.
    pub fn parameter_statuses(&self) -> ParameterView {
        self.session.view()
    }

    /// Current value of one server reported parameter.
    pub fn parameter_status(&self, name: &str) -> Option<String> {
        self.session.view().get(name)
    }

    pub fn is_autocommit(&self) -> bool {
        self.options.autocommit
    }

    /// Toggle per-statement transactions. Turning autocommit back on while a
    /// transaction block is open commits it.
    pub async fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        if autocommit && !self.options.autocommit && self.tx != b'I' {
            self.commit().await?;
        }
        self.options.autocommit = autocommit;
        Ok(())
    }

    /// Commit the open transaction block.
    pub async fn commit(&mut self) -> Result<()> {
        self.simple("COMMIT").await
    }

    /// Roll back the open transaction block.
    pub async fn rollback(&mut self) -> Result<()> {
        self.simple("ROLLBACK").await
    }

    async fn simple(&mut self, sql: &str) -> Result<()> {
        self.send(frontend::Query { sql });
        self.flush().await?;
        let result = loop {
            use backend::BackendMessage::*;
            match self.recv().await {
                Err(err) => break Err(err),
                Ok(ReadyForQuery(r)) => {
                    self.tx = r.tx_status;
                    break Ok(());
                }
                Ok(CommandComplete(_)) | Ok(EmptyQueryResponse(_)) => {}
                Ok(f) => break Err(f.unexpected("transaction control").into()),
            }
        };
        self.ready().await?;
        result
    }

    /// Gracefully close connection.
    pub async fn close(mut self) -> io::Result<()> {
        self.send(frontend::Terminate);
        self.flush().await?;
        self.socket.shutdown().await
    }
}

macro_rules! poll_message {
    (
        poll($io:ident, $cx:ident);
        let $msgtype:ident;
        let $body:ident;
    ) => {
        let Some(mut header) = $io.read_buf.get(..5) else {
            $io.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            ready!(crate::io::poll_read(&mut $io.socket, &mut $io.read_buf, $cx)?);
            continue;
        };

        let $msgtype = header.get_u8();
        let len = header.get_i32() as usize;

        if $io.read_buf.len() - 1/*msgtype*/ < len {
            $io.read_buf.reserve(1 + len);
            ready!(crate::io::poll_read(&mut $io.socket, &mut $io.read_buf, $cx)?);
            continue;
        }

        $io.read_buf.advance(5);
        let $body = $io.read_buf.split_to(len - 4).freeze();

        // Message fully acquired
        #[cfg(feature = "log-verbose")]
        log::trace!("(B){:?}", backend::BackendMessage::decode($msgtype, $body.clone()));
    };
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        crate::io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        ready!(self.poll_ready(cx)?);

        loop {
            poll_message! {
                poll(self, cx);
                let msgtype;
                let body;
            }

            match msgtype {
                backend::ErrorResponse::MSGTYPE => {
                    self.ready_request();
                    let err = backend::ErrorResponse { body }.to_server_error();
                    #[cfg(feature = "log")]
                    log::error!("{err}");
                    Err(err)?
                }
                backend::NoticeResponse::MSGTYPE => {
                    let notice = Notice::new(body);
                    #[cfg(feature = "log")]
                    log::warn!("{notice}");
                    self.notices.push(notice);
                }
                backend::ParameterStatus::MSGTYPE => {
                    let ps = backend::ParameterStatus::decode(msgtype, body)?;
                    verbose!("parameter status {} = {}", ps.name, ps.value);
                    self.session.update(&ps.name, &ps.value);
                }
                NOTIFICATION_RESPONSE => {}
                _ => return Poll::Ready(Ok(B::decode(msgtype, body)?)),
            }
        }
    }

    fn ready_request(&mut self) {
        self.sync_pending += 1;
    }

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush(cx)?)
        }

        while self.sync_pending != 0 {
            poll_message! {
                poll(self, cx);
                let msgtype;
                let body;
            }

            match msgtype {
                backend::ReadyForQuery::MSGTYPE => {
                    let r = backend::ReadyForQuery::decode(msgtype, body)?;
                    self.tx = r.tx_status;
                    self.sync_pending -= 1;
                }
                backend::ParameterStatus::MSGTYPE => {
                    let ps = backend::ParameterStatus::decode(msgtype, body)?;
                    self.session.update(&ps.name, &ps.value);
                }
                backend::NoticeResponse::MSGTYPE => {
                    let notice = Notice::new(body);
                    #[cfg(feature = "log")]
                    log::warn!("{notice}");
                    self.notices.push(notice);
                }
                backend::ErrorResponse::MSGTYPE => {
                    #[cfg(feature = "log")]
                    log::error!("{}", backend::ErrorResponse { body }.to_server_error());
                    #[cfg(not(feature = "log"))]
                    let _ = body;
                }
                // ignore all other messages until `ReadyForQuery` received
                _ => {}
            }
        }

        Poll::Ready(Ok(()))
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    fn query_cache(&mut self) -> &mut QueryCache {
        &mut self.cache
    }

    fn defer_close(&mut self, close: DeferredClose) {
        self.deferred.push(close);
    }

    fn take_deferred_closes(&mut self) -> Vec<DeferredClose> {
        std::mem::take(&mut self.deferred)
    }

    fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn session(&self) -> ParameterView {
        self.session.view()
    }

    fn cancel_shared(&self) -> &Arc<CancelShared> {
        &self.cancel
    }

    fn tx_status(&self) -> u8 {
        self.tx
    }

    fn set_tx_status(&mut self, status: u8) {
        self.tx = status;
    }
}
