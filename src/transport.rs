//! The [`PgTransport`] trait.
use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Result,
    cache::QueryCache,
    cancel::CancelShared,
    connection::EngineOptions,
    postgres::{BackendProtocol, FrontendProtocol, Notice, frontend},
    session::ParameterView,
    statement::{PortalName, StatementName},
};

/// A server-side object whose `Close` was postponed.
///
/// Issued lazily as part of the next execution's message batch.
#[derive(Debug)]
pub enum DeferredClose {
    Statement(StatementName),
    Portal(PortalName),
}

/// A buffered stream which can send and receive postgres message, plus the
/// per-connection state the statement engine works against.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Implementor should handle `ParameterStatus` (apply to the session
    /// parameter map) and `NoticeResponse` (queue for
    /// [`take_notices`][PgTransport::take_notices]) and not return either.
    ///
    /// Implementor also should handle `ErrorResponse` and return it as
    /// [`Err`], after flagging a [`ready_request`][PgTransport::ready_request]
    /// so the stream can be drained to the next `ReadyForQuery`.
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Request implementor to ignore all backend messages until `ReadyForQuery` is received.
    fn ready_request(&mut self);

    /// Poll until every requested `ReadyForQuery` has been consumed.
    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>>;

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client (the startup message)
    /// has no initial message-type byte.
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// Engine configuration for this connection.
    fn options(&self) -> &EngineOptions;

    fn options_mut(&mut self) -> &mut EngineOptions;

    /// The per-connection query cache.
    fn query_cache(&mut self) -> &mut QueryCache;

    /// Postpone a server-side `Close`.
    fn defer_close(&mut self, close: DeferredClose);

    /// Deferred closes to bundle into the next execution.
    fn take_deferred_closes(&mut self) -> Vec<DeferredClose>;

    /// Notices received since the last call.
    fn take_notices(&mut self) -> Vec<Notice>;

    /// Read-only view of the server reported session parameters.
    fn session(&self) -> ParameterView;

    /// Shared cancellation state for out-of-band cancel and the timeout timer.
    fn cancel_shared(&self) -> &Arc<CancelShared>;

    /// Transaction status from the last `ReadyForQuery`: `I`, `T` or `E`.
    fn tx_status(&self) -> u8;

    fn set_tx_status(&mut self, status: u8);
}

impl<P> PgTransport for &mut P
where
    P: PgTransport,
{
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        P::poll_ready(self, cx)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn options(&self) -> &EngineOptions {
        P::options(self)
    }

    fn options_mut(&mut self) -> &mut EngineOptions {
        P::options_mut(self)
    }

    fn query_cache(&mut self) -> &mut QueryCache {
        P::query_cache(self)
    }

    fn defer_close(&mut self, close: DeferredClose) {
        P::defer_close(self, close);
    }

    fn take_deferred_closes(&mut self) -> Vec<DeferredClose> {
        P::take_deferred_closes(self)
    }

    fn take_notices(&mut self) -> Vec<Notice> {
        P::take_notices(self)
    }

    fn session(&self) -> ParameterView {
        P::session(self)
    }

    fn cancel_shared(&self) -> &Arc<CancelShared> {
        P::cancel_shared(self)
    }

    fn tx_status(&self) -> u8 {
        P::tx_status(self)
    }

    fn set_tx_status(&mut self, status: u8) {
        P::set_tx_status(self, status);
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }

    /// Drain the stream until every requested `ReadyForQuery` has arrived.
    fn ready(&mut self) -> impl Future<Output = Result<()>> {
        std::future::poll_fn(|cx| self.poll_ready(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport {}

/// A scripted in-memory transport. Backend replies are queued up front;
/// frontend traffic is captured for assertions.
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;
    use crate::{
        cancel::CancelAddr,
        postgres::backend,
        session::SessionParams,
    };

    pub(crate) struct MockLink {
        script: VecDeque<(u8, Bytes)>,
        pub sent: BytesMut,
        sync_pending: usize,
        options: EngineOptions,
        cache: QueryCache,
        deferred: Vec<DeferredClose>,
        notices: Vec<Notice>,
        session: SessionParams,
        cancel: Arc<CancelShared>,
        tx: u8,
    }

    impl MockLink {
        pub fn new() -> MockLink {
            MockLink {
                script: VecDeque::new(),
                sent: BytesMut::new(),
                sync_pending: 0,
                options: EngineOptions::default(),
                cache: QueryCache::new(16),
                deferred: Vec::new(),
                notices: Vec::new(),
                session: SessionParams::default(),
                cancel: CancelShared::new(CancelAddr::Disabled),
                tx: b'I',
            }
        }

        fn push(&mut self, msgtype: u8, body: Bytes) {
            self.script.push_back((msgtype, body));
        }

        pub fn script_parse_complete(&mut self) {
            self.push(b'1', Bytes::new());
        }

        pub fn script_bind_complete(&mut self) {
            self.push(b'2', Bytes::new());
        }

        pub fn script_close_complete(&mut self) {
            self.push(b'3', Bytes::new());
        }

        pub fn script_no_data(&mut self) {
            self.push(b'n', Bytes::new());
        }

        pub fn script_empty_query(&mut self) {
            self.push(b'I', Bytes::new());
        }

        pub fn script_portal_suspended(&mut self) {
            self.push(b's', Bytes::new());
        }

        pub fn script_command_complete(&mut self, tag: &str) {
            let mut buf = BytesMut::new();
            buf.put_slice(tag.as_bytes());
            buf.put_u8(0);
            self.push(b'C', buf.freeze());
        }

        pub fn script_ready(&mut self, tx: u8) {
            self.push(b'Z', Bytes::copy_from_slice(&[tx]));
        }

        pub fn script_row_description(&mut self, fields: &[(&str, u32)]) {
            let mut buf = BytesMut::new();
            buf.put_u16(fields.len() as u16);
            for (name, oid) in fields {
                buf.put_slice(name.as_bytes());
                buf.put_u8(0);
                buf.put_u32(0);
                buf.put_u16(0);
                buf.put_u32(*oid);
                buf.put_i16(-1);
                buf.put_i32(-1);
                buf.put_u16(0);
            }
            self.push(b'T', buf.freeze());
        }

        pub fn script_data_row(&mut self, values: &[Option<&[u8]>]) {
            let mut buf = BytesMut::new();
            buf.put_u16(values.len() as u16);
            for value in values {
                match value {
                    Some(v) => {
                        buf.put_i32(v.len() as i32);
                        buf.put_slice(v);
                    }
                    None => buf.put_i32(-1),
                }
            }
            self.push(b'D', buf.freeze());
        }

        pub fn script_parameter_status(&mut self, name: &str, value: &str) {
            let mut buf = BytesMut::new();
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
            self.push(b'S', buf.freeze());
        }

        pub fn script_notice(&mut self, message: &str) {
            let mut buf = BytesMut::new();
            buf.put_u8(b'S');
            buf.put_slice(b"WARNING\0");
            buf.put_u8(b'C');
            buf.put_slice(b"01000\0");
            buf.put_u8(b'M');
            buf.put_slice(message.as_bytes());
            buf.put_u8(0);
            buf.put_u8(0);
            self.push(b'N', buf.freeze());
        }

        pub fn script_error(&mut self, code: &str, message: &str) {
            let mut buf = BytesMut::new();
            buf.put_u8(b'S');
            buf.put_slice(b"ERROR\0");
            buf.put_u8(b'C');
            buf.put_slice(code.as_bytes());
            buf.put_u8(0);
            buf.put_u8(b'M');
            buf.put_slice(message.as_bytes());
            buf.put_u8(0);
            buf.put_u8(0);
            self.push(b'E', buf.freeze());
        }

        /// The captured frontend traffic as (msgtype, body) frames.
        pub fn sent_frames(&self) -> Vec<(u8, Bytes)> {
            let mut frames = Vec::new();
            let mut buf = Bytes::copy_from_slice(&self.sent);
            use bytes::Buf;
            while buf.remaining() >= 5 {
                let msgtype = buf.get_u8();
                let len = buf.get_i32() as usize;
                let body = buf.split_to(len - 4);
                frames.push((msgtype, body));
            }
            frames
        }

        pub fn sent_types(&self) -> Vec<u8> {
            self.sent_frames().into_iter().map(|(t, _)| t).collect()
        }

        /// Nul-terminated strings of one captured frame body.
        pub fn frame_strings(body: &Bytes) -> Vec<String> {
            body.as_ref()
                .split(|b| *b == 0)
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect()
        }

        pub fn clear_sent(&mut self) {
            self.sent.clear();
        }

        pub fn script_is_empty(&self) -> bool {
            self.script.is_empty()
        }
    }

    impl PgTransport for MockLink {
        fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
            match self.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }

            loop {
                let Some((msgtype, body)) = self.script.pop_front() else {
                    panic!("mock script exhausted");
                };
                match msgtype {
                    backend::ParameterStatus::MSGTYPE => {
                        let ps = backend::ParameterStatus::decode(msgtype, body)?;
                        self.session.update(&ps.name, &ps.value);
                    }
                    backend::NoticeResponse::MSGTYPE => {
                        self.notices.push(Notice::new(body));
                    }
                    backend::ErrorResponse::MSGTYPE => {
                        self.ready_request();
                        let err = backend::ErrorResponse::decode(msgtype, body)?;
                        return Poll::Ready(Err(err.to_server_error().into()));
                    }
                    _ => return Poll::Ready(Ok(B::decode(msgtype, body)?)),
                }
            }
        }

        fn ready_request(&mut self) {
            self.sync_pending += 1;
        }

        fn poll_ready(&mut self, _: &mut Context) -> Poll<Result<()>> {
            while self.sync_pending != 0 {
                let Some((msgtype, body)) = self.script.pop_front() else {
                    panic!("mock script exhausted while draining to ReadyForQuery");
                };
                match msgtype {
                    backend::ReadyForQuery::MSGTYPE => {
                        let r = backend::ReadyForQuery::decode(msgtype, body)
                            .expect("scripted ReadyForQuery");
                        self.tx = r.tx_status;
                        self.sync_pending -= 1;
                    }
                    backend::ParameterStatus::MSGTYPE => {
                        let ps = backend::ParameterStatus::decode(msgtype, body)
                            .expect("scripted ParameterStatus");
                        self.session.update(&ps.name, &ps.value);
                    }
                    backend::NoticeResponse::MSGTYPE => {
                        self.notices.push(Notice::new(body));
                    }
                    _ => {}
                }
            }
            Poll::Ready(Ok(()))
        }

        fn send<F: FrontendProtocol>(&mut self, message: F) {
            frontend::write(message, &mut self.sent);
        }

        fn send_startup(&mut self, startup: frontend::Startup) {
            startup.write(&mut self.sent);
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
}
