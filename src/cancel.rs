//! Query cancellation and the statement timeout timer.
//!
//! Cancellation is out-of-band: a short-lived second connection delivers a
//! `CancelRequest` carrying the backend pid and secret key from startup. The
//! main connection is never touched; it observes the cancel as a server error
//! (`57014 query_canceled`) followed by `ReadyForQuery`.
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use crate::{
    Result,
    common::verbose,
    net::Socket,
    postgres::{backend::BackendKeyData, frontend::CancelRequest},
};

/// Out-of-order cancel protection.
///
/// ```text
/// IDLE ──start_execute──▶ IN_QUERY
/// IN_QUERY ──cancel()──▶ CANCELING ──cancel sent──▶ CANCELLED
/// IN_QUERY ──execute done──▶ IDLE
/// CANCELLED ──execute done──▶ IDLE
/// CANCELING ──execute done──▶ wait until CANCELLED, then IDLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelState {
    Idle = 0,
    InQuery = 1,
    Canceling = 2,
    Cancelled = 3,
}

/// Where the auxiliary cancel connection goes.
#[derive(Debug, Clone)]
pub(crate) enum CancelAddr {
    Tcp { host: String, port: u16 },
    Unix { path: String },
    /// No transport; transitions still happen. Used by scripted transports.
    #[cfg_attr(not(test), allow(dead_code, reason = "constructed by test transports"))]
    Disabled,
}

#[derive(Debug)]
pub(crate) struct CancelShared {
    state: AtomicU8,
    /// Bumped whenever the armed timer changes, so a timer that fires
    /// exactly as execution completes can tell it lost the race.
    timer_epoch: AtomicU64,
    /// The last acknowledged cancel originated from the timeout timer.
    timed_out: AtomicBool,
    key: Mutex<Option<BackendKeyData>>,
    addr: Mutex<CancelAddr>,
    wake: tokio::sync::Notify,
}

impl CancelShared {
    pub fn new(addr: CancelAddr) -> Arc<CancelShared> {
        Arc::new(CancelShared {
            state: AtomicU8::new(CancelState::Idle as u8),
            timer_epoch: AtomicU64::new(0),
            timed_out: AtomicBool::new(false),
            key: Mutex::new(None),
            addr: Mutex::new(addr),
            wake: tokio::sync::Notify::new(),
        })
    }

    pub fn set_key(&self, key: BackendKeyData) {
        *self.key.lock().expect("cancel key poisoned") = Some(key);
    }

    pub fn state(&self) -> CancelState {
        match self.state.load(Ordering::Acquire) {
            0 => CancelState::Idle,
            1 => CancelState::InQuery,
            2 => CancelState::Canceling,
            _ => CancelState::Cancelled,
        }
    }

    fn compare_swap(&self, from: CancelState, to: CancelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `IN_QUERY`. Called with the statement lock held, so the previous
    /// state is always `IDLE`.
    pub fn start_execute(&self) {
        self.timed_out.store(false, Ordering::Release);
        self.state.store(CancelState::InQuery as u8, Ordering::Release);
    }

    /// Leave the query state once the reply stream is drained.
    ///
    /// When a cancel is in flight this waits for `CANCELLED` so a racing
    /// canceller never observes a new query under the old state.
    pub async fn finish_execute(&self) {
        // the armed timer, if any, must never fire for the next execution
        self.timer_epoch.fetch_add(1, Ordering::AcqRel);

        if self.compare_swap(CancelState::InQuery, CancelState::Idle) {
            return;
        }

        loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            if self.compare_swap(CancelState::Cancelled, CancelState::Idle) {
                return;
            }
            wake.await;
        }
    }

    /// Whether the cancel that just completed came from the timeout timer.
    pub fn took_timeout(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}

/// A handle that can cancel the in-flight execution from any task.
///
/// Holds only the shared cancel state; no statement or connection borrow.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

impl CancelToken {
    pub(crate) fn new(shared: Arc<CancelShared>) -> CancelToken {
        CancelToken { shared }
    }

    /// Current cancel state, for diagnostics.
    pub fn state(&self) -> CancelState {
        self.shared.state()
    }

    /// Request cancellation of the current execution.
    ///
    /// A no-op unless a query is in flight; two concurrent cancels coalesce
    /// on the state compare-and-set. The acknowledgment still arrives on the
    /// main connection as `57014 query_canceled`.
    pub async fn cancel(&self) -> Result<()> {
        self.cancel_inner(false).await
    }

    async fn cancel_inner(&self, from_timer: bool) -> Result<()> {
        if !self.shared.compare_swap(CancelState::InQuery, CancelState::Canceling) {
            // IDLE, or another cancel already past the gate
            return Ok(());
        }

        if from_timer {
            self.shared.timed_out.store(true, Ordering::Release);
        }

        let sent = self.deliver().await;

        self.shared.state.store(CancelState::Cancelled as u8, Ordering::Release);
        self.shared.wake.notify_waiters();
        sent
    }

    async fn deliver(&self) -> Result<()> {
        let key = *self.shared.key.lock().expect("cancel key poisoned");
        let Some(key) = key else { return Ok(()) };
        let addr = self.shared.addr.lock().expect("cancel addr poisoned").clone();

        let mut socket = match addr {
            CancelAddr::Tcp { host, port } => Socket::connect_tcp(&host, port).await?,
            CancelAddr::Unix { path } => Socket::connect_socket(&path).await?,
            CancelAddr::Disabled => return Ok(()),
        };

        verbose!("cancel request for pid {}", key.process_id);

        let mut buf = BytesMut::with_capacity(16);
        CancelRequest {
            process_id: key.process_id,
            secret_key: key.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.flush().await?;
        // the server replies with nothing and closes the connection
        let _ = socket.shutdown().await;
        Ok(())
    }
}

/// Arms the statement timeout: a timer task that cancels the in-flight query
/// when it fires before execution completes.
///
/// The task holds the cancel state, never the statement. Disarming works by
/// bumping the epoch the task compares against.
pub(crate) struct TimeoutTimer {
    shared: Arc<CancelShared>,
    epoch: u64,
}

impl TimeoutTimer {
    pub fn arm(shared: &Arc<CancelShared>, timeout: Duration) -> TimeoutTimer {
        let epoch = shared.timer_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let task_shared = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // claim the armed slot; losing the race means the statement
            // finished first and disarmed the timer
            let claimed = task_shared
                .timer_epoch
                .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !claimed {
                return;
            }
            let token = CancelToken::new(Arc::clone(&task_shared));
            let _ = token.cancel_inner(true).await;
        });
        TimeoutTimer { shared: Arc::clone(shared), epoch }
    }

    /// True when the timer can no longer fire.
    pub fn disarm(self) -> bool {
        self.shared
            .timer_epoch
            .compare_exchange(self.epoch, self.epoch + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cancel_in_idle_is_a_noop() {
        let shared = CancelShared::new(CancelAddr::Disabled);
        let token = CancelToken::new(Arc::clone(&shared));
        token.cancel().await.unwrap();
        assert_eq!(shared.state(), CancelState::Idle);
    }

    #[tokio::test]
    async fn cancel_during_query_reaches_cancelled() {
        let shared = CancelShared::new(CancelAddr::Disabled);
        shared.start_execute();

        let token = CancelToken::new(Arc::clone(&shared));
        token.cancel().await.unwrap();
        assert_eq!(shared.state(), CancelState::Cancelled);

        shared.finish_execute().await;
        assert_eq!(shared.state(), CancelState::Idle);
    }

    #[tokio::test]
    async fn concurrent_cancels_coalesce() {
        let shared = CancelShared::new(CancelAddr::Disabled);
        shared.start_execute();

        let a = CancelToken::new(Arc::clone(&shared));
        let b = CancelToken::new(Arc::clone(&shared));
        let (ra, rb) = tokio::join!(a.cancel(), b.cancel());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(shared.state(), CancelState::Cancelled);
    }

    #[tokio::test]
    async fn finish_waits_for_inflight_cancel() {
        let shared = CancelShared::new(CancelAddr::Disabled);
        shared.start_execute();

        let token = CancelToken::new(Arc::clone(&shared));
        let canceller = tokio::spawn(async move { token.cancel().await });

        shared.finish_execute().await;
        assert_eq!(shared.state(), CancelState::Idle);
        canceller.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_and_marks_timeout() {
        let shared = CancelShared::new(CancelAddr::Disabled);
        shared.start_execute();

        let _timer = TimeoutTimer::arm(&shared, Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(shared.state(), CancelState::Cancelled);
        assert!(shared.took_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_cancels() {
        let shared = CancelShared::new(CancelAddr::Disabled);
        shared.start_execute();

        let timer = TimeoutTimer::arm(&shared, Duration::from_millis(500));
        assert!(timer.disarm());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(shared.state(), CancelState::InQuery);
        assert!(!shared.took_timeout());
    }
}
