//! Per-connection lifecycle.
//!
//! A [`Session`] is shared between three parties: the driver task that owns
//! the socket, the write loop it spawns, and script bindings calling
//! [`Session::send`] from the coordinator thread. All shared state is atomic
//! or behind a short-lived lock; nothing is held across I/O.
//!
//! # Lifecycle
//!
//! ```text
//! Open ──(first close trigger)──► Closing ──(both loops exited)──► Closed
//! ```
//!
//! Exactly one trigger moves the session out of `Open` and its
//! [`CloseReason`] is recorded. The driver submits the terminal `closed`
//! event only after the read and write loops have both exited, so every
//! `data` event for a session is enqueued before its `closed` event.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tether_common::{
    read_frame, write_frame, ConnectPolicy, Framing, ListenerConfig, Result, TetherError,
};
use tether_metrics::MetricsRegistry;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::registry::Handle;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Why a session left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Timeout,
    ReadFailed,
    Framing,
    WriteFailed,
    Overflow,
    Requested,
    ListenerShutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Timeout => "timeout",
            CloseReason::ReadFailed => "read_failed",
            CloseReason::Framing => "framing",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Overflow => "overflow",
            CloseReason::Requested => "requested",
            CloseReason::ListenerShutdown => "listener_shutdown",
        }
    }

    fn from_read_error(err: &TetherError) -> Self {
        if err.is_timeout() {
            return CloseReason::Timeout;
        }
        match err {
            TetherError::PeerClosed | TetherError::Connection(_) => CloseReason::PeerClosed,
            TetherError::Framing(_) => CloseReason::Framing,
            _ => CloseReason::ReadFailed,
        }
    }

    fn from_write_error(err: &TetherError) -> Self {
        if err.is_timeout() {
            CloseReason::Timeout
        } else {
            CloseReason::WriteFailed
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why [`Session::send`] rejected a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("session is not open")]
    Closed,
    #[error("outbound queue is full, session closed")]
    Overflow,
}

impl SendError {
    /// Script-visible status code: -1 for closed, -2 for overflow.
    pub fn status(self) -> i32 {
        match self {
            SendError::Closed => -1,
            SendError::Overflow => -2,
        }
    }
}

/// Maps a send result onto the 0 / -1 / -2 status scripts receive.
pub fn send_status(result: std::result::Result<(), SendError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.status(),
    }
}

/// Receives session lifecycle events from the driver.
///
/// Implementations must not block: each method only enqueues work.
pub trait EventSink: Send + Sync {
    /// The session became visible. The returned receiver fires once the
    /// event has been fully handled.
    fn connected(&self, session: &Arc<Session>) -> Result<oneshot::Receiver<()>>;

    fn data(&self, session: &Arc<Session>, payload: Bytes) -> Result<()>;

    /// Terminal event. Only sent for sessions whose `connected` was sent.
    fn closed(&self, session: &Arc<Session>) -> Result<()>;
}

/// One accepted connection.
pub struct Session {
    id: u32,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    length_prefixed: AtomicBool,
    io_timeout: watch::Sender<Duration>,
    chunk_size: usize,
    max_frame_size: usize,
    max_pending: usize,
    connect: ConnectPolicy,
    pending: Mutex<VecDeque<Bytes>>,
    outbound: Notify,
    cancel: CancellationToken,
    handle: OnceLock<Handle>,
}

impl Session {
    /// Creates an open session.
    ///
    /// The session's cancellation token is a child of `parent`, so cancelling
    /// the listener's token tears down every session it accepted.
    pub fn new(
        id: u32,
        peer: Option<SocketAddr>,
        config: &ListenerConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            state: AtomicU8::new(OPEN),
            close_reason: OnceLock::new(),
            length_prefixed: AtomicBool::new(config.framing.is_length_prefixed()),
            io_timeout: watch::channel(config.io_timeout).0,
            chunk_size: config.chunk_size,
            max_frame_size: config.max_frame_size,
            max_pending: config.max_pending,
            connect: config.connect,
            pending: Mutex::new(VecDeque::with_capacity(config.max_pending)),
            outbound: Notify::new(),
            cancel: parent.child_token(),
            handle: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// The handle scripts use for this session, once it has been registered.
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    /// Records the session's handle. Only the first call has any effect.
    pub fn set_handle(&self, handle: Handle) {
        let _ = self.handle.set(handle);
    }

    pub fn framing(&self) -> Framing {
        Framing::from_length_prefixed(self.length_prefixed.load(Ordering::Acquire))
    }

    /// Switches framing for subsequent reads and writes.
    pub fn set_framing(&self, length_prefixed: bool) {
        self.length_prefixed.store(length_prefixed, Ordering::Release);
    }

    /// Per-operation deadline. Zero means no deadline.
    pub fn io_timeout(&self) -> Duration {
        *self.io_timeout.borrow()
    }

    /// Changes the per-operation deadline.
    ///
    /// A read already waiting is re-armed to expire `timeout` after it
    /// started; zero disarms it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.io_timeout.send_replace(timeout);
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        self.connect
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Queues a payload for the write loop.
    ///
    /// # Errors
    ///
    /// - `SendError::Closed` if the session is no longer open
    /// - `SendError::Overflow` if the queue already holds `max_pending`
    ///   payloads; the session is closed with [`CloseReason::Overflow`]
    pub fn send(&self, payload: Bytes) -> std::result::Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }

        {
            let mut pending = self.lock_pending();
            if pending.len() >= self.max_pending {
                drop(pending);
                tracing::warn!(
                    "Session {}: {} sends pending, dropping slow peer",
                    self.id,
                    self.max_pending
                );
                self.close_with(CloseReason::Overflow);
                return Err(SendError::Overflow);
            }
            pending.push_back(payload);
        }

        self.outbound.notify_one();
        Ok(())
    }

    /// Closes the session at the script's request.
    ///
    /// Returns `false` if the session was already closing.
    pub fn close(&self) -> bool {
        self.close_with(CloseReason::Requested)
    }

    /// Moves the session out of `Open` if it still is, recording `reason`.
    ///
    /// Cancels the session token, which unblocks any pending read or write.
    /// Returns `true` only for the call that performed the transition.
    pub fn close_with(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        true
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn pop_pending(&self) -> Option<Bytes> {
        self.lock_pending().pop_front()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("close_reason", &self.close_reason())
            .field("handle", &self.handle())
            .finish()
    }
}

/// Drives a session over `stream` until it closes.
///
/// Spawns the write loop, runs the read loop on the current task, and emits
/// lifecycle events to `sink` according to the session's connect policy.
/// Resolves after the terminal event has been submitted.
pub async fn run<T, E>(
    session: Arc<Session>,
    stream: T,
    sink: Arc<E>,
    metrics: Arc<MetricsRegistry>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
    E: EventSink + ?Sized + 'static,
{
    metrics.record_session_opened();
    tracing::debug!("Session {} opened (peer: {:?})", session.id, session.peer);

    let mut connected = false;
    if session.connect == ConnectPolicy::Eager {
        match sink.connected(&session) {
            Ok(done) => {
                connected = true;
                tokio::select! {
                    _ = done => {}
                    _ = session.cancelled() => {}
                }
            }
            Err(e) => {
                tracing::debug!("Session {}: connect event not delivered: {}", session.id, e);
                session.close_with(CloseReason::ListenerShutdown);
            }
        }
    }

    let (reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(
        Arc::clone(&session),
        writer,
        Arc::clone(&metrics),
    ));

    let connected = read_loop(&session, reader, sink.as_ref(), &metrics, connected).await;

    if let Err(e) = writer_task.await {
        tracing::error!("Session {}: write loop failed: {}", session.id, e);
    }

    let reason = session.close_reason().unwrap_or(CloseReason::Requested);
    match reason {
        CloseReason::Overflow => metrics.record_overflow_drop(),
        CloseReason::Timeout => metrics.record_timeout(),
        _ => {}
    }
    metrics.record_session_closed();
    tracing::debug!("Session {} closed: {}", session.id, reason);

    if connected {
        if let Err(e) = sink.closed(&session) {
            tracing::debug!("Session {}: close event not delivered: {}", session.id, e);
        }
    }
    session.mark_closed();
}

/// Returns whether `connected` has been emitted by the time the loop exits.
async fn read_loop<R, E>(
    session: &Arc<Session>,
    mut reader: R,
    sink: &E,
    metrics: &MetricsRegistry,
    mut connected: bool,
) -> bool
where
    R: AsyncRead + Unpin,
    E: EventSink + ?Sized,
{
    let mut timeouts = session.io_timeout.subscribe();

    loop {
        let framing = session.framing();
        let started = Instant::now();
        let mut timeout = *timeouts.borrow_and_update();

        let read = read_frame(&mut reader, framing, session.chunk_size, session.max_frame_size);
        tokio::pin!(read);
        let expiry = tokio::time::sleep_until(started + timeout);
        tokio::pin!(expiry);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break None,
                changed = timeouts.changed() => {
                    // The sender lives in the session, so this never fails.
                    if changed.is_ok() {
                        timeout = *timeouts.borrow_and_update();
                        expiry.as_mut().reset(started + timeout);
                    }
                }
                _ = &mut expiry, if !timeout.is_zero() => {
                    break Some(Err(TetherError::Timeout(timeout.as_millis() as u64)));
                }
                result = &mut read => break Some(result),
            }
        };

        let Some(outcome) = outcome else {
            session.close_with(CloseReason::ListenerShutdown);
            break;
        };

        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                if e.is_connection_level() {
                    tracing::debug!("Session {}: read ended: {}", session.id, e);
                } else {
                    tracing::warn!("Session {}: read failed: {}", session.id, e);
                }
                session.close_with(CloseReason::from_read_error(&e));
                break;
            }
        };
        metrics.record_frame_received(payload.len());

        if !connected {
            if let Err(e) = sink.connected(session) {
                tracing::debug!("Session {}: connect event not delivered: {}", session.id, e);
                session.close_with(CloseReason::ListenerShutdown);
                break;
            }
            connected = true;
        }

        if let Err(e) = sink.data(session, payload) {
            tracing::debug!("Session {}: data event not delivered: {}", session.id, e);
            session.close_with(CloseReason::ListenerShutdown);
            break;
        }
    }

    connected
}

async fn write_loop<W>(session: Arc<Session>, mut writer: W, metrics: Arc<MetricsRegistry>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = session.cancelled() => return,
            _ = session.outbound.notified() => {}
        }

        while let Some(payload) = session.pop_pending() {
            let framing = session.framing();
            let deadline = session.io_timeout();

            let result = tokio::select! {
                biased;
                _ = session.cancelled() => return,
                result = with_deadline(deadline, write_frame(&mut writer, framing, &payload)) => result,
            };

            if let Err(e) = result {
                if e.is_connection_level() {
                    tracing::debug!("Session {}: write failed: {}", session.id, e);
                } else {
                    tracing::warn!("Session {}: write failed: {}", session.id, e);
                }
                session.close_with(CloseReason::from_write_error(&e));
                return;
            }
            metrics.record_frame_sent(payload.len());
        }
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if deadline.is_zero() {
        return fut.await;
    }

    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TetherError::Timeout(deadline.as_millis() as u64)),
    }
}
