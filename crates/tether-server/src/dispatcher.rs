use std::sync::Arc;

use bytes::Bytes;
use tether_common::Result;
use tether_metrics::MetricsRegistry;
use tokio::sync::oneshot;

use crate::coordinator::CoordinatorHandle;
use crate::engine::{ScriptEngine, ScriptValue};
use crate::registry::Handle;
use crate::session::{EventSink, Session};

/// Event kinds as scripts see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum EventKind {
    Connected = 1,
    Data = 2,
    Closed = 3,
}

impl EventKind {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Turns session events into coordinator tasks that call one script callback.
///
/// The callback is invoked as `onEvent(kind, sessionId, sessionHandle, payload)`
/// where `payload` is `null` for `Connected`, `Closed` and empty data.
///
/// One dispatcher serves one listener. It holds the script's callback handle
/// and releases it on the coordinator when the last reference (the listener
/// or a session still draining) goes away.
pub struct EventDispatcher<S: ScriptEngine + 'static> {
    coordinator: CoordinatorHandle<S>,
    callback: Handle,
    metrics: Arc<MetricsRegistry>,
}

impl<S: ScriptEngine + 'static> EventDispatcher<S> {
    pub fn new(coordinator: CoordinatorHandle<S>, callback: Handle) -> Self {
        let metrics = Arc::clone(coordinator.metrics());
        Self {
            coordinator,
            callback,
            metrics,
        }
    }

    pub fn callback(&self) -> Handle {
        self.callback
    }
}

fn deliver<S: ScriptEngine>(
    engine: &mut S,
    metrics: &MetricsRegistry,
    callback: Handle,
    kind: EventKind,
    session: &Session,
    handle: Handle,
    payload: Option<Bytes>,
) {
    let args = [
        ScriptValue::Int(kind.code()),
        ScriptValue::from(session.id()),
        ScriptValue::from(handle.id()),
        ScriptValue::from(payload.filter(|p| !p.is_empty())),
    ];

    if let Err(e) = engine.invoke(callback, &args) {
        metrics.record_script_error();
        tracing::error!(
            "Session {}: {:?} callback failed: {}",
            session.id(),
            kind,
            e
        );
    }
}

impl<S: ScriptEngine + 'static> EventSink for EventDispatcher<S> {
    fn connected(&self, session: &Arc<Session>) -> Result<oneshot::Receiver<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        let session = Arc::clone(session);
        let metrics = Arc::clone(&self.metrics);
        let callback = self.callback;

        self.coordinator.submit(move |engine: &mut S| {
            let handle = engine.sessions().register(Arc::clone(&session));
            session.set_handle(handle);
            deliver(
                engine,
                &metrics,
                callback,
                EventKind::Connected,
                &session,
                handle,
                None,
            );
            let _ = done_tx.send(());
        })?;

        Ok(done_rx)
    }

    fn data(&self, session: &Arc<Session>, payload: Bytes) -> Result<()> {
        let session = Arc::clone(session);
        let metrics = Arc::clone(&self.metrics);
        let callback = self.callback;

        self.coordinator.submit(move |engine: &mut S| {
            let Some(handle) = session.handle() else {
                tracing::debug!("Session {}: data before connect, dropped", session.id());
                return;
            };
            deliver(
                engine,
                &metrics,
                callback,
                EventKind::Data,
                &session,
                handle,
                Some(payload),
            );
        })
    }

    fn closed(&self, session: &Arc<Session>) -> Result<()> {
        let session = Arc::clone(session);
        let metrics = Arc::clone(&self.metrics);
        let callback = self.callback;

        self.coordinator.submit(move |engine: &mut S| {
            let Some(handle) = session.handle() else {
                return;
            };
            deliver(
                engine,
                &metrics,
                callback,
                EventKind::Closed,
                &session,
                handle,
                None,
            );
            if let Err(e) = engine.sessions().release(handle) {
                tracing::debug!("Session {}: {}", session.id(), e);
            }
        })
    }
}

impl<S: ScriptEngine + 'static> Drop for EventDispatcher<S> {
    fn drop(&mut self) {
        let callback = self.callback;
        let _ = self
            .coordinator
            .submit(move |engine: &mut S| engine.release_callback(callback));
    }
}
