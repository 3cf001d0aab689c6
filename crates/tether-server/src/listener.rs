use std::net::SocketAddr;
use std::sync::Arc;

use tether_common::{ListenerConfig, Result, TetherError};
use tether_metrics::MetricsRegistry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::{self, EventSink, Session};

/// A TCP accept loop feeding sessions into an [`EventSink`].
///
/// Session ids start at 1 and increase monotonically per listener. Shutting
/// the listener down stops accepting and closes every session it accepted
/// with `CloseReason::ListenerShutdown`.
pub struct Listener {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `addr` and starts accepting.
    ///
    /// # Arguments
    /// * `addr` - The address to bind to (e.g., "0.0.0.0:8080")
    /// * `config` - Settings inherited by every accepted session
    /// * `sink` - Receiver of session events
    /// * `metrics` - Registry for connection and frame counters
    pub async fn bind<E>(
        addr: &str,
        config: ListenerConfig,
        sink: Arc<E>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self>
    where
        E: EventSink + ?Sized + 'static,
    {
        config.validate()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TetherError::Connection(format!("Failed to bind to {}: {}", addr, e)))?;

        Self::start(listener, config, sink, metrics)
    }

    /// Starts accepting on an already bound standard listener.
    ///
    /// Must be called from within a tokio runtime context. Used by the script
    /// host, which binds synchronously on the coordinator thread.
    pub fn from_std<E>(
        listener: std::net::TcpListener,
        config: ListenerConfig,
        sink: Arc<E>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self>
    where
        E: EventSink + ?Sized + 'static,
    {
        config.validate()?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;

        Self::start(listener, config, sink, metrics)
    }

    fn start<E>(
        listener: TcpListener,
        config: ListenerConfig,
        sink: Arc<E>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self>
    where
        E: EventSink + ?Sized + 'static,
    {
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();

        tracing::info!("Listening on {} ({:?})", local_addr, config.framing);

        let task = tokio::spawn(accept_loop(
            listener,
            config,
            sink,
            metrics,
            token.clone(),
        ));

        Ok(Self {
            local_addr,
            token,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes all sessions of this listener.
    ///
    /// Sessions still emit their terminal events afterwards.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Listener on {} shutting down", self.local_addr);
            self.token.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shuts down and waits for the accept loop to exit.
    pub async fn close(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn accept_loop<E>(
    listener: TcpListener,
    config: ListenerConfig,
    sink: Arc<E>,
    metrics: Arc<MetricsRegistry>,
    token: CancellationToken,
) where
    E: EventSink + ?Sized + 'static,
{
    let mut next_id: u32 = 0;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // Per-connection accept failures (e.g. aborted handshakes or
                // fd exhaustion) do not end the listener.
                tracing::warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        next_id = next_id.wrapping_add(1).max(1);
        let session = Session::new(next_id, Some(peer), &config, &token);

        tokio::spawn(session::run(
            session,
            stream,
            Arc::clone(&sink),
            Arc::clone(&metrics),
        ));
    }

    tracing::debug!("Accept loop for {:?} exited", listener.local_addr());
}
