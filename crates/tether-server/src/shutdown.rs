use std::sync::atomic::{AtomicBool, Ordering};

use tether_common::Result;

use crate::coordinator::CoordinatorHandle;
use crate::engine::{ScriptEngine, ScriptValue};

/// Global script function invoked once when the process is asked to stop.
pub const QUIT_HOOK: &str = "onApplicationQuit";

/// Signal-driven drain of the execution coordinator.
///
/// On the first termination signal the script's [`QUIT_HOOK`] runs on the
/// coordinator, after every task already queued, and the coordinator is then
/// stopped. Later signals and repeated drains are ignored.
pub struct ShutdownCoordinator<S> {
    coordinator: CoordinatorHandle<S>,
    fired: AtomicBool,
}

impl<S: ScriptEngine + 'static> ShutdownCoordinator<S> {
    pub fn new(coordinator: CoordinatorHandle<S>) -> Self {
        Self {
            coordinator,
            fired: AtomicBool::new(false),
        }
    }

    /// Resolves on Ctrl-C or SIGTERM with the signal's name.
    pub async fn wait_for_signal() -> Result<&'static str> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    Ok("SIGINT")
                }
                _ = terminate.recv() => Ok("SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            Ok("SIGINT")
        }
    }

    /// Runs the quit hook with `signal` and stops the coordinator.
    ///
    /// Returns `Ok(false)` without doing anything if a drain already ran.
    pub async fn drain(&self, signal: &str) -> Result<bool> {
        if self.fired.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        tracing::info!("Received {}, draining", signal);

        let args = [ScriptValue::Str(signal.to_string())];
        let result = self
            .coordinator
            .call_async(move |engine: &mut S| match engine.invoke_global(QUIT_HOOK, &args) {
                Ok(true) => tracing::debug!("{} completed", QUIT_HOOK),
                Ok(false) => tracing::debug!("No {} defined", QUIT_HOOK),
                Err(e) => tracing::error!("{} failed: {}", QUIT_HOOK, e),
            })
            .await;

        self.coordinator.stop();
        result?;
        Ok(true)
    }

    /// Waits for a termination signal, then drains.
    pub async fn run(&self) -> Result<()> {
        let signal = Self::wait_for_signal().await?;
        self.drain(signal).await?;
        Ok(())
    }

    pub fn has_drained(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
