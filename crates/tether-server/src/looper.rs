//! Periodic and one-shot script timers.
//!
//! Timers run on the tokio runtime and only ever touch the script through
//! coordinator tasks. Time spent inside ticker callbacks is accumulated in a
//! shared [`LoopCounter`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_common::{Result, TetherError};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::CoordinatorHandle;
use crate::engine::ScriptEngine;
use crate::registry::Handle;

/// Nanoseconds spent inside ticker callbacks.
///
/// Only coordinator tasks add to it; any thread may read it.
#[derive(Debug, Default)]
pub struct LoopCounter {
    nanos: AtomicU64,
}

impl LoopCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::Relaxed)
    }
}

/// A running periodic timer. Stopping it is idempotent.
#[derive(Debug, Clone)]
pub struct Ticker {
    token: CancellationToken,
}

impl Ticker {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Schedules script callbacks on timers.
pub struct Looper<S> {
    coordinator: CoordinatorHandle<S>,
    runtime: RuntimeHandle,
    counter: Arc<LoopCounter>,
}

impl<S: ScriptEngine + 'static> Looper<S> {
    pub fn new(
        coordinator: CoordinatorHandle<S>,
        runtime: RuntimeHandle,
        counter: Arc<LoopCounter>,
    ) -> Self {
        Self {
            coordinator,
            runtime,
            counter,
        }
    }

    /// Invokes `callback` every `period` until the returned ticker is stopped.
    ///
    /// The first tick fires one period after the call. If the coordinator
    /// falls behind, ticks are delayed rather than bunched. The callback is
    /// released once the ticker stops.
    ///
    /// # Errors
    ///
    /// Returns `TetherError::InvalidConfig` for a zero period.
    pub fn start_ticker(&self, period: Duration, callback: Handle) -> Result<Ticker> {
        if period.is_zero() {
            return Err(TetherError::InvalidConfig(
                "ticker period must be greater than zero".to_string(),
            ));
        }

        let token = CancellationToken::new();
        let ticker = Ticker {
            token: token.clone(),
        };
        let coordinator = self.coordinator.clone();
        let counter = Arc::clone(&self.counter);

        self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let counter = Arc::clone(&counter);
                let submitted = coordinator.submit(move |engine: &mut S| {
                    let started = Instant::now();
                    if let Err(e) = engine.invoke(callback, &[]) {
                        tracing::error!("Ticker callback {} failed: {}", callback, e);
                    }
                    counter.add(started.elapsed());
                });
                if submitted.is_err() {
                    return;
                }
            }

            let _ = coordinator.submit(move |engine: &mut S| engine.release_callback(callback));
        });

        Ok(ticker)
    }

    /// Invokes `callback` once after `delay`, then releases it.
    pub fn after(&self, delay: Duration, callback: Handle) {
        let coordinator = self.coordinator.clone();

        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = coordinator.submit(move |engine: &mut S| {
                if let Err(e) = engine.invoke(callback, &[]) {
                    tracing::error!("Timer callback {} failed: {}", callback, e);
                }
                engine.release_callback(callback);
            });
        });
    }

    pub fn counter(&self) -> &Arc<LoopCounter> {
        &self.counter
    }
}
