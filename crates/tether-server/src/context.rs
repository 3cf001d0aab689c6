use std::sync::Arc;

use tether_metrics::MetricsRegistry;
use tokio::runtime::Handle as RuntimeHandle;

use crate::coordinator::CoordinatorHandle;
use crate::engine::ScriptEngine;
use crate::looper::{LoopCounter, Looper};

/// Everything a component needs to reach the rest of the server.
///
/// Built once by the embedder and passed explicitly; there is no
/// process-wide current context.
pub struct ServerContext<S> {
    coordinator: CoordinatorHandle<S>,
    runtime: RuntimeHandle,
    counter: Arc<LoopCounter>,
    metrics: Arc<MetricsRegistry>,
}

impl<S> Clone for ServerContext<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            runtime: self.runtime.clone(),
            counter: Arc::clone(&self.counter),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<S: ScriptEngine + 'static> ServerContext<S> {
    /// Creates a context sharing the coordinator's metrics registry.
    pub fn new(coordinator: CoordinatorHandle<S>, runtime: RuntimeHandle) -> Self {
        let metrics = Arc::clone(coordinator.metrics());
        Self {
            coordinator,
            runtime,
            counter: Arc::new(LoopCounter::new()),
            metrics,
        }
    }

    pub fn coordinator(&self) -> &CoordinatorHandle<S> {
        &self.coordinator
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub fn loop_counter(&self) -> &Arc<LoopCounter> {
        &self.counter
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn looper(&self) -> Looper<S> {
        Looper::new(
            self.coordinator.clone(),
            self.runtime.clone(),
            Arc::clone(&self.counter),
        )
    }
}
