//! Tether Metrics Collection
//!
//! This crate provides thread-safe counters for the tether server: session
//! lifecycle, traffic, backpressure drops and execution-coordinator load.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free atomic counters, shared via `Arc`
//! - [`MetricsSnapshot`]: serializable point-in-time copy of the counters
//!
//! Counters are written from I/O tasks and from the coordinator thread with
//! relaxed atomics; a snapshot is therefore internally consistent per counter
//! but not across counters.
//!
//! # Usage Example
//!
//! ```rust
//! use tether_metrics::MetricsRegistry;
//! use std::time::Duration;
//!
//! let metrics = MetricsRegistry::new();
//! metrics.record_session_opened();
//! metrics.record_frame_received(128);
//! metrics.record_task_executed(Duration::from_micros(40));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.sessions_open, 1);
//! assert_eq!(snapshot.bytes_received, 128);
//! ```

mod registry;
mod snapshot;

pub use registry::MetricsRegistry;
pub use snapshot::MetricsSnapshot;
