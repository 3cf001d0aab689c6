// Copyright 2025 Tether Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::snapshot::MetricsSnapshot;

/// Thread-safe counter storage.
///
/// All methods take `&self` and use relaxed atomics; share the registry with
/// `Arc<MetricsRegistry>`.
#[derive(Debug)]
pub struct MetricsRegistry {
    started: Instant,

    sessions_accepted: AtomicU64,
    sessions_open: AtomicU64,
    sessions_closed: AtomicU64,

    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,

    overflow_drops: AtomicU64,
    timeouts: AtomicU64,
    script_errors: AtomicU64,

    tasks_submitted: AtomicU64,
    tasks_executed: AtomicU64,
    busy_ns: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            sessions_accepted: AtomicU64::new(0),
            sessions_open: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            overflow_drops: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            script_errors: AtomicU64::new(0),
            tasks_submitted: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
        }
    }

    pub fn record_session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        // Never wraps below zero even if a close is recorded without an open.
        let _ = self
            .sessions_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_overflow_drop(&self) {
        self.overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_script_error(&self) {
        self.script_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one executed coordinator task and the time it took.
    pub fn record_task_executed(&self, elapsed: Duration) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.busy_ns
            .fetch_add(duration_to_nanos(elapsed), Ordering::Relaxed);
    }

    /// Number of tasks submitted but not yet executed.
    pub fn tasks_queued(&self) -> u64 {
        let submitted = self.tasks_submitted.load(Ordering::Relaxed);
        let executed = self.tasks_executed.load(Ordering::Relaxed);
        submitted.saturating_sub(executed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_open: self.sessions_open.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            script_errors: self.script_errors.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_queued: self.tasks_queued(),
            busy_ns: self.busy_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Saturating conversion; a single task will not run for 584 years.
pub(crate) fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
