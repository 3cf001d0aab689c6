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

use serde::{Deserialize, Serialize};

/// Point-in-time copy of every counter in a [`crate::MetricsRegistry`].
///
/// Serialized with camelCase keys, the naming scripts see from `net.stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub version: String,
    pub uptime_ms: u64,

    pub sessions_accepted: u64,
    pub sessions_open: u64,
    pub sessions_closed: u64,

    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,

    /// Sessions dropped because their outbound queue was full.
    pub overflow_drops: u64,
    /// Sessions closed by an expired read or write deadline.
    pub timeouts: u64,
    /// Exceptions thrown by script callbacks.
    pub script_errors: u64,

    pub tasks_submitted: u64,
    pub tasks_executed: u64,
    pub tasks_queued: u64,
    /// Total time spent executing coordinator tasks.
    pub busy_ns: u64,
}

impl MetricsSnapshot {
    /// Renders the snapshot as a single-line JSON string for logging.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
