// Copyright 2025 Shardgate Authors
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
use std::collections::BTreeMap;

/// Role of the process answering `_info`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Router,
}

/// Reply body of the `_info` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_type: ServerType,
    pub version: String,
    pub uptime_ms: u64,
}

impl ServerInfo {
    pub fn new(server_type: ServerType, uptime_ms: u64) -> Self {
        Self {
            server_type,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
        }
    }
}

/// Counters and latency summary for one operation label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Requests routed to one shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardMetrics {
    pub request_count: u64,
    pub last_request_ms: u64,
}

/// Merged-cursor lifecycle counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorMetrics {
    pub opened: u64,
    pub closed: u64,
    /// Closed because the time budget ran out or the cursor sat idle.
    pub timed_out: u64,
    pub open: u64,
}

/// Reply body of the `_metrics` command.
///
/// Maps are ordered so the serialized form is stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub inserted_documents: u64,
    pub uptime_ms: u64,
    pub cursors: CursorMetrics,
    pub operations: BTreeMap<String, OperationMetrics>,
    pub shards: BTreeMap<String, ShardMetrics>,
}
