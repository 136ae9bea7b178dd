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

use crate::registry::{MetricsConfig, MetricsRegistry};
use crate::snapshot::{MetricsSnapshot, ServerInfo, ServerType};
use serde_json::{json, Value};
use shardgate_common::protocol::error::{Result, ShardgateError};
use shardgate_common::Document;
use std::sync::Arc;
use std::time::Instant;

/// Name of the built-in command returning a [`MetricsSnapshot`].
pub const METRICS_COMMAND: &str = "_metrics";
/// Name of the built-in command returning a [`ServerInfo`].
pub const INFO_COMMAND: &str = "_info";

/// Metrics collection as seen by the router.
///
/// Besides recording, implementations answer the built-in `_metrics` and
/// `_info` commands. The router checks [`is_metrics_request`] on the
/// command name before dispatching and never forwards these to a shard.
///
/// [`is_metrics_request`]: MetricsCollector::is_metrics_request
///
/// # Example
///
/// ```rust
/// use shardgate_metrics::{MetricsCollector, RouterMetricsCollector};
/// use std::time::Instant;
///
/// let collector = RouterMetricsCollector::new();
///
/// let start = Instant::now();
/// // ... route a query ...
/// collector.record_call("query", start, true);
///
/// assert!(collector.is_metrics_request("_metrics"));
/// let reply = collector.handle_metrics_request("_metrics").unwrap();
/// assert_eq!(reply["total_operations"], 1);
/// ```
pub trait MetricsCollector: Send + Sync {
    /// `true` for `_metrics` and `_info`.
    fn is_metrics_request(&self, command: &str) -> bool;

    /// Builds the reply document for a built-in command.
    ///
    /// Fails with `InvalidArgument` for any other command name.
    fn handle_metrics_request(&self, command: &str) -> Result<Document>;

    /// Records one routed operation with its outcome and latency.
    fn record_call(&self, operation: &str, start_time: Instant, success: bool);

    fn snapshot(&self) -> MetricsSnapshot;
}

/// Metrics collector for the router.
///
/// Tracks per-operation latency, per-shard request distribution, documents
/// inserted through the batch writer, and merged-cursor lifecycle.
pub struct RouterMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl RouterMetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::with_config(config)),
        }
    }

    /// Shares an existing registry, e.g. between a router and a test.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn record_shard_request(&self, shard: &str) {
        self.registry.record_shard_request(shard);
    }

    pub fn record_inserts(&self, n: u64) {
        self.registry.record_inserts(n);
    }

    pub fn record_cursor_opened(&self) {
        self.registry.record_cursor_opened();
    }

    pub fn record_cursor_closed(&self) {
        self.registry.record_cursor_closed();
    }

    pub fn record_cursor_timed_out(&self) {
        self.registry.record_cursor_timed_out();
    }
}

impl Default for RouterMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn ok_document(body: Value) -> Document {
    let mut doc = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Document::new();
            map.insert("value".into(), other);
            map
        }
    };
    doc.insert("ok".into(), json!(1));
    doc
}

impl MetricsCollector for RouterMetricsCollector {
    fn is_metrics_request(&self, command: &str) -> bool {
        command == METRICS_COMMAND || command == INFO_COMMAND
    }

    fn handle_metrics_request(&self, command: &str) -> Result<Document> {
        match command {
            METRICS_COMMAND => Ok(ok_document(serde_json::to_value(self.snapshot())?)),
            INFO_COMMAND => {
                let info = ServerInfo::new(ServerType::Router, self.registry.uptime_ms());
                Ok(ok_document(serde_json::to_value(info)?))
            }
            other => Err(ShardgateError::InvalidArgument(format!(
                "{} is not a built-in metrics command",
                other
            ))),
        }
    }

    fn record_call(&self, operation: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_operation(operation, latency_us, success);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_command_names() {
        let collector = RouterMetricsCollector::new();
        assert!(collector.is_metrics_request("_metrics"));
        assert!(collector.is_metrics_request("_info"));
        assert!(!collector.is_metrics_request("ping"));
    }

    #[test]
    fn test_info_reply() {
        let collector = RouterMetricsCollector::new();
        let reply = collector.handle_metrics_request("_info").unwrap();
        assert_eq!(reply["server_type"], "router");
        assert_eq!(reply["ok"], 1);
        assert_eq!(reply["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_metrics_reply_reflects_recording() {
        let collector = RouterMetricsCollector::new();
        collector.record_call("query", Instant::now(), true);
        collector.record_call("command", Instant::now(), false);
        collector.record_shard_request("shard0");
        collector.record_inserts(4);
        collector.record_cursor_opened();

        let reply = collector.handle_metrics_request("_metrics").unwrap();
        assert_eq!(reply["ok"], 1);
        assert_eq!(reply["total_operations"], 2);
        assert_eq!(reply["failed_operations"], 1);
        assert_eq!(reply["inserted_documents"], 4);
        assert_eq!(reply["cursors"]["open"], 1);
        assert_eq!(reply["shards"]["shard0"]["request_count"], 1);
    }

    #[test]
    fn test_unknown_builtin_is_rejected() {
        let collector = RouterMetricsCollector::new();
        let err = collector.handle_metrics_request("ping").unwrap_err();
        assert!(matches!(err, ShardgateError::InvalidArgument(_)));
    }

    #[test]
    fn test_shared_registry() {
        let registry = Arc::new(MetricsRegistry::new());
        let a = RouterMetricsCollector::with_registry(Arc::clone(&registry));
        let b = RouterMetricsCollector::with_registry(Arc::clone(&registry));
        a.record_inserts(1);
        b.record_inserts(2);
        assert_eq!(registry.snapshot().inserted_documents, 3);
    }
}
