//! Shardgate Metrics Collection
//!
//! Lock-free counters for the shardgate router: per-operation latency and
//! outcome, request distribution across shards, documents inserted, and the
//! lifecycle of merged cursors.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: atomic counters plus `RwLock`-guarded label maps
//! - [`MetricsCollector`]: recording interface and built-in command handling
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! # Built-in Commands
//!
//! The router answers two commands itself instead of forwarding them:
//!
//! - **`_metrics`**: the current [`MetricsSnapshot`]
//! - **`_info`**: a [`ServerInfo`] with version and uptime
//!
//! # Usage Example
//!
//! ```rust
//! use shardgate_metrics::{MetricsCollector, RouterMetricsCollector};
//! use std::time::Instant;
//!
//! let collector = RouterMetricsCollector::new();
//! let start = Instant::now();
//! collector.record_shard_request("shard0");
//! collector.record_call("query", start, true);
//!
//! let snapshot = collector.snapshot();
//! assert_eq!(snapshot.total_operations, 1);
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::{MetricsCollector, RouterMetricsCollector, INFO_COMMAND, METRICS_COMMAND};
pub use registry::{MetricsConfig, MetricsRegistry};
pub use snapshot::{
    CursorMetrics, MetricsSnapshot, OperationMetrics, ServerInfo, ServerType, ShardMetrics,
};
