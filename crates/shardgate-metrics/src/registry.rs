use crate::snapshot::{CursorMetrics, MetricsSnapshot, OperationMetrics, ShardMetrics};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Instant, SystemTime};

/// One bucket for zero plus one per power of two up to `u64::MAX`.
const NUM_LATENCY_BUCKETS: usize = 65;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Limits on how many distinct labels the registry tracks.
///
/// Operation labels come from a small fixed set, but shard names come from
/// the topology and can churn as shards are added and drained.
///
/// # Example
///
/// ```rust
/// use shardgate_metrics::MetricsConfig;
///
/// let config = MetricsConfig {
///     max_operations: 32,
///     max_shards: 16,
///     shard_ttl_secs: 600,
/// };
/// assert_eq!(config.max_shards, 16);
/// ```
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of operation labels to track.
    pub max_operations: usize,
    /// Maximum number of shards to track; least recently used are evicted.
    pub max_shards: usize,
    /// Shards with no request within this window are dropped.
    pub shard_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_operations: 64,
            max_shards: 256,
            shard_ttl_secs: 3600,
        }
    }
}

/// Power-of-two latency histogram.
///
/// Bucket `0` holds zero-latency samples; bucket `b > 0` holds samples in
/// `[2^(b-1), 2^b)` microseconds. Percentiles interpolate linearly inside
/// the bucket that contains the requested rank.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; NUM_LATENCY_BUCKETS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn bucket_for(latency_us: u64) -> usize {
        (u64::BITS - latency_us.leading_zeros()) as usize
    }

    fn bucket_bounds(bucket: usize) -> (u64, u64) {
        match bucket {
            0 => (0, 1),
            64 => (1 << 63, u64::MAX),
            b => (1 << (b - 1), 1 << b),
        }
    }

    fn record(&self, latency_us: u64) {
        self.buckets[Self::bucket_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile) + 99) / 100;
        let mut seen = 0;
        for (bucket, counter) in self.buckets.iter().enumerate() {
            let count = counter.load(Ordering::Relaxed);
            if count > 0 && seen + count >= target {
                let (lower, upper) = Self::bucket_bounds(bucket);
                let fraction = (target - seen) as f64 / count as f64;
                return lower + (fraction * (upper - lower) as f64) as u64;
            }
            seen += count;
        }
        Self::bucket_bounds(NUM_LATENCY_BUCKETS - 1).1
    }

    /// `(avg, p50, p95, p99)` in microseconds.
    fn summary(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (avg, self.percentile(50), self.percentile(95), self.percentile(99))
    }
}

/// Counters for one operation label (`query`, `getmore`, `command`, ...).
#[derive(Debug)]
struct OperationStats {
    count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn record(&self, latency_us: u64, success: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.latencies.record(latency_us);
    }

    fn snapshot(&self) -> OperationMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.summary();
        OperationMetrics {
            count: self.count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Requests the router sent to one shard.
#[derive(Debug)]
struct ShardStats {
    request_count: AtomicU64,
    last_request_ms: AtomicU64,
}

impl ShardStats {
    fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            last_request_ms: AtomicU64::new(now_ms()),
        }
    }

    fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.last_request_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            request_count: self.request_count.load(Ordering::Relaxed),
            last_request_ms: self.last_request_ms.load(Ordering::Relaxed),
        }
    }
}

/// Router-wide metrics storage.
///
/// Counter updates are lock-free atomics with relaxed ordering; snapshots
/// are best-effort and may observe counters mid-update. The operation and
/// shard maps sit behind `RwLock`s that are only write-locked when a new
/// label first appears or during eviction.
///
/// # Example
///
/// ```rust
/// use shardgate_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_operation("query", 150, true);
/// registry.record_shard_request("shard0");
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_operations, 1);
/// assert_eq!(snapshot.shards["shard0"].request_count, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    inserted_documents: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_closed: AtomicU64,
    cursors_timed_out: AtomicU64,
    operations: StdRwLock<HashMap<String, Arc<OperationStats>>>,
    shards: StdRwLock<HashMap<String, Arc<ShardStats>>>,
    start_time: Instant,
    config: MetricsConfig,
    shard_evictions_due: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total_operations: AtomicU64::new(0),
            successful_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            inserted_documents: AtomicU64::new(0),
            cursors_opened: AtomicU64::new(0),
            cursors_closed: AtomicU64::new(0),
            cursors_timed_out: AtomicU64::new(0),
            operations: StdRwLock::new(HashMap::new()),
            shards: StdRwLock::new(HashMap::new()),
            start_time: Instant::now(),
            config,
            shard_evictions_due: AtomicU64::new(0),
        }
    }

    /// Records one routed operation under `label`.
    ///
    /// Labels beyond `max_operations` are folded into the global counters
    /// only.
    pub fn record_operation(&self, label: &str, latency_us: u64, success: bool) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_operations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
        }

        let existing = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .cloned();
        let stats = match existing {
            Some(stats) => Some(stats),
            None => {
                let mut operations = self
                    .operations
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if operations.len() < self.config.max_operations
                    || operations.contains_key(label)
                {
                    Some(
                        operations
                            .entry(label.to_string())
                            .or_insert_with(|| Arc::new(OperationStats::new()))
                            .clone(),
                    )
                } else {
                    None
                }
            }
        };

        if let Some(stats) = stats {
            stats.record(latency_us, success);
        }
    }

    /// Records that a request was sent to `shard`.
    pub fn record_shard_request(&self, shard: &str) {
        const EVICTION_INTERVAL: u64 = 1024;
        if self.shard_evictions_due.fetch_add(1, Ordering::Relaxed) % EVICTION_INTERVAL == 0 {
            self.evict_stale_shards();
        }

        let stats = {
            let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
            shards
                .entry(shard.to_string())
                .or_insert_with(|| Arc::new(ShardStats::new()))
                .clone()
        };
        stats.record_request();
    }

    /// Drops shards idle past the TTL, then the least recently used ones
    /// while over `max_shards`.
    fn evict_stale_shards(&self) {
        let now = now_ms();
        let ttl_ms = self.config.shard_ttl_secs.saturating_mul(1000);
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);

        shards.retain(|_, stats| {
            now.saturating_sub(stats.last_request_ms.load(Ordering::Relaxed)) < ttl_ms
        });

        if shards.len() > self.config.max_shards {
            let mut by_age: Vec<(String, u64)> = shards
                .iter()
                .map(|(name, stats)| (name.clone(), stats.last_request_ms.load(Ordering::Relaxed)))
                .collect();
            by_age.sort_by_key(|&(_, last)| last);
            let excess = by_age.len() - self.config.max_shards;
            for (name, _) in by_age.into_iter().take(excess) {
                shards.remove(&name);
            }
        }
    }

    pub fn record_inserts(&self, n: u64) {
        self.inserted_documents.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_cursor_opened(&self) {
        self.cursors_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cursor_closed(&self) {
        self.cursors_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// A cursor was closed because its time budget ran out or it sat idle.
    pub fn record_cursor_timed_out(&self) {
        self.cursors_timed_out.fetch_add(1, Ordering::Relaxed);
        self.cursors_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(label, stats)| (label.clone(), stats.snapshot()))
            .collect();
        let shards = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        let opened = self.cursors_opened.load(Ordering::Relaxed);
        let closed = self.cursors_closed.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            successful_operations: self.successful_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            inserted_documents: self.inserted_documents.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            cursors: CursorMetrics {
                opened,
                closed,
                timed_out: self.cursors_timed_out.load(Ordering::Relaxed),
                open: opened.saturating_sub(closed),
            },
            operations,
            shards,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
