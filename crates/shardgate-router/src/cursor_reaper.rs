use crate::config::CursorConfig;
use crate::cursor_cache::CursorCache;
use shardgate_metrics::RouterMetricsCollector;
use std::sync::Arc;
use tracing::{debug, info};

/// Background task that closes merged cursors nobody has touched for
/// `idle_timeout`, and forgets pass-through references idle as long.
pub struct CursorReaper {
    cache: Arc<CursorCache>,
    metrics: Arc<RouterMetricsCollector>,
    config: CursorConfig,
}

impl CursorReaper {
    pub fn new(
        cache: Arc<CursorCache>,
        metrics: Arc<RouterMetricsCollector>,
        config: CursorConfig,
    ) -> Self {
        Self {
            cache,
            metrics,
            config,
        }
    }

    /// Starts the reaper task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.reap_interval());
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            self.reap_once().await;
        }
    }

    /// Closes every idle cursor once and returns how many entries, merged
    /// cursors and pass-through references together, were reclaimed.
    pub async fn reap_once(&self) -> usize {
        let idle = self.cache.remove_idle(self.config.idle_timeout()).await;
        let refs = self.cache.remove_idle_refs(self.config.idle_timeout()).await;
        let count = idle.len() + refs.len();

        for (id, host) in refs {
            debug!(cursor_id = id, host = %host, "forgetting idle pass-through cursor");
        }

        for (id, cursor) in idle {
            let mut cursor = cursor.lock().await;
            debug!(cursor_id = id, ns = %cursor.ns(), total_sent = cursor.total_sent(), "closing idle cursor");
            cursor.close().await;
            self.metrics.record_cursor_timed_out();
        }

        if count > 0 {
            info!("Reaped {} idle cursor(s)", count);
        }
        count
    }
}
